//! portald - toy portal emulation library
//!
//! Intercepts read/write transfers aimed at a USB portal and serves them from
//! a persisted figure dump. A button combo toggles emulation at runtime.
//!
//! Public API for testing and integration.

pub mod combo;
pub mod config;
pub mod device;
pub mod dump;
pub mod hidraw;
pub mod hooks;
pub mod lifecycle;
pub mod router;
pub mod state;

/// Re-export commonly used types
pub use combo::{ButtonSource, ComboMonitor, ComboSettings, MonitorHandle};
pub use config::{Config, ConfigError};
pub use device::{
    CallContext, DeviceError, DeviceHandle, DeviceIdentity, Direction, IdentityResolver,
    TransferPath, TransferResult, PORTAL_PRODUCT_ID, PORTAL_VENDOR_ID,
};
pub use dump::{DumpBuffer, DumpError, DumpStore, FsStorage, Storage, MAX_DUMP_SIZE};
pub use hidraw::{HidrawTransfer, SysfsResolver};
pub use hooks::{DispatchTable, HookError, HookInstaller, InstalledHook, TransferHook};
pub use lifecycle::{Collaborators, Plugin, PluginOptions, StartError};
pub use router::{Interceptor, Route};
pub use state::{new_shared_state, EmulationEvent, EmulationState, SharedEmulation};
