//! Transfer hook installation
//!
//! The interception mechanism itself (function patching, import table
//! rewriting, a loader's hook API) lives outside this crate. It is reached
//! through [`HookInstaller`], which hands back an [`InstalledHook`]
//! capability; removing the hook goes back through that capability rather
//! than touching code addresses directly.
//!
//! [`DispatchTable`] is the in-process installer: a transfer path with a
//! swappable hook slot in front of the original transfer path.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::device::{DeviceHandle, TransferPath, TransferResult};

/// Handlers invoked in place of the original read/write
///
/// The original path is passed on every call so a handler can forward
/// transfers it does not want to serve.
pub trait TransferHook: Send + Sync {
    fn read(
        &self,
        original: &dyn TransferPath,
        handle: DeviceHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransferResult;

    fn write(
        &self,
        original: &dyn TransferPath,
        handle: DeviceHandle,
        buf: &[u8],
        timeout: Duration,
    ) -> TransferResult;
}

/// Installs transfer hooks
pub trait HookInstaller: Send + Sync {
    fn install(&self, hook: Arc<dyn TransferHook>) -> Result<Box<dyn InstalledHook>, HookError>;
}

/// Capability for an installed hook
pub trait InstalledHook: Send {
    /// Restore the original routing
    fn remove(self: Box<Self>);
}

// ============================================================================
// Dispatch Table
// ============================================================================

type HookSlot = RwLock<Option<Arc<dyn TransferHook>>>;

/// Original transfer path with a single hook slot in front of it
#[derive(Clone)]
pub struct DispatchTable {
    original: Arc<dyn TransferPath>,
    slot: Arc<HookSlot>,
}

impl DispatchTable {
    pub fn new(original: Arc<dyn TransferPath>) -> Self {
        Self {
            original,
            slot: Arc::new(RwLock::new(None)),
        }
    }

    /// Check if a hook is currently installed
    pub fn is_hooked(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn current_hook(&self) -> Option<Arc<dyn TransferHook>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TransferPath for DispatchTable {
    fn read(&self, handle: DeviceHandle, buf: &mut [u8], timeout: Duration) -> TransferResult {
        match self.current_hook() {
            Some(hook) => hook.read(self.original.as_ref(), handle, buf, timeout),
            None => self.original.read(handle, buf, timeout),
        }
    }

    fn write(&self, handle: DeviceHandle, buf: &[u8], timeout: Duration) -> TransferResult {
        match self.current_hook() {
            Some(hook) => hook.write(self.original.as_ref(), handle, buf, timeout),
            None => self.original.write(handle, buf, timeout),
        }
    }
}

impl HookInstaller for DispatchTable {
    fn install(&self, hook: Arc<dyn TransferHook>) -> Result<Box<dyn InstalledHook>, HookError> {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(HookError::AlreadyInstalled);
        }
        *slot = Some(hook);

        tracing::debug!("Transfer hook installed in dispatch table");
        Ok(Box::new(DispatchHook {
            slot: Arc::clone(&self.slot),
        }))
    }
}

/// Token for a hook installed in a [`DispatchTable`]
struct DispatchHook {
    slot: Arc<HookSlot>,
}

impl InstalledHook for DispatchHook {
    fn remove(self: Box<Self>) {
        self.slot
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        tracing::debug!("Transfer hook removed from dispatch table");
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Hook installation error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// A hook already occupies the slot
    AlreadyInstalled,
    /// The interception mechanism could not be used
    Unavailable(String),
}

impl std::fmt::Display for HookError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HookError::AlreadyInstalled => write!(f, "Transfer hook already installed"),
            HookError::Unavailable(msg) => write!(f, "Hook installation unavailable: {}", msg),
        }
    }
}

impl std::error::Error for HookError {}
