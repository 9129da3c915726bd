//! Device identity and the real transfer path
//!
//! Every intercepted transfer carries an opaque [`DeviceHandle`]. The routing
//! engine only cares whether that handle resolves to the portal's
//! vendor/product pair; everything else is passed straight through to the
//! original [`TransferPath`].

use std::fmt;
use std::time::Duration;

/// Spyro portal vendor ID (Activision / RedOctane)
pub const PORTAL_VENDOR_ID: u16 = 0x1430;

/// Spyro portal product ID
pub const PORTAL_PRODUCT_ID: u16 = 0x0150;

/// USB vendor/product pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl DeviceIdentity {
    pub const fn new(vendor_id: u16, product_id: u16) -> Self {
        Self { vendor_id, product_id }
    }

    /// The portal identity used when no override is configured
    pub const fn portal() -> Self {
        Self::new(PORTAL_VENDOR_ID, PORTAL_PRODUCT_ID)
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::portal()
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)
    }
}

/// Opaque handle the caller passes with each transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i32);

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error code returned by the real device path
///
/// The value is never interpreted here, only forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError(pub i32);

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device error {}", self.0)
    }
}

impl std::error::Error for DeviceError {}

/// Result of a single read or write transfer (bytes transferred)
pub type TransferResult = Result<usize, DeviceError>;

/// The original, un-intercepted read/write implementation
pub trait TransferPath: Send + Sync {
    fn read(&self, handle: DeviceHandle, buf: &mut [u8], timeout: Duration) -> TransferResult;
    fn write(&self, handle: DeviceHandle, buf: &[u8], timeout: Duration) -> TransferResult;
}

/// Maps a transfer's handle to the identity of the device behind it
pub trait IdentityResolver: Send + Sync {
    /// `None` when the handle is unknown; that is routed as pass-through.
    fn identity_of(&self, handle: DeviceHandle) -> Option<DeviceIdentity>;
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => write!(f, "read"),
            Direction::Write => write!(f, "write"),
        }
    }
}

/// Per-call context for one intercepted transfer
#[derive(Debug, Clone, Copy)]
pub struct CallContext {
    pub handle: DeviceHandle,
    pub direction: Direction,
    pub requested_len: usize,
    pub timeout: Duration,
}

impl CallContext {
    pub fn read(handle: DeviceHandle, requested_len: usize, timeout: Duration) -> Self {
        Self { handle, direction: Direction::Read, requested_len, timeout }
    }

    pub fn write(handle: DeviceHandle, requested_len: usize, timeout: Duration) -> Self {
        Self { handle, direction: Direction::Write, requested_len, timeout }
    }
}
