//! Linux hidraw backend
//!
//! Provides the real transfer path over `/dev/hidrawN` and resolves device
//! identities from `/sys/class/hidraw/hidrawN/device/uevent`. A
//! [`DeviceHandle`] of `N` addresses `hidrawN`.
//!
//! SPDX-License-Identifier: GPL-3.0

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::device::{DeviceError, DeviceHandle, DeviceIdentity, IdentityResolver, TransferPath, TransferResult};

/// sysfs class directory for hidraw nodes
pub const HIDRAW_SYSFS_DIR: &str = "/sys/class/hidraw";

/// Parse `HID_ID=bbbb:vvvvvvvv:pppppppp` from a uevent file
pub fn parse_hid_id(uevent: &str) -> Option<DeviceIdentity> {
    let value = uevent
        .lines()
        .find_map(|line| line.trim().strip_prefix("HID_ID="))?;

    let mut fields = value.split(':');
    let _bus = fields.next()?;
    let vendor = u32::from_str_radix(fields.next()?, 16).ok()?;
    let product = u32::from_str_radix(fields.next()?, 16).ok()?;

    Some(DeviceIdentity::new(
        u16::try_from(vendor).ok()?,
        u16::try_from(product).ok()?,
    ))
}

/// Parse `HID_NAME=` from a uevent file
pub fn parse_hid_name(uevent: &str) -> Option<&str> {
    uevent
        .lines()
        .find_map(|line| line.trim().strip_prefix("HID_NAME="))
}

/// Information about a hidraw node
#[derive(Debug, Clone)]
pub struct HidrawInfo {
    /// Handle addressing this node
    pub handle: DeviceHandle,
    /// Path to the device node (e.g., /dev/hidraw3)
    pub path: PathBuf,
    /// Device name as reported by the kernel
    pub name: String,
    pub identity: DeviceIdentity,
}

/// List hidraw nodes with a parseable identity
pub fn list_devices() -> io::Result<Vec<HidrawInfo>> {
    list_devices_in(Path::new(HIDRAW_SYSFS_DIR))
}

fn list_devices_in(sysfs_dir: &Path) -> io::Result<Vec<HidrawInfo>> {
    let mut devices = Vec::new();

    for entry in std::fs::read_dir(sysfs_dir)?.flatten() {
        let node = entry.file_name();
        let Some(handle) = node.to_str().and_then(handle_from_node) else {
            continue;
        };

        let uevent = match std::fs::read_to_string(entry.path().join("device/uevent")) {
            Ok(uevent) => uevent,
            Err(e) => {
                tracing::debug!(node = ?node, error = %e, "Could not read hidraw uevent");
                continue;
            }
        };

        if let Some(identity) = parse_hid_id(&uevent) {
            devices.push(HidrawInfo {
                handle,
                path: PathBuf::from("/dev").join(&node),
                name: parse_hid_name(&uevent).unwrap_or("Unknown").to_string(),
                identity,
            });
        }
    }

    devices.sort_by_key(|d| d.handle.0);
    Ok(devices)
}

/// `hidraw7` -> handle 7
fn handle_from_node(node: &str) -> Option<DeviceHandle> {
    node.strip_prefix("hidraw")?.parse().ok().map(DeviceHandle)
}

// ============================================================================
// Identity Resolver
// ============================================================================

/// Resolves handles through sysfs, caching each successful lookup
///
/// Misses are not cached: a portal plugged in later must still resolve.
pub struct SysfsResolver {
    sysfs_dir: PathBuf,
    cache: Mutex<HashMap<DeviceHandle, DeviceIdentity>>,
}

impl SysfsResolver {
    pub fn new() -> Self {
        Self::with_root(HIDRAW_SYSFS_DIR)
    }

    /// Resolver reading from an alternate sysfs class directory
    pub fn with_root<P: Into<PathBuf>>(sysfs_dir: P) -> Self {
        Self {
            sysfs_dir: sysfs_dir.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn lookup(&self, handle: DeviceHandle) -> Option<DeviceIdentity> {
        let uevent_path = self
            .sysfs_dir
            .join(format!("hidraw{}", handle.0))
            .join("device/uevent");
        let uevent = std::fs::read_to_string(&uevent_path).ok()?;
        parse_hid_id(&uevent)
    }
}

impl Default for SysfsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver for SysfsResolver {
    fn identity_of(&self, handle: DeviceHandle) -> Option<DeviceIdentity> {
        if handle.0 < 0 {
            return None;
        }

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(identity) = cache.get(&handle) {
            return Some(*identity);
        }

        let identity = self.lookup(handle)?;
        tracing::debug!(%handle, %identity, "Resolved hidraw identity");
        cache.insert(handle, identity);
        Some(identity)
    }
}

// ============================================================================
// Transfer Path
// ============================================================================

/// Real read/write over hidraw device nodes
#[derive(Default)]
pub struct HidrawTransfer {
    devices: Mutex<HashMap<DeviceHandle, Arc<File>>>,
}

impl HidrawTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or reuse) the node behind a handle
    fn device(&self, handle: DeviceHandle) -> Result<Arc<File>, DeviceError> {
        if handle.0 < 0 {
            return Err(DeviceError(-libc::EBADF));
        }

        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = devices.get(&handle) {
            return Ok(Arc::clone(file));
        }

        let path = PathBuf::from(format!("/dev/hidraw{}", handle.0));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::PermissionDenied {
                    tracing::error!(
                        "Permission denied opening {:?}. Make sure udev rules are installed.",
                        path
                    );
                }
                errno(&e)
            })?;

        tracing::info!(path = %path.display(), "Opened hidraw device");
        let file = Arc::new(file);
        devices.insert(handle, Arc::clone(&file));
        Ok(file)
    }

    /// Forget a handle after an I/O failure so the next call reopens it
    fn evict(&self, handle: DeviceHandle) {
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
    }
}

impl TransferPath for HidrawTransfer {
    fn read(&self, handle: DeviceHandle, buf: &mut [u8], timeout: Duration) -> TransferResult {
        let file = self.device(handle)?;
        wait_readable(&file, timeout)?;

        (&*file).read(buf).map_err(|e| {
            tracing::warn!(%handle, error = %e, "hidraw read failed");
            self.evict(handle);
            errno(&e)
        })
    }

    fn write(&self, handle: DeviceHandle, buf: &[u8], _timeout: Duration) -> TransferResult {
        let file = self.device(handle)?;

        (&*file).write(buf).map_err(|e| {
            tracing::warn!(%handle, error = %e, "hidraw write failed");
            self.evict(handle);
            errno(&e)
        })
    }
}

/// Block until the node has a report or the timeout elapses
fn wait_readable(file: &File, timeout: Duration) -> Result<(), DeviceError> {
    let mut pollfd = libc::pollfd {
        fd: file.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

    // SAFETY: pollfd is a valid, initialized struct and nfds is 1
    let ready = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    match ready {
        0 => Err(DeviceError(-libc::ETIMEDOUT)),
        n if n < 0 => Err(errno(&io::Error::last_os_error())),
        _ => Ok(()),
    }
}

/// Negative errno for an I/O error
fn errno(e: &io::Error) -> DeviceError {
    DeviceError(-e.raw_os_error().unwrap_or(libc::EIO))
}
