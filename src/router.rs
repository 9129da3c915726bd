//! Transfer routing
//!
//! Decides, per intercepted transfer, whether the call is forwarded to the
//! real device or served from the figure dump:
//!
//! 1. Emulation disabled: forward unchanged.
//! 2. Handle does not resolve to the portal identity: forward unchanged.
//! 3. Otherwise serve from the dump and report the full requested length.
//!
//! Emulated transfers always succeed. The consumer protocol has no notion of
//! a short or failed transfer, so missing data is presented as zeros.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::device::{
    CallContext, DeviceHandle, DeviceIdentity, IdentityResolver, TransferPath, TransferResult,
};
use crate::dump::{DumpBuffer, DumpError, DumpStore};
use crate::hooks::TransferHook;
use crate::state::{self, EmulationState, SharedEmulation};

/// Routing decision for one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Forward to the real device path
    PassThrough,
    /// Serve from the figure dump
    Emulate,
}

/// Routing engine installed as the transfer hook
pub struct Interceptor {
    /// Identity of the emulated peripheral
    identity: DeviceIdentity,
    resolver: Arc<dyn IdentityResolver>,
    state: SharedEmulation,
    store: DumpStore,
    /// Serializes snapshot-and-persist so older snapshots never overwrite newer ones
    persist_lock: Mutex<()>,
}

impl Interceptor {
    pub fn new(
        identity: DeviceIdentity,
        resolver: Arc<dyn IdentityResolver>,
        state: SharedEmulation,
        store: DumpStore,
    ) -> Self {
        Self {
            identity,
            resolver,
            state,
            store,
            persist_lock: Mutex::new(()),
        }
    }

    /// Decide how a transfer is routed
    ///
    /// `resolved` is looked up before the state lock is taken, so a slow
    /// resolver never holds up concurrent transfers.
    fn route(
        &self,
        ctx: &CallContext,
        resolved: Option<DeviceIdentity>,
        state: &EmulationState,
    ) -> Route {
        let route = if state.enabled && resolved == Some(self.identity) {
            Route::Emulate
        } else {
            Route::PassThrough
        };

        tracing::trace!(
            handle = %ctx.handle,
            direction = %ctx.direction,
            len = ctx.requested_len,
            route = ?route,
            "Routed transfer"
        );
        route
    }

    /// Serve a read from the dump
    fn emulate_read(state: &EmulationState, buf: &mut [u8]) {
        match state.dump.as_ref() {
            Some(dump) if !dump.is_empty() => {
                let copied = dump.read_into(buf);
                tracing::trace!(requested = buf.len(), copied, "Emulated read");
            }
            _ => {
                buf.fill(0);
                tracing::trace!(requested = buf.len(), "Emulated read with no dump, zero-filled");
            }
        }
    }

    /// Apply a write to the dump, returning the snapshot to persist
    fn emulate_write(state: &mut EmulationState, buf: &[u8]) -> Option<DumpBuffer> {
        let Some(dump) = state.dump_for_write() else {
            tracing::debug!(requested = buf.len(), "Write after release dropped");
            return None;
        };

        let written = dump.write_at(0, buf);
        tracing::trace!(requested = buf.len(), written, "Emulated write");
        Some(dump.clone())
    }

    /// Persist the dump a final time and release it
    ///
    /// Serialized with in-flight writes, so no older snapshot can land on
    /// disk after this one. Writes still in flight afterwards are dropped.
    pub fn flush_and_release(&self) -> Result<(), DumpError> {
        let _persisting = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let released = state::lock(&self.state).release();
        match released {
            Some(dump) => self.store.persist(&dump),
            None => Err(DumpError::NothingToPersist),
        }
    }
}

impl TransferHook for Interceptor {
    fn read(
        &self,
        original: &dyn TransferPath,
        handle: DeviceHandle,
        buf: &mut [u8],
        timeout: Duration,
    ) -> TransferResult {
        let ctx = CallContext::read(handle, buf.len(), timeout);
        let resolved = self.resolver.identity_of(handle);

        {
            let state = state::lock(&self.state);
            if self.route(&ctx, resolved, &state) == Route::Emulate {
                Self::emulate_read(&state, buf);
                return Ok(buf.len());
            }
        }
        original.read(handle, buf, timeout)
    }

    fn write(
        &self,
        original: &dyn TransferPath,
        handle: DeviceHandle,
        buf: &[u8],
        timeout: Duration,
    ) -> TransferResult {
        let ctx = CallContext::write(handle, buf.len(), timeout);
        let resolved = self.resolver.identity_of(handle);

        let persisting = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = state::lock(&self.state);
        if self.route(&ctx, resolved, &state) == Route::PassThrough {
            drop(state);
            drop(persisting);
            return original.write(handle, buf, timeout);
        }

        let snapshot = Self::emulate_write(&mut state, buf);
        drop(state);

        if let Some(snapshot) = snapshot {
            if let Err(e) = self.store.persist(&snapshot) {
                tracing::warn!(error = %e, "Failed to persist figure dump after write");
            }
        }
        drop(persisting);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::dump::MAX_DUMP_SIZE;
    use crate::state::new_shared_state;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PORTAL: DeviceHandle = DeviceHandle(1);
    const KEYBOARD: DeviceHandle = DeviceHandle(2);
    const UNKNOWN: DeviceHandle = DeviceHandle(99);

    struct TwoDevices;

    impl IdentityResolver for TwoDevices {
        fn identity_of(&self, handle: DeviceHandle) -> Option<DeviceIdentity> {
            match handle {
                PORTAL => Some(DeviceIdentity::portal()),
                KEYBOARD => Some(DeviceIdentity::new(0x046D, 0xC31C)),
                _ => None,
            }
        }
    }

    /// Real path that counts calls and always fails
    #[derive(Default)]
    struct FailingPath {
        calls: AtomicUsize,
    }

    impl TransferPath for FailingPath {
        fn read(&self, _: DeviceHandle, _: &mut [u8], _: Duration) -> TransferResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DeviceError(-7))
        }

        fn write(&self, _: DeviceHandle, _: &[u8], _: Duration) -> TransferResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(DeviceError(-8))
        }
    }

    fn interceptor(dir: &tempfile::TempDir, enabled: bool) -> Interceptor {
        Interceptor::new(
            DeviceIdentity::portal(),
            Arc::new(TwoDevices),
            new_shared_state(enabled),
            DumpStore::on_disk(dir.path().join("dump.bin")),
        )
    }

    fn set_dump(hook: &Interceptor, bytes: Vec<u8>) {
        state::lock(&hook.state).dump = Some(DumpBuffer::from_bytes(bytes).unwrap());
    }

    #[test]
    fn test_route_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        let route = |h| {
            let state = state::lock(&hook.state);
            let ctx = CallContext::read(h, 8, Duration::ZERO);
            hook.route(&ctx, hook.resolver.identity_of(h), &state)
        };

        assert_eq!(route(PORTAL), Route::Emulate);
        assert_eq!(route(KEYBOARD), Route::PassThrough);
        assert_eq!(route(UNKNOWN), Route::PassThrough);

        state::lock(&hook.state).enabled = false;
        assert_eq!(route(PORTAL), Route::PassThrough);
    }

    #[test]
    fn test_disabled_forwards_errors_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, false);
        let real = FailingPath::default();
        set_dump(&hook, vec![1, 2, 3]);

        let mut buf = [0u8; 4];
        assert_eq!(hook.read(&real, PORTAL, &mut buf, Duration::ZERO), Err(DeviceError(-7)));
        assert_eq!(hook.write(&real, PORTAL, &[9; 4], Duration::ZERO), Err(DeviceError(-8)));
        assert_eq!(real.calls.load(Ordering::SeqCst), 2);

        // Dump untouched and nothing persisted
        assert_eq!(state::lock(&hook.state).dump.as_ref().unwrap().as_bytes(), &[1, 2, 3]);
        assert!(!hook.store.path().exists());
    }

    #[test]
    fn test_other_device_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        let real = FailingPath::default();

        let mut buf = [0u8; 4];
        assert_eq!(hook.read(&real, KEYBOARD, &mut buf, Duration::ZERO), Err(DeviceError(-7)));
        assert_eq!(hook.write(&real, UNKNOWN, &buf, Duration::ZERO), Err(DeviceError(-8)));
        assert_eq!(real.calls.load(Ordering::SeqCst), 2);
        assert!(state::lock(&hook.state).dump.is_none());
    }

    #[test]
    fn test_read_without_dump_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        let real = FailingPath::default();

        let mut buf = [0xFFu8; 16];
        assert_eq!(hook.read(&real, PORTAL, &mut buf, Duration::ZERO), Ok(16));
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(real.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_read_with_empty_dump_is_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        set_dump(&hook, Vec::new());

        let mut buf = [0xFFu8; 8];
        assert_eq!(hook.read(&FailingPath::default(), PORTAL, &mut buf, Duration::ZERO), Ok(8));
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_read_copies_prefix_and_pads() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        let real = FailingPath::default();
        set_dump(&hook, vec![1, 2, 3, 4]);

        let mut short = [0xFFu8; 3];
        assert_eq!(hook.read(&real, PORTAL, &mut short, Duration::ZERO), Ok(3));
        assert_eq!(short, [1, 2, 3]);

        let mut long = [0xFFu8; 6];
        assert_eq!(hook.read(&real, PORTAL, &mut long, Duration::ZERO), Ok(6));
        assert_eq!(long, [1, 2, 3, 4, 0, 0]);
    }

    #[test]
    fn test_write_overwrites_prefix_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        let real = FailingPath::default();
        set_dump(&hook, vec![0xAA; 8]);

        assert_eq!(hook.write(&real, PORTAL, &[1, 2, 3], Duration::ZERO), Ok(3));
        let expected = [1, 2, 3, 0xAA, 0xAA, 0xAA, 0xAA, 0xAA];
        assert_eq!(state::lock(&hook.state).dump.as_ref().unwrap().as_bytes(), &expected);
        assert_eq!(std::fs::read(hook.store.path()).unwrap(), expected);
    }

    #[test]
    fn test_oversized_write_is_clamped_but_fully_reported() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        set_dump(&hook, vec![0; 4]);

        let data = [5u8; 10];
        assert_eq!(hook.write(&FailingPath::default(), PORTAL, &data, Duration::ZERO), Ok(10));
        let state = state::lock(&hook.state);
        assert_eq!(state.dump.as_ref().unwrap().as_bytes(), &[5, 5, 5, 5]);
    }

    #[test]
    fn test_write_without_dump_allocates_max_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);

        assert_eq!(hook.write(&FailingPath::default(), PORTAL, &[7, 7], Duration::ZERO), Ok(2));
        assert_eq!(state::lock(&hook.state).dump_len(), MAX_DUMP_SIZE);

        let persisted = std::fs::read(hook.store.path()).unwrap();
        assert_eq!(persisted.len(), MAX_DUMP_SIZE);
        assert_eq!(&persisted[..3], &[7, 7, 0]);
    }

    #[test]
    fn test_flush_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        set_dump(&hook, vec![4, 5, 6]);

        hook.flush_and_release().unwrap();
        assert!(state::lock(&hook.state).dump.is_none());
        assert_eq!(std::fs::read(hook.store.path()).unwrap(), vec![4, 5, 6]);

        assert!(matches!(hook.flush_and_release(), Err(DumpError::NothingToPersist)));
    }

    #[test]
    fn test_write_after_release_keeps_flushed_dump() {
        let dir = tempfile::tempdir().unwrap();
        let hook = interceptor(&dir, true);
        let real = FailingPath::default();
        state::lock(&hook.state).dump = Some(DumpBuffer::synthesize_default());

        hook.flush_and_release().unwrap();
        let flushed = std::fs::read(hook.store.path()).unwrap();
        assert_eq!(flushed.len(), 512);

        // A write already past the hook slot when stop ran
        assert_eq!(hook.write(&real, PORTAL, &[1, 2], Duration::ZERO), Ok(2));
        assert_eq!(real.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state::lock(&hook.state).dump_len(), 0);
        assert_eq!(std::fs::read(hook.store.path()).unwrap(), flushed);

        let mut buf = [0xFFu8; 4];
        assert_eq!(hook.read(&real, PORTAL, &mut buf, Duration::ZERO), Ok(4));
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn test_persist_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // Parent "directory" is a regular file, so every persist fails
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let hook = Interceptor::new(
            DeviceIdentity::portal(),
            Arc::new(TwoDevices),
            new_shared_state(true),
            DumpStore::on_disk(blocker.join("dump.bin")),
        );

        assert_eq!(hook.write(&FailingPath::default(), PORTAL, &[1], Duration::ZERO), Ok(1));
        assert_eq!(state::lock(&hook.state).dump.as_ref().unwrap().as_bytes()[0], 1);
    }
}
