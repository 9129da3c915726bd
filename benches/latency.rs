//! Per-call latency of routed transfers

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use portald::{
    new_shared_state, DeviceError, DeviceHandle, DeviceIdentity, DispatchTable, DumpBuffer,
    DumpStore, HookInstaller, IdentityResolver, Interceptor, Storage, TransferPath,
    TransferResult,
};

struct Portal;

impl IdentityResolver for Portal {
    fn identity_of(&self, _handle: DeviceHandle) -> Option<DeviceIdentity> {
        Some(DeviceIdentity::portal())
    }
}

struct Other;

impl IdentityResolver for Other {
    fn identity_of(&self, _handle: DeviceHandle) -> Option<DeviceIdentity> {
        Some(DeviceIdentity::new(0x046D, 0xC52B))
    }
}

struct Loopback;

impl TransferPath for Loopback {
    fn read(&self, _: DeviceHandle, buf: &mut [u8], _: Duration) -> TransferResult {
        Ok(buf.len())
    }

    fn write(&self, _: DeviceHandle, _: &[u8], _: Duration) -> TransferResult {
        Err(DeviceError(-5))
    }
}

/// Storage that accepts writes without touching disk
struct NullStorage;

impl Storage for NullStorage {
    fn read(&self, path: &std::path::Path, _limit: usize) -> std::io::Result<Vec<u8>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            path.display().to_string(),
        ))
    }

    fn write(&self, _path: &std::path::Path, _data: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

fn hooked_table(resolver: Arc<dyn IdentityResolver>) -> DispatchTable {
    let table = DispatchTable::new(Arc::new(Loopback));
    let state = new_shared_state(true);
    portald::state::lock(&state).dump = Some(DumpBuffer::synthesize_default());

    let store = DumpStore::new("bench.bin", Arc::new(NullStorage));
    let interceptor = Arc::new(Interceptor::new(DeviceIdentity::portal(), resolver, state, store));

    // Stays installed until the token's remove() is called
    let _hook = table.install(interceptor).expect("fresh table");
    table
}

fn bench_transfers(c: &mut Criterion) {
    let handle = DeviceHandle(0);
    let timeout = Duration::from_millis(10);

    let emulated = hooked_table(Arc::new(Portal));
    let passthrough = hooked_table(Arc::new(Other));

    c.bench_function("emulated_read_64", |b| {
        let mut buf = [0u8; 64];
        b.iter(|| emulated.read(black_box(handle), &mut buf, timeout))
    });

    c.bench_function("emulated_read_1024", |b| {
        let mut buf = [0u8; 1024];
        b.iter(|| emulated.read(black_box(handle), &mut buf, timeout))
    });

    c.bench_function("emulated_write_64", |b| {
        let data = [0x42u8; 64];
        b.iter(|| emulated.write(black_box(handle), &data, timeout))
    });

    c.bench_function("passthrough_read_64", |b| {
        let mut buf = [0u8; 64];
        b.iter(|| passthrough.read(black_box(handle), &mut buf, timeout))
    });
}

criterion_group!(benches, bench_transfers);
criterion_main!(benches);
