//! Performance benchmarks for ipcreg
//!
//! Run with: cargo bench --package ipcreg-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ipcreg_core::shm::SharedMemory;
use ipcreg_core::{IpcRuntime, RawIpcHandle, Registry, RegistryConfig, Result, IPC_HANDLE_SIZE};
use std::sync::Arc;
use std::time::SystemTime;

struct FakeRuntime;

impl IpcRuntime for FakeRuntime {
    fn get_ipc_handle(&self, aligned_ptr: u64) -> Result<RawIpcHandle> {
        let mut handle = [0u8; IPC_HANDLE_SIZE];
        handle[..8].copy_from_slice(&aligned_ptr.to_le_bytes());
        Ok(handle)
    }
}

fn unique_name() -> String {
    let ts = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("/ipcreg_bench_{}", ts)
}

fn registry() -> (Registry, String) {
    let name = unique_name();
    let config = RegistryConfig::default().with_shm_name(&name);
    (Registry::new(config, Arc::new(FakeRuntime)), name)
}

fn bench_segment_attach(c: &mut Criterion) {
    let (owner, _name) = registry();
    owner.segment().unwrap();

    c.bench_function("segment_attach", |b| {
        b.iter(|| {
            let reg = Registry::new(owner.config().clone(), Arc::new(FakeRuntime));
            black_box(reg.segment().unwrap());
        });
    });
}

fn bench_register_overwrite(c: &mut Criterion) {
    let (reg, _name) = registry();

    c.bench_function("register_overwrite", |b| {
        b.iter(|| {
            reg.register(black_box(0x7f00_0010_0000), 4096, "hot").unwrap();
        });
    });
}

fn bench_register_deregister(c: &mut Criterion) {
    let (reg, _name) = registry();
    // 保持 itemcount > 0，避免每次迭代都 teardown
    reg.register(0x1000, 1, "anchor").unwrap();

    c.bench_function("register_deregister", |b| {
        b.iter(|| {
            reg.register(0x7f00_0010_0000, 4096, "cycle").unwrap();
            reg.deregister("cycle").unwrap();
        });
    });
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_once");

    for fill in [1usize, 256, 768].iter() {
        let (reg, _name) = registry();
        for i in 0..*fill {
            reg.register(0x1000, i as u64, &format!("key_{}", i)).unwrap();
        }

        group.bench_with_input(BenchmarkId::new("hit", fill), fill, |b, _| {
            b.iter(|| black_box(reg.lookup_once("key_0").unwrap()));
        });
        group.bench_with_input(BenchmarkId::new("miss", fill), fill, |b, _| {
            b.iter(|| black_box(reg.lookup_once("absent").is_err()));
        });
    }
    group.finish();
}

fn bench_check_exists(c: &mut Criterion) {
    let (reg, name) = registry();
    reg.register(0x1000, 1, "present").unwrap();

    c.bench_function("check_exists", |b| {
        b.iter(|| black_box(reg.check_exists("present")));
    });

    drop(reg);
    let _ = SharedMemory::unlink(&name);
}

criterion_group!(
    benches,
    bench_segment_attach,
    bench_register_overwrite,
    bench_register_deregister,
    bench_lookup,
    bench_check_exists
);
criterion_main!(benches);
