use criterion::{Criterion, criterion_group, criterion_main};
use std::ffi::c_void;
use zygisk_core::{
    HookRegistry, MapInfo, Result,
    plt::HookBackend,
};

struct NullBackend;

impl HookBackend for NullBackend {
    fn register(
        &mut self,
        _dev: u64,
        _inode: u64,
        _symbol: &str,
        _replacement: *mut c_void,
        _backup: *mut *mut c_void,
    ) -> bool {
        true
    }

    fn commit(&mut self, _maps: &[MapInfo]) -> Result<()> {
        Ok(())
    }
}

extern "C" fn replacement() {}

fn maps_benchmark(c: &mut Criterion) {
    let content = std::fs::read_to_string("/proc/self/maps").unwrap();
    c.bench_function("maps:parse_all", |b| {
        b.iter(|| MapInfo::parse_all(&content));
    });
    c.bench_function("maps:scan", |b| {
        b.iter(|| MapInfo::scan().unwrap());
    });
}

fn registry_benchmark(c: &mut Criterion) {
    let maps = MapInfo::scan().unwrap();
    let registry = HookRegistry::new(Box::new(NullBackend));
    c.bench_function("registry:commit_snapshot", |b| {
        b.iter(|| {
            for symbol in ["fork", "unshare", "open", "close"] {
                registry
                    .register(r"\.so$", symbol, replacement as *mut c_void, core::ptr::null_mut())
                    .unwrap();
            }
            registry.exclude(r"libc\.so", Some("open")).unwrap();
            registry.commit_snapshot(&maps).unwrap();
        });
    });
}

criterion_group!(benches, maps_benchmark, registry_benchmark);
criterion_main!(benches);
