mod common;

use common::{
    AppArgsStorage, FAKE_ORIGINAL, Harness, RecordingRegistrar, Script, UNLOAD_TAIL, extensions,
    runtime_maps, script,
};
use std::{
    ffi::c_void,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use zygisk_core::{
    HookSpec, LoaderConfig, Phase, ProcessFlags, SpecializeEvent, SpecializeReport,
    native::NativeMethod,
};

extern "C" fn replacement() {}

fn runtime_hook(backup: &'static AtomicUsize) -> HookSpec {
    HookSpec::new("fork", replacement as *const c_void, backup)
}

fn fork_child(harness: &Harness) -> SpecializeReport {
    let mut storage = AppArgsStorage::with_uid(10200);
    let mut args = storage.args();
    let mut fds_to_ignore = None;
    harness.loader.specialize(
        SpecializeEvent::AppForkAndSpecialize {
            args: &mut args,
            fds_to_ignore: &mut fds_to_ignore,
        },
        |_| {},
    )
}

#[test]
fn extension_can_request_loader_unload() {
    let harness = Harness::with_config(
        LoaderConfig::default().self_unload(false),
        ProcessFlags::empty(),
        vec![extensions::scripted_entry],
    );
    script(Script {
        version: 4,
        options: vec![2],
        ..Script::default()
    });

    let report = fork_child(&harness);

    assert!(report.unload_scheduled);
    assert_eq!(report.phases[report.phases.len() - 2..], [Phase::Unloading, Phase::Terminal]);
    assert!(harness.loader.should_unmap());

    assert_eq!(harness.loader.on_unload_hook_in(&runtime_maps()), Some(UNLOAD_TAIL));
    assert_eq!(harness.unloads.0.load(Ordering::SeqCst), 1);
    assert!(!harness.loader.should_unmap());

    // Only the first call after scheduling unloads.
    assert_eq!(harness.loader.on_unload_hook_in(&runtime_maps()), None);
    assert_eq!(harness.unloads.0.load(Ordering::SeqCst), 1);
}

#[test]
fn unloads_after_child_by_default() {
    let harness = Harness::new(ProcessFlags::empty(), vec![]);
    let report = fork_child(&harness);

    assert!(report.unload_scheduled);
    assert!(report.phases.contains(&Phase::Unloading));
    assert_eq!(harness.loader.on_unload_hook_in(&runtime_maps()), Some(UNLOAD_TAIL));
}

#[test]
fn no_unload_unless_requested() {
    let harness = Harness::with_config(
        LoaderConfig::default().self_unload(false),
        ProcessFlags::empty(),
        vec![],
    );
    let report = fork_child(&harness);

    assert!(!report.unload_scheduled);
    assert!(!harness.loader.should_unmap());
    assert_eq!(harness.loader.on_unload_hook_in(&runtime_maps()), None);
    assert_eq!(harness.unloads.0.load(Ordering::SeqCst), 0);
}

#[test]
fn unload_reverses_installed_hooks() {
    static BACKUP: AtomicUsize = AtomicUsize::new(0);
    let harness = Harness::with_config(
        LoaderConfig::default().self_unload(true),
        ProcessFlags::empty(),
        vec![],
    );
    let maps = runtime_maps();

    let recorded = harness
        .loader
        .hook_image_in(&maps, "libandroid_runtime.so", &[runtime_hook(&BACKUP)])
        .unwrap();
    assert_eq!(recorded, 1);
    assert_eq!(BACKUP.load(Ordering::SeqCst), FAKE_ORIGINAL);
    let installed = harness.loader.installed_hooks();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].original, FAKE_ORIGINAL);
    assert_eq!(installed[0].dev, maps[1].dev);
    assert_eq!(installed[0].inode, 4242);

    assert!(fork_child(&harness).unload_scheduled);
    assert_eq!(harness.loader.on_unload_hook_in(&maps), Some(UNLOAD_TAIL));

    let state = harness.backend.state();
    let restore = state.applied.last().unwrap();
    assert_eq!(restore.symbol, "fork");
    assert_eq!(restore.replacement, FAKE_ORIGINAL);
    assert_eq!(restore.backup, 0);
    drop(state);
    assert!(harness.loader.installed_hooks().is_empty());
    assert_eq!(harness.unloads.0.load(Ordering::SeqCst), 1);
}

#[test]
fn unload_abandoned_when_reversal_fails() {
    static BACKUP: AtomicUsize = AtomicUsize::new(0);
    let harness = Harness::with_config(
        LoaderConfig::default().self_unload(true),
        ProcessFlags::empty(),
        vec![],
    );
    harness
        .loader
        .hook_image_in(&runtime_maps(), "libandroid_runtime.so", &[runtime_hook(&BACKUP)])
        .unwrap();
    assert!(fork_child(&harness).unload_scheduled);

    harness.backend.fail_commits(true);
    assert_eq!(harness.loader.on_unload_hook_in(&runtime_maps()), None);
    assert!(!harness.loader.should_unmap());
    assert_eq!(harness.unloads.0.load(Ordering::SeqCst), 0);
}

#[test]
fn unload_runs_on_main_thread_only() {
    let harness = Harness::with_config(
        LoaderConfig::default().self_unload(true),
        ProcessFlags::empty(),
        vec![],
    );
    assert!(fork_child(&harness).unload_scheduled);

    harness.host.background_thread.store(true, Ordering::SeqCst);
    assert_eq!(harness.loader.on_unload_hook_in(&runtime_maps()), None);
    assert!(harness.loader.should_unmap());

    harness.host.background_thread.store(false, Ordering::SeqCst);
    assert_eq!(harness.loader.on_unload_hook_in(&runtime_maps()), Some(UNLOAD_TAIL));
}

#[test]
fn failed_native_restore_blocks_unload() {
    const CLASS: &str = "android/os/Process";
    let registrar = Arc::new(RecordingRegistrar::default());
    registrar.refuse.lock().unwrap().push(CLASS.to_owned());

    let harness = Harness::with_config(
        LoaderConfig::default().self_unload(true),
        ProcessFlags::empty(),
        vec![],
    );
    let harness = Harness {
        loader: harness.loader.with_native_registrar(registrar.clone()),
        ..harness
    };
    harness.loader.queue_native_override(
        CLASS,
        "setArgV0",
        "(Ljava/lang/String;)V",
        0x1234 as *mut c_void,
    );
    let methods = [NativeMethod::new(
        c"setArgV0",
        c"(Ljava/lang/String;)V",
        0x5678 as *mut c_void,
    )];
    let substituted = unsafe { harness.loader.intercept_natives(CLASS, &methods) }.unwrap();
    assert_eq!(substituted[0].fn_ptr as usize, 0x1234);

    let report = fork_child(&harness);

    assert!(!report.unload_scheduled);
    assert!(!harness.loader.should_unmap());
}

#[test]
fn restored_natives_allow_unload() {
    const CLASS: &str = "android/os/Process";
    let registrar = Arc::new(RecordingRegistrar::default());
    let harness = Harness::with_config(
        LoaderConfig::default().self_unload(true),
        ProcessFlags::empty(),
        vec![],
    );
    let harness = Harness {
        loader: harness.loader.with_native_registrar(registrar.clone()),
        ..harness
    };
    harness.loader.queue_native_override(
        CLASS,
        "setArgV0",
        "(Ljava/lang/String;)V",
        0x1234 as *mut c_void,
    );
    let methods = [NativeMethod::new(
        c"setArgV0",
        c"(Ljava/lang/String;)V",
        0x5678 as *mut c_void,
    )];
    unsafe { harness.loader.intercept_natives(CLASS, &methods) }.unwrap();

    assert!(fork_child(&harness).unload_scheduled);
    let calls = registrar.calls.lock().unwrap();
    assert_eq!(calls.as_slice(), [(CLASS.to_owned(), vec![0x5678])]);
}

#[test]
fn unarmable_unload_hook_cancels_unload() {
    static BACKUP: AtomicUsize = AtomicUsize::new(0);
    let harness = Harness::with_config(
        LoaderConfig::default()
            .self_unload(true)
            .unloader_library("/libdefinitely-not-mapped.so"),
        ProcessFlags::empty(),
        vec![],
    );
    let harness = Harness {
        loader: harness.loader.with_unload_hook(HookSpec::new(
            "pthread_attr_destroy",
            replacement as *const c_void,
            &BACKUP,
        )),
        ..harness
    };

    let report = fork_child(&harness);

    assert!(!report.unload_scheduled);
    assert!(!harness.loader.should_unmap());
}
