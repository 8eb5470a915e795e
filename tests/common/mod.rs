#![allow(dead_code)]

use std::{
    cell::RefCell,
    collections::BTreeSet,
    os::fd::RawFd,
    path::PathBuf,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    },
};
use zygisk_core::{
    Loader, LoaderConfig, MapInfo, ProcessFlags, Result, RootImpl,
    api::{AppSpecializeArgs, ModuleEntryFn, ServerSpecializeArgs},
    custom_error,
    extension::{ExtensionImage, ImageLoader},
    fd::FdTable,
    host::{Daemon, Host, ModuleSource, MountReverter, TailCall, Unloader},
    jni::{JniEnv, jboolean, jint, jintArray, jlong, jobjectArray},
    native::{NativeMethod, NativeRegistrar},
    plt::{HookBackend, PendingPatch},
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub const RUNTIME_MAPS: &str = "\
5a0000000000-5a0000002000 r--p 00000000 fd:01 1001 /system/bin/app_process64
7f0000000000-7f0000010000 r--p 00000000 103:01 4242 /system/lib64/libandroid_runtime.so
7f0000010000-7f0000020000 r-xp 00010000 103:01 4242 /system/lib64/libandroid_runtime.so
7f1000000000-7f1000010000 r--p 00000000 103:01 4343 /apex/com.android.art/lib64/libart.so
7f2000000000-7f2000001000 rw-p 00000000 00:00 0 [anon:scudo]
";

pub fn runtime_maps() -> Vec<MapInfo> {
    MapInfo::parse_all(RUNTIME_MAPS)
}

/// Value the mock backend reports as the previous slot content.
pub const FAKE_ORIGINAL: usize = 0x7f00_dead_0000;

#[derive(Default)]
pub struct BackendState {
    pub registered: Vec<PendingPatch>,
    pub applied: Vec<PendingPatch>,
    pub commits: usize,
    pub fail_commit: bool,
}

/// Shared view of what a [`MockBackend`] was asked to do.
#[derive(Clone, Default)]
pub struct BackendLog(pub Arc<Mutex<BackendState>>);

impl BackendLog {
    pub fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.0.lock().unwrap()
    }

    pub fn fail_commits(&self, fail: bool) {
        self.state().fail_commit = fail;
    }
}

/// Records patches instead of touching memory. Every applied patch with a
/// backup cell receives [`FAKE_ORIGINAL`] plus its position in the batch.
pub struct MockBackend {
    log: BackendLog,
    pending: Vec<PendingPatch>,
}

impl MockBackend {
    pub fn new(log: BackendLog) -> Self {
        Self {
            log,
            pending: Vec::new(),
        }
    }
}

impl HookBackend for MockBackend {
    fn register(
        &mut self,
        dev: u64,
        inode: u64,
        symbol: &str,
        replacement: *mut core::ffi::c_void,
        backup: *mut *mut core::ffi::c_void,
    ) -> bool {
        if dev == 0 || inode == 0 || symbol.is_empty() || replacement.is_null() {
            return false;
        }
        let patch = PendingPatch {
            dev,
            inode,
            symbol: symbol.to_owned(),
            replacement: replacement as usize,
            backup: backup as usize,
        };
        self.log.state().registered.push(patch.clone());
        self.pending.push(patch);
        true
    }

    fn commit(&mut self, _maps: &[MapInfo]) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut state = self.log.state();
        state.commits += 1;
        if state.fail_commit {
            return Err(custom_error("commit refused"));
        }
        for (index, patch) in pending.into_iter().enumerate() {
            if patch.backup != 0 {
                unsafe { (patch.backup as *mut usize).write(FAKE_ORIGINAL + index) };
            }
            state.applied.push(patch);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct HostState {
    pub pid: AtomicI32,
    pub forks: AtomicUsize,
    pub sigchld_blocked: AtomicBool,
    pub background_thread: AtomicBool,
    pub errno_clears: AtomicUsize,
}

/// A host whose fork returns a preset pid.
pub struct FakeHost(pub Arc<HostState>);

impl Host for FakeHost {
    fn fork(&self) -> libc::pid_t {
        self.0.forks.fetch_add(1, Ordering::SeqCst);
        self.0.pid.load(Ordering::SeqCst)
    }

    fn set_sigchld_blocked(&self, blocked: bool) {
        self.0.sigchld_blocked.store(blocked, Ordering::SeqCst);
    }

    fn is_main_thread(&self) -> bool {
        !self.0.background_thread.load(Ordering::SeqCst)
    }

    fn jni_env(&self, _native_helper: &str) -> Option<*mut JniEnv> {
        None
    }

    fn clear_errno(&self) {
        self.0.errno_clears.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FdState {
    pub open: BTreeSet<RawFd>,
    pub closed: Vec<RawFd>,
}

/// An in-memory descriptor table.
#[derive(Clone, Default)]
pub struct FakeFdTable(pub Arc<Mutex<FdState>>);

impl FakeFdTable {
    pub fn with_open(fds: &[RawFd]) -> Self {
        let table = Self::default();
        table.open(fds);
        table
    }

    pub fn open(&self, fds: &[RawFd]) {
        self.0.lock().unwrap().open.extend(fds.iter().copied());
    }

    pub fn open_fds(&self) -> Vec<RawFd> {
        self.0.lock().unwrap().open.iter().copied().collect()
    }

    pub fn closed(&self) -> Vec<RawFd> {
        self.0.lock().unwrap().closed.clone()
    }
}

impl FdTable for FakeFdTable {
    fn list(&self) -> Result<Vec<RawFd>> {
        Ok(self.open_fds())
    }

    fn close(&self, fd: RawFd) {
        let mut state = self.0.lock().unwrap();
        if state.open.remove(&fd) {
            state.closed.push(fd);
        }
    }
}

/// Serves a fixed list of in-process extension entry points.
pub struct MockDaemon {
    pub flags: ProcessFlags,
    pub modules: usize,
}

impl Daemon for MockDaemon {
    fn connect_companion(&self, id: usize) -> Result<RawFd> {
        Ok(100 + id as RawFd)
    }

    fn get_module_dir(&self, id: usize) -> Result<RawFd> {
        Err(custom_error(format!("no directory for {id}")))
    }

    fn get_process_flags(&self, _uid: jint) -> ProcessFlags {
        self.flags
    }

    fn read_modules(&self) -> Vec<ModuleSource> {
        (0..self.modules)
            .map(|id| ModuleSource::Path(PathBuf::from(id.to_string())))
            .collect()
    }
}

/// Resolves `ModuleSource::Path("<index>")` to one of its entry points.
pub struct StaticImageLoader(pub Vec<ModuleEntryFn>);

impl ImageLoader for StaticImageLoader {
    fn load(&self, source: &ModuleSource) -> Result<ExtensionImage> {
        let ModuleSource::Path(path) = source else {
            return Err(custom_error("only paths are served"));
        };
        let index: usize = path
            .to_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| custom_error("bad module path"))?;
        let entry = *self
            .0
            .get(index)
            .ok_or_else(|| custom_error("no such module"))?;
        Ok(ExtensionImage {
            entry,
            handle: None,
        })
    }
}

#[derive(Clone, Default)]
pub struct MountLog(pub Arc<Mutex<Vec<RootImpl>>>);

impl MountReverter for MountLog {
    fn revert(&self, root: RootImpl) -> Result<()> {
        self.0.lock().unwrap().push(root);
        Ok(())
    }
}

/// The continuation handed back by [`UnloadCounter`].
pub const UNLOAD_TAIL: TailCall = TailCall {
    target: 0xdead_0000,
    arg: 0x5e1f,
};

#[derive(Clone, Default)]
pub struct UnloadCounter(pub Arc<AtomicUsize>);

impl Unloader for UnloadCounter {
    fn unload(&self) -> Result<TailCall> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(UNLOAD_TAIL)
    }
}

/// Records every registration and optionally refuses some classes.
#[derive(Default)]
pub struct RecordingRegistrar {
    pub calls: Mutex<Vec<(String, Vec<usize>)>>,
    pub refuse: Mutex<Vec<String>>,
}

impl NativeRegistrar for RecordingRegistrar {
    fn register_natives(&self, class: &str, methods: &[NativeMethod]) -> Result<()> {
        if self.refuse.lock().unwrap().iter().any(|c| c == class) {
            return Err(custom_error(format!("refused {class}")));
        }
        self.calls.lock().unwrap().push((
            class.to_owned(),
            methods.iter().map(|m| m.fn_ptr as usize).collect(),
        ));
        Ok(())
    }
}

/// A loader wired entirely to fakes.
pub struct Harness {
    pub loader: Loader,
    pub host: Arc<HostState>,
    pub fds: FakeFdTable,
    pub backend: BackendLog,
    pub mounts: MountLog,
    pub unloads: UnloadCounter,
}

impl Harness {
    pub fn new(flags: ProcessFlags, modules: Vec<ModuleEntryFn>) -> Self {
        Self::with_config(LoaderConfig::default(), flags, modules)
    }

    pub fn with_config(config: LoaderConfig, flags: ProcessFlags, modules: Vec<ModuleEntryFn>) -> Self {
        init_logger();
        let host = Arc::new(HostState::default());
        let fds = FakeFdTable::with_open(&[0, 1, 2, 3, 7]);
        let backend = BackendLog::default();
        let mounts = MountLog::default();
        let unloads = UnloadCounter::default();
        let daemon = Arc::new(MockDaemon {
            flags,
            modules: modules.len(),
        });
        let loader = Loader::new(config, daemon)
            .with_backend(Box::new(MockBackend::new(backend.clone())))
            .with_image_loader(Box::new(StaticImageLoader(modules)))
            .with_host(Box::new(FakeHost(host.clone())))
            .with_fd_table(Box::new(fds.clone()))
            .with_mount_reverter(Box::new(mounts.clone()))
            .with_unloader(Box::new(unloads.clone()));
        Self {
            loader,
            host,
            fds,
            backend,
            mounts,
            unloads,
        }
    }
}

/// Backing storage for specialization arguments.
#[derive(Default)]
pub struct AppArgsStorage {
    pub uid: jint,
    pub gid: jint,
    pub gids: usize,
    pub runtime_flags: jint,
    pub rlimits: usize,
    pub mount_external: jint,
    pub se_info: usize,
    pub nice_name: usize,
    pub instruction_set: usize,
    pub app_data_dir: usize,
    pub is_top_app: jboolean,
}

impl AppArgsStorage {
    pub fn with_uid(uid: jint) -> Self {
        Self {
            uid,
            gid: uid,
            ..Self::default()
        }
    }

    pub fn args(&mut self) -> AppSpecializeArgs<'_> {
        let Self {
            uid,
            gid,
            gids,
            runtime_flags,
            rlimits,
            mount_external,
            se_info,
            nice_name,
            instruction_set,
            app_data_dir,
            is_top_app,
        } = self;
        AppSpecializeArgs {
            uid,
            gid,
            gids: as_object(gids),
            runtime_flags,
            rlimits: as_object(rlimits),
            mount_external,
            se_info: as_object(se_info),
            nice_name: as_object(nice_name),
            instruction_set: as_object(instruction_set),
            app_data_dir: as_object(app_data_dir),
            fds_to_ignore: None,
            is_child_zygote: None,
            is_top_app: Some(is_top_app),
            pkg_data_info_list: None,
            whitelisted_data_info_list: None,
            mount_data_dirs: None,
            mount_storage_dirs: None,
        }
    }
}

/// Reinterprets a zeroed word as a null JNI reference.
fn as_object(word: &mut usize) -> &mut jintArray {
    // `jintArray`, `jstring` and `jobjectArray` are all `*mut c_void`.
    unsafe { &mut *(word as *mut usize).cast::<jobjectArray>() }
}

#[derive(Default)]
pub struct ServerArgsStorage {
    pub uid: jint,
    pub gid: jint,
    pub gids: usize,
    pub runtime_flags: jint,
    pub permitted: jlong,
    pub effective: jlong,
}

impl ServerArgsStorage {
    pub fn args(&mut self) -> ServerSpecializeArgs<'_> {
        let Self {
            uid,
            gid,
            gids,
            runtime_flags,
            permitted,
            effective,
        } = self;
        ServerSpecializeArgs {
            uid,
            gid,
            gids: as_object(gids),
            runtime_flags,
            permitted_capabilities: permitted,
            effective_capabilities: effective,
        }
    }
}

/// Behaviour of one test extension in `extensions`.
#[derive(Clone, Debug, Default)]
pub struct Script {
    pub version: std::ffi::c_long,
    /// Options set from the pre callback.
    pub options: Vec<std::ffi::c_int>,
    /// Descriptors opened from the pre callback.
    pub open: Vec<RawFd>,
    /// Descriptors exempted from the pre callback (version 4 only).
    pub exempt: Vec<RawFd>,
    pub fd_table: Option<FakeFdTableHandle>,
    /// `(regex, symbol)` import hooks registered from the pre callback
    /// (versions 1 to 3), all sharing `plt_backup` as backup cell.
    pub plt: Vec<(String, String)>,
    /// `(regex, symbol)` exclusions registered after `plt`.
    pub plt_exclude: Vec<(String, Option<String>)>,
    pub plt_backup: usize,
    pub plt_commit: bool,
    /// How many times `setArgV0` of `android/os/Process` is claimed from
    /// the pre callback.
    pub claim_natives: usize,
}

#[derive(Clone, Default)]
pub struct FakeFdTableHandle(pub FakeFdTable);

impl std::fmt::Debug for FakeFdTableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FakeFdTable")
    }
}

/// What one test extension observed.
#[derive(Clone, Debug, Default)]
pub struct Record {
    pub registered: bool,
    pub api: usize,
    pub slots_populated: bool,
    pub flags_slot: bool,
    pub exempt_slot: bool,
    pub events: Vec<&'static str>,
    pub pre_args: usize,
    pub post_args: usize,
    pub exempt_results: Vec<bool>,
    pub post_exempt: Option<bool>,
    pub flags: Option<u32>,
    pub companion: Option<i32>,
    pub module_dir: Option<i32>,
    /// Content of the backup cell right before the commit.
    pub backup_before_commit: Option<usize>,
    pub commit_result: Option<bool>,
    /// Slot values handed back by each native claim.
    pub claimed: Vec<usize>,
}

/// Entry points with their own script, in slot order.
pub const SLOTS: usize = 2;

thread_local! {
    pub static SCRIPTS: RefCell<Vec<Script>> = RefCell::new(vec![Script::default(); SLOTS]);
    pub static RECORDS: RefCell<Vec<Record>> = RefCell::new(vec![Record::default(); SLOTS]);
    /// Every callback of every extension as `<slot>:<event>`.
    pub static TRACE: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Scripts the extension in slot 0 and resets everything recorded.
pub fn script(script: Script) {
    scripts(vec![script]);
}

/// Scripts the extensions slot by slot and resets everything recorded.
pub fn scripts(mut scripts: Vec<Script>) {
    scripts.resize(SLOTS, Script::default());
    SCRIPTS.with(|s| *s.borrow_mut() = scripts);
    RECORDS.with(|r| *r.borrow_mut() = vec![Record::default(); SLOTS]);
    TRACE.with(|t| t.borrow_mut().clear());
}

pub fn record() -> Record {
    record_of(0)
}

pub fn record_of(slot: usize) -> Record {
    RECORDS.with(|r| r.borrow()[slot].clone())
}

pub fn trace() -> Vec<String> {
    TRACE.with(|t| t.borrow().clone())
}

pub mod extensions {
    use super::{RECORDS, Record, SCRIPTS, SLOTS, Script, TRACE};
    use std::ffi::{CString, c_void};
    use zygisk_core::{
        api::{ApiTable, AppSpecializeArgs, ModuleAbi, ServerSpecializeArgs},
        jni::JniEnv,
        native::NativeMethod,
    };

    /// One instance per slot plus one for the incomplete extension.
    static INSTANCES: [u8; SLOTS + 1] = [0; SLOTS + 1];

    /// Replacement handed to the import hooks of scripted extensions.
    pub extern "C" fn plt_replacement() {}

    fn instance(slot: usize) -> *mut c_void {
        &INSTANCES[slot] as *const u8 as *mut c_void
    }

    fn slot_of(this: *mut c_void) -> usize {
        this as usize - INSTANCES.as_ptr() as usize
    }

    fn note(slot: usize, f: impl FnOnce(&mut Record)) {
        RECORDS.with(|r| f(&mut r.borrow_mut()[slot]));
    }

    fn trace(slot: usize, event: &'static str) {
        TRACE.with(|t| t.borrow_mut().push(format!("{slot}:{event}")));
        note(slot, |r| r.events.push(event));
    }

    fn api(slot: usize) -> *mut ApiTable {
        RECORDS.with(|r| r.borrow()[slot].api as *mut ApiTable)
    }

    fn script(slot: usize) -> Script {
        SCRIPTS.with(|s| s.borrow()[slot].clone())
    }

    unsafe fn register(slot: usize, api: *mut ApiTable) {
        let version = script(slot).version;
        let module = Box::leak(Box::new(ModuleAbi {
            api_version: version,
            instance: instance(slot),
            pre_app_specialize: Some(pre_app),
            post_app_specialize: Some(post_app),
            pre_server_specialize: Some(pre_server),
            post_server_specialize: Some(post_server),
        }));
        unsafe {
            let register = (*api).base.register_module.unwrap();
            let registered = register(api, module);
            let v1 = (*api).slots.v1;
            let v4 = (*api).slots.v4;
            note(slot, |r| {
                r.registered = registered;
                r.api = api as usize;
                r.slots_populated = v1.hook_jni_native_methods.is_some();
                r.flags_slot = v1.get_flags.is_some();
                r.exempt_slot = version >= 4 && v4.exempt_fd.is_some();
            });
        }
    }

    /// Registers with the version from the slot 0 script.
    pub unsafe extern "C" fn scripted_entry(api: *mut ApiTable, _env: *mut JniEnv) {
        unsafe { register(0, api) };
    }

    /// Registers with the version from the slot 1 script.
    pub unsafe extern "C" fn sibling_entry(api: *mut ApiTable, _env: *mut JniEnv) {
        unsafe { register(1, api) };
    }

    /// Registers a descriptor without callbacks.
    pub unsafe extern "C" fn incomplete_entry(api: *mut ApiTable, _env: *mut JniEnv) {
        let module = Box::leak(Box::new(ModuleAbi {
            api_version: 4,
            instance: instance(SLOTS),
            pre_app_specialize: Some(pre_app),
            post_app_specialize: None,
            pre_server_specialize: None,
            post_server_specialize: None,
        }));
        unsafe {
            let register = (*api).base.register_module.unwrap();
            register(api, module);
        }
    }

    /// Never registers.
    pub unsafe extern "C" fn silent_entry(_api: *mut ApiTable, _env: *mut JniEnv) {}

    unsafe fn run_script(slot: usize) {
        let script = script(slot);
        let api = api(slot);
        unsafe {
            let impl_ = (*api).base.impl_;
            if let Some(table) = &script.fd_table {
                table.0.open(&script.open);
            }
            let hook_natives = if script.version >= 4 {
                let v4 = (*api).slots.v4;
                for fd in &script.exempt {
                    let kept = v4.exempt_fd.unwrap()(*fd);
                    note(slot, |r| r.exempt_results.push(kept));
                }
                let flags = v4.get_flags.unwrap()(impl_);
                let companion = v4.connect_companion.unwrap()(impl_);
                let dir = v4.get_module_dir.unwrap()(impl_);
                note(slot, |r| {
                    r.flags = Some(flags);
                    r.companion = Some(companion);
                    r.module_dir = Some(dir);
                });
                for option in &script.options {
                    v4.set_option.unwrap()(impl_, *option);
                }
                v4.hook_jni_native_methods
            } else {
                let v1 = (*api).slots.v1;
                if let Some(get_flags) = v1.get_flags {
                    let flags = get_flags(impl_);
                    note(slot, |r| r.flags = Some(flags));
                }
                for option in &script.options {
                    v1.set_option.unwrap()(impl_, *option);
                }
                let backup = script.plt_backup as *mut *mut c_void;
                for (regex, symbol) in &script.plt {
                    let regex = CString::new(regex.as_str()).unwrap();
                    let symbol = CString::new(symbol.as_str()).unwrap();
                    v1.plt_hook_register.unwrap()(
                        regex.as_ptr(),
                        symbol.as_ptr(),
                        plt_replacement as *mut c_void,
                        backup,
                    );
                }
                for (regex, symbol) in &script.plt_exclude {
                    let regex = CString::new(regex.as_str()).unwrap();
                    let symbol = symbol.as_deref().map(|s| CString::new(s).unwrap());
                    v1.plt_hook_exclude.unwrap()(
                        regex.as_ptr(),
                        symbol.as_ref().map_or(core::ptr::null(), |s| s.as_ptr()),
                    );
                }
                if script.plt_commit {
                    let before = (!backup.is_null()).then(|| *backup as usize);
                    let committed = v1.plt_hook_commit.unwrap()();
                    note(slot, |r| {
                        r.backup_before_commit = before;
                        r.commit_result = Some(committed);
                    });
                }
                v1.hook_jni_native_methods
            };
            for claim in 0..script.claim_natives {
                let mut methods = [NativeMethod::new(
                    c"setArgV0",
                    c"(Ljava/lang/String;)V",
                    (0xb0 + claim) as *mut c_void,
                )];
                hook_natives.unwrap()(
                    core::ptr::null_mut(),
                    c"android/os/Process".as_ptr(),
                    methods.as_mut_ptr(),
                    1,
                );
                note(slot, |r| r.claimed.push(methods[0].fn_ptr as usize));
            }
        }
    }

    unsafe extern "C" fn pre_app(this: *mut c_void, args: *mut AppSpecializeArgs<'_>) {
        let slot = slot_of(this);
        trace(slot, "pre_app");
        note(slot, |r| r.pre_args = args as usize);
        unsafe { run_script(slot) };
    }

    unsafe extern "C" fn post_app(this: *mut c_void, args: *const AppSpecializeArgs<'_>) {
        let slot = slot_of(this);
        trace(slot, "post_app");
        note(slot, |r| r.post_args = args as usize);
        if script(slot).version >= 4 {
            let kept = unsafe { (*api(slot)).slots.v4.exempt_fd.unwrap()(42) };
            note(slot, |r| r.post_exempt = Some(kept));
        }
    }

    unsafe extern "C" fn pre_server(this: *mut c_void, args: *mut ServerSpecializeArgs<'_>) {
        let slot = slot_of(this);
        trace(slot, "pre_server");
        note(slot, |r| r.pre_args = args as usize);
        unsafe { run_script(slot) };
    }

    unsafe extern "C" fn post_server(this: *mut c_void, args: *const ServerSpecializeArgs<'_>) {
        let slot = slot_of(this);
        trace(slot, "post_server");
        note(slot, |r| r.post_args = args as usize);
    }
}
