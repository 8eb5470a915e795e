//! The process-wide loader.

use crate::{
    Result,
    config::LoaderConfig,
    context::{SpecializeContext, SpecializeEvent, SpecializeReport, with_current},
    custom_error,
    extension::{DlopenLoader, ImageLoader},
    fd::{FdTable, ProcFdTable},
    host::{
        Daemon, DlcloseUnloader, Host, LinuxHost, MountInfoReverter, MountReverter, TailCall,
        Unloader,
    },
    jni::{EnvInterceptor, JniEnv, JniRegistrar, RegisterNativesFn},
    maps::{MapInfo, find_image},
    native::{NativeHookTable, NativeMethod, NativeRegistrar},
    plt::HookBackend,
    registry::{HookRegistry, InstalledHook},
};
use core::ffi::{c_int, c_void};
use std::{
    os::fd::RawFd,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    },
};

/// One import the loader hooks in a host library.
#[derive(Clone, Copy, Debug)]
pub struct HookSpec {
    pub symbol: &'static str,
    /// Address of the replacement function.
    pub replacement: usize,
    /// Receives the previous import target.
    pub backup: &'static AtomicUsize,
}

impl HookSpec {
    pub fn new(symbol: &'static str, replacement: *const c_void, backup: &'static AtomicUsize) -> Self {
        Self {
            symbol,
            replacement: replacement as usize,
            backup,
        }
    }
}

#[inline]
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything that outlives a single specialization event.
pub struct Loader {
    pub(crate) config: LoaderConfig,
    pub(crate) registry: Arc<HookRegistry>,
    pub(crate) native: Arc<Mutex<NativeHookTable>>,
    registrar: Mutex<Option<Arc<dyn NativeRegistrar>>>,
    interceptor: Mutex<Option<EnvInterceptor>>,
    installed: Mutex<Vec<InstalledHook>>,
    unload_hook: Option<HookSpec>,
    should_unmap: AtomicBool,
    log_fd: AtomicI32,
    pub(crate) daemon: Arc<dyn Daemon>,
    pub(crate) images: Box<dyn ImageLoader>,
    pub(crate) host: Box<dyn Host>,
    pub(crate) fds: Box<dyn FdTable>,
    mounts: Box<dyn MountReverter>,
    unloader: Box<dyn Unloader>,
}

impl Loader {
    /// A loader wired to the real process.
    pub fn new(config: LoaderConfig, daemon: Arc<dyn Daemon>) -> Self {
        Self {
            config,
            registry: Arc::new(HookRegistry::default()),
            native: Arc::new(Mutex::new(NativeHookTable::new())),
            registrar: Mutex::new(None),
            interceptor: Mutex::new(None),
            installed: Mutex::new(Vec::new()),
            unload_hook: None,
            should_unmap: AtomicBool::new(false),
            log_fd: AtomicI32::new(-1),
            daemon,
            images: Box::new(DlopenLoader),
            host: Box::new(LinuxHost),
            fds: Box::new(ProcFdTable),
            mounts: Box::new(MountInfoReverter),
            unloader: Box::new(DlcloseUnloader),
        }
    }

    #[inline]
    pub fn with_backend(mut self, backend: Box<dyn HookBackend>) -> Self {
        self.registry = Arc::new(HookRegistry::new(backend));
        self
    }

    #[inline]
    pub fn with_image_loader(mut self, images: Box<dyn ImageLoader>) -> Self {
        self.images = images;
        self
    }

    #[inline]
    pub fn with_host(mut self, host: Box<dyn Host>) -> Self {
        self.host = host;
        self
    }

    #[inline]
    pub fn with_fd_table(mut self, fds: Box<dyn FdTable>) -> Self {
        self.fds = fds;
        self
    }

    #[inline]
    pub fn with_mount_reverter(mut self, mounts: Box<dyn MountReverter>) -> Self {
        self.mounts = mounts;
        self
    }

    #[inline]
    pub fn with_unloader(mut self, unloader: Box<dyn Unloader>) -> Self {
        self.unloader = unloader;
        self
    }

    /// The import hooked to run the second phase of the self-unload.
    #[inline]
    pub fn with_unload_hook(mut self, hook: HookSpec) -> Self {
        self.unload_hook = Some(hook);
        self
    }

    /// Binds natives directly instead of through an intercepted `JNIEnv`.
    pub fn with_native_registrar(self, registrar: Arc<dyn NativeRegistrar>) -> Self {
        *lock(&self.registrar) = Some(registrar);
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn registry(&self) -> &HookRegistry {
        &self.registry
    }

    pub(crate) fn native_registrar(&self) -> Option<Arc<dyn NativeRegistrar>> {
        lock(&self.registrar).clone()
    }

    /// Queues a core override of a native method, applied when the runtime
    /// registers `class`.
    pub fn queue_native_override(&self, class: &str, name: &str, signature: &str, fn_ptr: *mut c_void) {
        lock(&self.native).queue_override(class, name, signature, fn_ptr);
    }

    /// Runs one specialization event around `original`.
    ///
    /// `original` is the runtime's own specialization; it runs between the
    /// pre and post callbacks of the loaded extensions.
    pub fn specialize<'a, F>(&self, mut event: SpecializeEvent<'a>, original: F) -> SpecializeReport
    where
        F: FnOnce(&mut SpecializeEvent<'a>),
    {
        let ctx = SpecializeContext::new(self, event.kind());
        {
            let _current = ctx.enter();
            ctx.run_pre(&mut event);
            original(&mut event);
            ctx.run_post(&mut event);
        }
        let report = ctx.finish();
        #[cfg(feature = "log")]
        log::debug!("{:?} finished: {:?}", report.kind, report.phases);
        report
    }

    /// The fork hook. Returns the pid cached by the event being
    /// specialized, if it already forked.
    pub fn on_fork(&self) -> libc::pid_t {
        with_current(|state| state.cached_pid())
            .flatten()
            .unwrap_or_else(|| self.host.fork())
    }

    /// The unshare hook, called after the real `unshare` returned `result`.
    pub fn on_unshare(&self, flags: c_int, result: c_int) {
        if result != 0 || flags & libc::CLONE_NEWNS == 0 {
            return;
        }
        let Some((process, requested)) =
            with_current(|state| (state.flags(), state.revert_requested()))
        else {
            return;
        };
        if let Some(root) = self.config.unmount.resolve(process, requested) {
            #[cfg(feature = "log")]
            log::debug!("reverting {root:?} mounts");
            if let Err(err) = self.mounts.revert(root) {
                #[cfg(feature = "log")]
                log::warn!("{err}");
                let _ = err;
            }
        }
        // Failed unmounts must not surface through the caller's errno.
        self.host.clear_errno();
    }

    /// Records the descriptor of the runtime's log connection.
    pub fn set_log_fd(&self, fd: RawFd) {
        self.log_fd.store(fd, Ordering::Relaxed);
    }

    pub fn log_fd(&self) -> Option<RawFd> {
        Some(self.log_fd.load(Ordering::Relaxed)).filter(|fd| *fd >= 0)
    }

    /// The log-close hook. The descriptor stays open while the current
    /// event does not sanitize descriptors.
    pub fn on_log_close(&self) {
        if with_current(|state| state.skips_fd_sanitization()).unwrap_or(false) {
            return;
        }
        self.close_log_fd();
    }

    pub(crate) fn close_log_fd(&self) {
        let fd = self.log_fd.swap(-1, Ordering::Relaxed);
        if fd >= 0 {
            self.fds.close(fd);
        }
    }

    /// Starts intercepting native registration once the VM exists.
    ///
    /// `register_natives` replaces the runtime's own entry in the calling
    /// thread's environment.
    pub fn on_runtime_ready(&self, register_natives: RegisterNativesFn) -> Result<()> {
        let env = self
            .host
            .jni_env(&self.config.native_helper_library)
            .ok_or_else(|| custom_error("no JNI environment"))?;
        let interceptor = unsafe { EnvInterceptor::install(env, register_natives) };
        let registrar: Arc<dyn NativeRegistrar> = Arc::new(JniRegistrar::new(&interceptor));
        *lock(&self.registrar) = Some(registrar);
        if let Some(previous) = lock(&self.interceptor).replace(interceptor) {
            previous.restore();
        }
        #[cfg(feature = "log")]
        log::debug!("native registration intercepted");
        Ok(())
    }

    /// The runtime's own `RegisterNatives`, while interception is active.
    pub fn original_register_natives(&self) -> Option<RegisterNativesFn> {
        lock(&self.interceptor)
            .as_ref()
            .map(EnvInterceptor::original_register_natives)
    }

    pub(crate) fn jni_env_ptr(&self) -> *mut JniEnv {
        lock(&self.interceptor)
            .as_ref()
            .map_or(core::ptr::null_mut(), EnvInterceptor::env)
    }

    /// Hands `JNIEnv` back to the runtime's function table.
    pub(crate) fn release_interceptor(&self) {
        if let Some(interceptor) = lock(&self.interceptor).take() {
            interceptor.restore();
        }
    }

    /// Runs on every intercepted registration of `methods` for `class`.
    ///
    /// # Safety
    /// See [`NativeHookTable::install`].
    pub unsafe fn intercept_natives(&self, class: &str, methods: &[NativeMethod]) -> Option<Vec<NativeMethod>> {
        unsafe { lock(&self.native).install(class, methods) }
    }

    /// Hooks imports of the library whose path ends with `suffix`.
    pub fn hook_image(&self, suffix: &str, hooks: &[HookSpec]) -> Result<usize> {
        self.hook_image_in(&MapInfo::scan()?, suffix, hooks)
    }

    /// Like [`hook_image`](Self::hook_image) with an explicit memory-map
    /// snapshot. Returns how many hooks were recorded for reversal.
    pub fn hook_image_in(&self, maps: &[MapInfo], suffix: &str, hooks: &[HookSpec]) -> Result<usize> {
        let image = find_image(maps, suffix)
            .ok_or_else(|| custom_error(format!("no mapping ends with [{suffix}]")))?;
        for hook in hooks {
            self.registry.register_image(
                image.dev,
                image.inode,
                hook.symbol,
                hook.replacement as *mut c_void,
                hook.backup.as_ptr().cast(),
            )?;
        }
        let committed = self.registry.commit_direct_snapshot(maps);

        let mut installed = lock(&self.installed);
        let before = installed.len();
        for hook in hooks {
            let original = hook.backup.load(Ordering::Acquire);
            if original == 0 {
                #[cfg(feature = "log")]
                log::error!("failed to hook [{}] in {}", hook.symbol, image.path);
                continue;
            }
            installed.push(InstalledHook {
                dev: image.dev,
                inode: image.inode,
                symbol: hook.symbol.to_owned(),
                original,
            });
        }
        let recorded = installed.len() - before;
        drop(installed);
        committed.map(|()| recorded)
    }

    pub fn installed_hooks(&self) -> Vec<InstalledHook> {
        lock(&self.installed).clone()
    }

    /// Reverses every hook the loader placed itself.
    ///
    /// On failure the pending self-unload is abandoned.
    pub fn unhook_all(&self) -> Result<()> {
        let installed = core::mem::take(&mut *lock(&self.installed));
        let reversed = self.registry.reverse(&installed);
        if reversed.is_err() {
            self.should_unmap.store(false, Ordering::Release);
        }
        reversed
    }

    /// Like [`unhook_all`](Self::unhook_all) with an explicit memory-map
    /// snapshot.
    pub fn unhook_all_in(&self, maps: &[MapInfo]) -> Result<()> {
        let installed = core::mem::take(&mut *lock(&self.installed));
        let reversed = self.registry.reverse_snapshot(&installed, maps);
        if reversed.is_err() {
            self.should_unmap.store(false, Ordering::Release);
        }
        reversed
    }

    pub fn should_unmap(&self) -> bool {
        self.should_unmap.load(Ordering::Acquire)
    }

    /// First phase of the self-unload: arms the unload hook. Returns
    /// whether the unload is pending.
    pub(crate) fn schedule_self_unload(&self) -> bool {
        self.should_unmap.store(true, Ordering::Release);
        let Some(hook) = self.unload_hook else {
            #[cfg(feature = "log")]
            log::debug!("no unload hook, unload left to the host");
            return true;
        };
        let hooked = MapInfo::scan()
            .and_then(|maps| self.hook_image_in(&maps, &self.config.unloader_library, &[hook]));
        match hooked {
            Ok(1) => true,
            result => {
                #[cfg(feature = "log")]
                log::error!("failed to arm the unload hook: {result:?}");
                let _ = result;
                self.should_unmap.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Second phase of the self-unload, run from the unload hook.
    ///
    /// Returns the call the hook must jump to once it has unwound, or
    /// `None` when the hook returns normally.
    pub fn on_unload_hook(&self) -> Option<TailCall> {
        self.run_unload(MapInfo::scan().ok().as_deref())
    }

    /// Like [`on_unload_hook`](Self::on_unload_hook) with an explicit
    /// memory-map snapshot.
    pub fn on_unload_hook_in(&self, maps: &[MapInfo]) -> Option<TailCall> {
        self.run_unload(Some(maps))
    }

    fn run_unload(&self, maps: Option<&[MapInfo]>) -> Option<TailCall> {
        if !self.host.is_main_thread() || !self.should_unmap() {
            return None;
        }
        let reversed = match maps {
            Some(maps) => self.unhook_all_in(maps),
            None => Err(custom_error("memory map unavailable")),
        };
        if let Err(err) = reversed {
            #[cfg(feature = "log")]
            log::error!("unload abandoned: {err}");
            let _ = err;
            self.should_unmap.store(false, Ordering::Release);
            return None;
        }
        if !self.should_unmap.swap(false, Ordering::AcqRel) {
            return None;
        }
        match self.unloader.unload() {
            Ok(tail) => {
                #[cfg(feature = "log")]
                log::info!("loader unload started");
                Some(tail)
            }
            Err(err) => {
                #[cfg(feature = "log")]
                log::error!("{err}");
                let _ = err;
                None
            }
        }
    }
}
