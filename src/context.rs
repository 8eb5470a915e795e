//! The state machine of one specialization event.
//!
//! A [`SpecializeContext`] lives for exactly one event. While it runs, the
//! event state is reachable from extension callbacks through a thread-local
//! pointer; nothing outside the event's own call can observe it.

use crate::{
    api::{AppSpecializeArgs, ExtensionOption, ProcessFlags, ServerSpecializeArgs},
    extension::Extension,
    fd::FdSanitizer,
    jni::jint,
    loader::Loader,
    native::{NativeHookTable, NativeRegistrar},
    registry::HookRegistry,
};
use core::{
    cell::{Cell, RefCell},
    marker::PhantomData,
};
use std::{
    os::fd::RawFd,
    sync::{Arc, Mutex},
};

/// Lifecycle phases of an event, in the order fork events reach them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Created,
    Forked,
    PreHooked,
    Sanitized,
    PostHooked,
    Unloading,
    Terminal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    AppForkAndSpecialize,
    AppSpecialize,
    ServerForkAndSpecialize,
}

impl EventKind {
    #[inline]
    pub fn is_fork(self) -> bool {
        !matches!(self, EventKind::AppSpecialize)
    }

    #[inline]
    pub fn is_app(self) -> bool {
        !matches!(self, EventKind::ServerForkAndSpecialize)
    }
}

/// A specialization call and its arguments.
pub enum SpecializeEvent<'a> {
    AppForkAndSpecialize {
        args: &'a mut AppSpecializeArgs<'a>,
        /// The caller's descriptor keep-list. Rewritten when extensions
        /// exempt descriptors.
        fds_to_ignore: &'a mut Option<Vec<RawFd>>,
    },
    AppSpecialize {
        args: &'a mut AppSpecializeArgs<'a>,
    },
    ServerForkAndSpecialize {
        args: &'a mut ServerSpecializeArgs<'a>,
    },
}

impl SpecializeEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            SpecializeEvent::AppForkAndSpecialize { .. } => EventKind::AppForkAndSpecialize,
            SpecializeEvent::AppSpecialize { .. } => EventKind::AppSpecialize,
            SpecializeEvent::ServerForkAndSpecialize { .. } => EventKind::ServerForkAndSpecialize,
        }
    }

    fn app_uid(&self) -> Option<jint> {
        match self {
            SpecializeEvent::AppForkAndSpecialize { args, .. }
            | SpecializeEvent::AppSpecialize { args } => Some(*args.uid),
            SpecializeEvent::ServerForkAndSpecialize { .. } => None,
        }
    }
}

/// What happened during one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecializeReport {
    pub kind: EventKind,
    /// `None` for events that do not fork.
    pub pid: Option<libc::pid_t>,
    /// Every phase reached, in order.
    pub phases: Vec<Phase>,
    /// Number of extensions that passed validation.
    pub extensions: usize,
    /// Ids of the extensions whose image was unloaded after their post
    /// callback.
    pub unloaded: Vec<usize>,
    pub unload_scheduled: bool,
}

impl SpecializeReport {
    pub fn is_child(&self) -> bool {
        self.pid.is_none_or(|pid| pid == 0)
    }
}

/// State shared with extension callbacks through the thread-local pointer.
pub(crate) struct EventState {
    pub(crate) kind: EventKind,
    pid: Cell<Option<libc::pid_t>>,
    phases: RefCell<Vec<Phase>>,
    skip_fd_sanitization: Cell<bool>,
    revert_unmount: Cell<bool>,
    unload_loader: Cell<bool>,
    flags: Cell<ProcessFlags>,
    exempted: RefCell<Vec<RawFd>>,
    pub(crate) registry: Arc<HookRegistry>,
    pub(crate) native: Arc<Mutex<NativeHookTable>>,
    pub(crate) registrar: Option<Arc<dyn NativeRegistrar>>,
}

impl EventState {
    fn new(
        kind: EventKind,
        registry: Arc<HookRegistry>,
        native: Arc<Mutex<NativeHookTable>>,
        registrar: Option<Arc<dyn NativeRegistrar>>,
    ) -> Self {
        Self {
            kind,
            pid: Cell::new(None),
            phases: RefCell::new(vec![Phase::Created]),
            // Nothing is forked for this kind, the process keeps its table.
            skip_fd_sanitization: Cell::new(kind == EventKind::AppSpecialize),
            revert_unmount: Cell::new(false),
            unload_loader: Cell::new(false),
            flags: Cell::new(ProcessFlags::empty()),
            exempted: RefCell::new(Vec::new()),
            registry,
            native,
            registrar,
        }
    }

    fn advance(&self, phase: Phase) {
        #[cfg(feature = "log")]
        log::trace!("{:?} -> {phase:?}", self.kind);
        self.phases.borrow_mut().push(phase);
    }

    fn reached(&self, phase: Phase) -> bool {
        self.phases.borrow().contains(&phase)
    }

    /// True unless this is the parent side of a fork.
    pub(crate) fn is_child(&self) -> bool {
        self.pid.get().is_none_or(|pid| pid == 0)
    }

    /// The fork result, once the event has forked successfully.
    pub(crate) fn cached_pid(&self) -> Option<libc::pid_t> {
        self.pid.get().filter(|pid| *pid >= 0)
    }

    pub(crate) fn flags(&self) -> ProcessFlags {
        self.flags.get()
    }

    pub(crate) fn skips_fd_sanitization(&self) -> bool {
        self.skip_fd_sanitization.get()
    }

    pub(crate) fn revert_requested(&self) -> bool {
        self.revert_unmount.get()
    }

    /// Keeps `fd` open across sanitation.
    ///
    /// Once post callbacks have started, or when this event does not
    /// sanitize at all, the request is trivially satisfied.
    pub(crate) fn exempt_fd(&self, fd: RawFd) -> bool {
        if self.reached(Phase::PostHooked) || self.skip_fd_sanitization.get() {
            return true;
        }
        if self.kind != EventKind::AppForkAndSpecialize {
            return false;
        }
        self.exempted.borrow_mut().push(fd);
        true
    }

    /// Applies an option that acts on the whole event.
    pub(crate) fn set_option(&self, option: ExtensionOption) {
        match option {
            ExtensionOption::ForceDenylistUnmount => self.revert_unmount.set(true),
            ExtensionOption::UnloadLoader => self.unload_loader.set(true),
            // Per extension, handled by the extension record.
            ExtensionOption::DlcloseModuleLibrary => {}
        }
    }
}

thread_local! {
    static CURRENT: Cell<*const EventState> = const { Cell::new(core::ptr::null()) };
}

/// Publishes an event state for the duration of a borrow.
pub(crate) struct CurrentGuard<'s> {
    previous: *const EventState,
    _state: PhantomData<&'s EventState>,
}

impl<'s> CurrentGuard<'s> {
    fn enter(state: &'s EventState) -> Self {
        let previous = CURRENT.replace(state);
        if !previous.is_null() {
            #[cfg(feature = "log")]
            log::warn!("nested specialization on one thread");
        }
        Self {
            previous,
            _state: PhantomData,
        }
    }
}

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        CURRENT.set(self.previous);
    }
}

/// Runs `f` against the event being specialized on this thread.
pub(crate) fn with_current<R>(f: impl FnOnce(&EventState) -> R) -> Option<R> {
    let state = CURRENT.get();
    if state.is_null() {
        return None;
    }
    // SAFETY: the pointer is only published by a `CurrentGuard` borrowing
    // a live state and is withdrawn when the guard drops.
    Some(f(unsafe { &*state }))
}

/// One specialization event.
pub struct SpecializeContext<'l> {
    loader: &'l Loader,
    state: EventState,
    extensions: RefCell<Vec<Extension>>,
    sanitizer: RefCell<FdSanitizer>,
}

impl<'l> SpecializeContext<'l> {
    pub(crate) fn new(loader: &'l Loader, kind: EventKind) -> Self {
        Self {
            loader,
            state: EventState::new(
                kind,
                loader.registry.clone(),
                loader.native.clone(),
                loader.native_registrar(),
            ),
            extensions: RefCell::new(Vec::new()),
            sanitizer: RefCell::new(FdSanitizer::new()),
        }
    }

    pub(crate) fn enter(&self) -> CurrentGuard<'_> {
        CurrentGuard::enter(&self.state)
    }

    pub(crate) fn run_pre(&self, event: &mut SpecializeEvent<'_>) {
        let kind = event.kind();
        if kind.is_fork() {
            if kind == EventKind::AppForkAndSpecialize {
                if let Some(fd) = self.loader.log_fd() {
                    self.state.exempted.borrow_mut().push(fd);
                }
            }
            self.fork();
            if !self.state.is_child() {
                return;
            }
        }
        self.load_extensions(event);
        self.call_pre(event);
        if kind.is_fork() {
            self.sanitize(event);
        }
    }

    pub(crate) fn run_post(&self, event: &mut SpecializeEvent<'_>) {
        let kind = event.kind();
        if self.state.is_child() {
            self.state.advance(Phase::PostHooked);
            let extensions = self.extensions.borrow();
            for ext in extensions.iter() {
                match event {
                    SpecializeEvent::AppForkAndSpecialize { args, .. }
                    | SpecializeEvent::AppSpecialize { args } => ext.post_app(&**args),
                    SpecializeEvent::ServerForkAndSpecialize { args } => ext.post_server(&**args),
                }
                if ext.unload_requested() {
                    ext.unload_image();
                }
            }
            if kind.is_app() {
                self.loader.close_log_fd();
            }
        }
        if kind.is_fork() {
            self.loader.host.set_sigchld_blocked(false);
        }
    }

    /// Tears the event down and reports what happened.
    pub(crate) fn finish(self) -> SpecializeReport {
        if self.state.is_child() {
            self.teardown();
        }
        self.state.advance(Phase::Terminal);
        let unload_scheduled = self.state.reached(Phase::Unloading);
        SpecializeReport {
            kind: self.state.kind,
            pid: self.state.pid.get(),
            phases: self.state.phases.take(),
            extensions: self.extensions.borrow().len(),
            unloaded: self
                .extensions
                .borrow()
                .iter()
                .filter(|ext| ext.image_unloaded())
                .map(Extension::id)
                .collect(),
            unload_scheduled,
        }
    }

    fn fork(&self) {
        let host = &self.loader.host;
        host.set_sigchld_blocked(true);
        let pid = host.fork();
        self.state.pid.set(Some(pid));
        if pid < 0 {
            #[cfg(feature = "log")]
            log::error!("fork failed");
        }
        if pid == 0 && !self.state.skip_fd_sanitization.get() {
            match FdSanitizer::capture(&*self.loader.fds) {
                Ok(mut sanitizer) => {
                    // Kept only if exempted explicitly.
                    if let Some(fd) = self.loader.log_fd() {
                        sanitizer.deny(fd);
                    }
                    *self.sanitizer.borrow_mut() = sanitizer;
                }
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::error!("failed to capture fds: {err}");
                    let _ = err;
                    self.state.skip_fd_sanitization.set(true);
                }
            }
        }
        self.state.advance(Phase::Forked);
    }

    fn load_extensions(&self, event: &SpecializeEvent<'_>) {
        let daemon = &self.loader.daemon;
        if let Some(uid) = event.app_uid() {
            self.state.flags.set(daemon.get_process_flags(uid));
        }
        let env = self.loader.jni_env_ptr();
        let max_version = self.loader.config.max_api_version;
        let mut loaded = Vec::new();
        for (id, source) in daemon.read_modules().into_iter().enumerate() {
            let attached = self
                .loader
                .images
                .load(&source)
                .and_then(|image| Extension::attach(id, image, daemon.clone(), max_version, env));
            match attached {
                Ok(ext) => loaded.push(ext),
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::warn!("extension {id} rejected: {err}");
                    let _ = err;
                }
            }
        }
        #[cfg(feature = "log")]
        log::debug!("{} extensions loaded", loaded.len());
        *self.extensions.borrow_mut() = loaded;
    }

    fn call_pre(&self, event: &mut SpecializeEvent<'_>) {
        let extensions = self.extensions.borrow();
        for ext in extensions.iter() {
            match event {
                SpecializeEvent::AppForkAndSpecialize { args, .. }
                | SpecializeEvent::AppSpecialize { args } => ext.pre_app(&mut **args),
                SpecializeEvent::ServerForkAndSpecialize { args } => ext.pre_server(&mut **args),
            }
        }
        self.state.advance(Phase::PreHooked);
    }

    /// Closes every descriptor the child inherited but was not allowed to
    /// keep.
    fn sanitize(&self, event: &mut SpecializeEvent<'_>) {
        if self.state.skip_fd_sanitization.get() {
            return;
        }
        let exempted = self.state.exempted.borrow().clone();
        let mut sanitizer = self.sanitizer.borrow_mut();
        for fd in &exempted {
            sanitizer.allow(*fd);
        }
        if let SpecializeEvent::AppForkAndSpecialize { fds_to_ignore, .. } = event {
            let mut merged = (**fds_to_ignore).clone().unwrap_or_default();
            for fd in &merged {
                sanitizer.allow(*fd);
            }
            if !exempted.is_empty() {
                merged.extend_from_slice(&exempted);
                **fds_to_ignore = Some(merged);
            }
        }
        if let Err(err) = sanitizer.sanitize(&*self.loader.fds) {
            #[cfg(feature = "log")]
            log::error!("failed to sanitize fds: {err}");
            let _ = err;
        }
        // Whatever is still open from here on was kept on purpose.
        self.state.skip_fd_sanitization.set(true);
        self.state.advance(Phase::Sanitized);
    }

    fn teardown(&self) {
        let mut can_unload = true;
        self.loader.release_interceptor();
        if let Some(registrar) = &self.state.registrar {
            let mut native = self
                .state
                .native
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Err(err) = native.restore(&**registrar) {
                #[cfg(feature = "log")]
                log::error!("{err}");
                let _ = err;
                can_unload = false;
            }
        }

        for ext in self.extensions.borrow().iter() {
            ext.clear_api();
        }

        if can_unload && (self.loader.config.self_unload || self.state.unload_loader.get()) {
            if self.loader.schedule_self_unload() {
                self.state.advance(Phase::Unloading);
            }
        }
    }
}
