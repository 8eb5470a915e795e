//! Extension records and the capability functions handed to extensions.

use crate::{
    Result,
    api::{
        ApiTable, ApiV1, ApiV4, AppSpecializeArgs, ENTRY_SYMBOL, ExtensionOption, ModuleAbi,
        ModuleEntryFn, ServerSpecializeArgs,
    },
    context::with_current,
    custom_error,
    host::{Daemon, ModuleSource},
    jni::JniEnv,
    native::NativeMethod,
    protocol_error,
};
use core::{
    cell::{Cell, RefCell, UnsafeCell},
    ffi::{CStr, c_char, c_int, c_long, c_void},
    mem::ManuallyDrop,
};
use libloading::Library;
use std::{os::fd::AsRawFd, path::PathBuf, sync::Arc};

/// A mapped extension image.
pub struct ExtensionImage {
    pub entry: ModuleEntryFn,
    /// `None` for images that are part of the process already.
    pub handle: Option<Library>,
}

/// Maps extension images into the process.
pub trait ImageLoader: Send + Sync {
    fn load(&self, source: &ModuleSource) -> Result<ExtensionImage>;
}

/// [`ImageLoader`] backed by the dynamic linker.
#[derive(Default)]
pub struct DlopenLoader;

impl ImageLoader for DlopenLoader {
    fn load(&self, source: &ModuleSource) -> Result<ExtensionImage> {
        use libloading::os::unix::{Library as UnixLibrary, RTLD_NOW};

        let path = match source {
            ModuleSource::Fd(fd) => PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd())),
            ModuleSource::Path(path) => path.clone(),
        };
        let lib: Library = unsafe { UnixLibrary::open(Some(&path), RTLD_NOW) }
            .map_err(|err| custom_error(format!("failed to load {}: {err}", path.display())))?
            .into();
        let entry = unsafe { lib.get::<ModuleEntryFn>(ENTRY_SYMBOL.as_bytes()) }
            .map(|sym| *sym)
            .map_err(|err| custom_error(format!("{} has no {ENTRY_SYMBOL}: {err}", path.display())))?;
        Ok(ExtensionImage {
            entry,
            handle: Some(lib),
        })
    }
}

struct ExtensionInner {
    id: usize,
    api: UnsafeCell<ApiTable>,
    module: Cell<*mut ModuleAbi>,
    max_version: c_long,
    unload: Cell<bool>,
    unloaded: Cell<bool>,
    daemon: Arc<dyn Daemon>,
    handle: RefCell<Option<Library>>,
}

/// A loaded, validated extension.
///
/// The record's address is handed to the extension as `impl_`, so it lives
/// in a box that is leaked while the image stays resident.
pub struct Extension {
    inner: ManuallyDrop<Box<ExtensionInner>>,
}

impl Extension {
    /// Runs the image's entry point and validates what it registered.
    pub(crate) fn attach(
        id: usize,
        image: ExtensionImage,
        daemon: Arc<dyn Daemon>,
        max_version: c_long,
        env: *mut JniEnv,
    ) -> Result<Extension> {
        let inner = Box::new(ExtensionInner {
            id,
            api: UnsafeCell::new(ApiTable::new(core::ptr::null_mut(), register_module)),
            module: Cell::new(core::ptr::null_mut()),
            max_version,
            unload: Cell::new(false),
            unloaded: Cell::new(false),
            daemon,
            handle: RefCell::new(image.handle),
        });
        let ext = Extension {
            inner: ManuallyDrop::new(inner),
        };
        unsafe {
            let api = ext.inner.api.get();
            (*api).base.impl_ = &**ext.inner as *const ExtensionInner as *mut c_void;
            (image.entry)(api, env);
        }
        if let Err(err) = ext.validate() {
            ext.unload_image();
            return Err(err);
        }
        Ok(ext)
    }

    fn validate(&self) -> Result<()> {
        let module = self.inner.module.get();
        if module.is_null() {
            return Err(protocol_error(format!(
                "extension {} did not register",
                self.inner.id
            )));
        }
        let abi = unsafe { &*module };
        if !(1..=self.inner.max_version).contains(&abi.api_version) {
            return Err(protocol_error(format!(
                "extension {} declares unsupported api version {}",
                self.inner.id, abi.api_version
            )));
        }
        if abi.instance.is_null()
            || abi.pre_app_specialize.is_none()
            || abi.post_app_specialize.is_none()
            || abi.pre_server_specialize.is_none()
            || abi.post_server_specialize.is_none()
        {
            return Err(protocol_error(format!(
                "extension {} registered an incomplete descriptor",
                self.inner.id
            )));
        }
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn api_version(&self) -> c_long {
        unsafe { (*self.inner.module.get()).api_version }
    }

    #[inline]
    fn abi(&self) -> &ModuleAbi {
        // SAFETY: validation guarantees a registered descriptor, which the
        // extension keeps alive while its image is mapped.
        unsafe { &*self.inner.module.get() }
    }

    pub(crate) fn pre_app(&self, args: &mut AppSpecializeArgs<'_>) {
        let abi = self.abi();
        if let Some(callback) = abi.pre_app_specialize {
            unsafe { callback(abi.instance, args) };
        }
    }

    pub(crate) fn post_app(&self, args: &AppSpecializeArgs<'_>) {
        let abi = self.abi();
        if let Some(callback) = abi.post_app_specialize {
            unsafe { callback(abi.instance, args) };
        }
    }

    pub(crate) fn pre_server(&self, args: &mut ServerSpecializeArgs<'_>) {
        let abi = self.abi();
        if let Some(callback) = abi.pre_server_specialize {
            unsafe { callback(abi.instance, args) };
        }
    }

    pub(crate) fn post_server(&self, args: &ServerSpecializeArgs<'_>) {
        let abi = self.abi();
        if let Some(callback) = abi.post_server_specialize {
            unsafe { callback(abi.instance, args) };
        }
    }

    /// Whether the extension asked for its image to be unloaded.
    #[inline]
    pub fn unload_requested(&self) -> bool {
        self.inner.unload.get()
    }

    #[inline]
    pub fn image_unloaded(&self) -> bool {
        self.inner.unloaded.get()
    }

    /// Unmaps the image. The record must not call into the extension
    /// afterwards.
    pub(crate) fn unload_image(&self) {
        if let Some(lib) = self.inner.handle.borrow_mut().take() {
            #[cfg(feature = "log")]
            log::debug!("unloading extension {}", self.inner.id);
            drop(lib);
        }
        self.inner.unloaded.set(true);
    }

    /// Strips every capability from the table the extension holds.
    pub(crate) fn clear_api(&self) {
        unsafe { (*self.inner.api.get()).clear() };
    }
}

impl Drop for Extension {
    fn drop(&mut self) {
        // A resident image may still read its table through `impl_`.
        if self.inner.unloaded.get() {
            unsafe { ManuallyDrop::drop(&mut self.inner) };
        }
    }
}

/// Resolves `impl_` back to its record.
///
/// # Safety
/// `impl_` must be null or the `impl_` of a live table.
#[inline]
unsafe fn record<'a>(impl_: *mut c_void) -> Option<&'a ExtensionInner> {
    unsafe { impl_.cast::<ExtensionInner>().as_ref() }
}

unsafe fn c_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

unsafe extern "C" fn register_module(api: *mut ApiTable, module: *mut ModuleAbi) -> bool {
    if api.is_null() || module.is_null() {
        return false;
    }
    unsafe {
        let Some(inner) = record((*api).base.impl_) else {
            return false;
        };
        let version = (*module).api_version;
        if version > inner.max_version {
            #[cfg(feature = "log")]
            log::error!("extension {} requested api version {version}", inner.id);
            return false;
        }
        inner.module.set(module);
        populate(&mut *api, version);
    }
    true
}

/// Fills the capability slots the declared version is entitled to.
fn populate(table: &mut ApiTable, version: c_long) {
    if version >= 4 {
        table.slots.v4 = ApiV4 {
            hook_jni_native_methods: Some(hook_jni_native_methods),
            plt_hook_register: Some(plt_hook_register_image),
            exempt_fd: Some(exempt_fd),
            plt_hook_commit: Some(plt_hook_commit_direct),
            connect_companion: Some(connect_companion),
            set_option: Some(set_option),
            get_module_dir: Some(get_module_dir),
            get_flags: Some(get_flags),
        };
    } else if version >= 1 {
        let mut v1 = ApiV1 {
            hook_jni_native_methods: Some(hook_jni_native_methods),
            plt_hook_register: Some(plt_hook_register),
            plt_hook_exclude: Some(plt_hook_exclude),
            plt_hook_commit: Some(plt_hook_commit),
            connect_companion: Some(connect_companion),
            set_option: Some(set_option),
            ..ApiV1::default()
        };
        if version >= 2 {
            v1.get_module_dir = Some(get_module_dir);
            v1.get_flags = Some(get_flags);
        }
        table.slots.v1 = v1;
    }
}

unsafe extern "C" fn hook_jni_native_methods(
    _env: *mut JniEnv,
    class: *const c_char,
    methods: *mut NativeMethod,
    count: c_int,
) {
    let Ok(count) = usize::try_from(count) else {
        return;
    };
    if methods.is_null() || count == 0 {
        return;
    }
    let methods = unsafe { core::slice::from_raw_parts_mut(methods, count) };
    let Some(class) = (unsafe { c_str(class) }) else {
        methods.iter_mut().for_each(|m| m.fn_ptr = core::ptr::null_mut());
        return;
    };
    let hooked = with_current(|state| {
        let Some(registrar) = &state.registrar else {
            return Err(custom_error("native registration is not intercepted"));
        };
        let mut native = state
            .native
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        unsafe { native.hook_native_methods(&**registrar, class, methods) }
    });
    match hooked {
        Some(Ok(())) => {}
        Some(Err(err)) => {
            #[cfg(feature = "log")]
            log::error!("hooking natives of [{class}]: {err}");
            let _ = err;
            methods.iter_mut().for_each(|m| m.fn_ptr = core::ptr::null_mut());
        }
        None => methods.iter_mut().for_each(|m| m.fn_ptr = core::ptr::null_mut()),
    }
}

unsafe extern "C" fn plt_hook_register(
    regex: *const c_char,
    symbol: *const c_char,
    replacement: *mut c_void,
    backup: *mut *mut c_void,
) {
    let (Some(regex), Some(symbol)) = (unsafe { c_str(regex) }, unsafe { c_str(symbol) }) else {
        return;
    };
    if let Some(Err(err)) =
        with_current(|state| state.registry.register(regex, symbol, replacement, backup))
    {
        #[cfg(feature = "log")]
        log::error!("{err}");
        let _ = err;
    }
}

unsafe extern "C" fn plt_hook_exclude(regex: *const c_char, symbol: *const c_char) {
    let Some(regex) = (unsafe { c_str(regex) }) else {
        return;
    };
    let symbol = unsafe { c_str(symbol) };
    if let Some(Err(err)) = with_current(|state| state.registry.exclude(regex, symbol)) {
        #[cfg(feature = "log")]
        log::error!("{err}");
        let _ = err;
    }
}

unsafe extern "C" fn plt_hook_commit() -> bool {
    match with_current(|state| state.registry.commit()) {
        Some(Ok(())) => true,
        Some(Err(err)) => {
            #[cfg(feature = "log")]
            log::error!("plt commit: {err}");
            let _ = err;
            false
        }
        None => false,
    }
}

unsafe extern "C" fn plt_hook_register_image(
    dev: libc::dev_t,
    inode: libc::ino_t,
    symbol: *const c_char,
    replacement: *mut c_void,
    backup: *mut *mut c_void,
) {
    let Some(symbol) = (unsafe { c_str(symbol) }) else {
        return;
    };
    let registered = with_current(|state| {
        state
            .registry
            .register_image(dev as u64, inode as u64, symbol, replacement, backup)
    });
    if let Some(Err(err)) = registered {
        #[cfg(feature = "log")]
        log::error!("{err}");
        let _ = err;
    }
}

unsafe extern "C" fn plt_hook_commit_direct() -> bool {
    match with_current(|state| state.registry.commit_direct()) {
        Some(Ok(())) => true,
        Some(Err(err)) => {
            #[cfg(feature = "log")]
            log::error!("plt commit: {err}");
            let _ = err;
            false
        }
        None => false,
    }
}

unsafe extern "C" fn exempt_fd(fd: c_int) -> bool {
    with_current(|state| state.exempt_fd(fd)).unwrap_or(false)
}

unsafe extern "C" fn connect_companion(impl_: *mut c_void) -> c_int {
    let Some(inner) = (unsafe { record(impl_) }) else {
        return -1;
    };
    inner.daemon.connect_companion(inner.id).unwrap_or_else(|err| {
        #[cfg(feature = "log")]
        log::error!("companion of extension {}: {err}", inner.id);
        let _ = err;
        -1
    })
}

unsafe extern "C" fn get_module_dir(impl_: *mut c_void) -> c_int {
    let Some(inner) = (unsafe { record(impl_) }) else {
        return -1;
    };
    inner.daemon.get_module_dir(inner.id).unwrap_or_else(|err| {
        #[cfg(feature = "log")]
        log::error!("module dir of extension {}: {err}", inner.id);
        let _ = err;
        -1
    })
}

unsafe extern "C" fn set_option(impl_: *mut c_void, option: c_int) {
    let Some(inner) = (unsafe { record(impl_) }) else {
        return;
    };
    let Some(option) = ExtensionOption::from_raw(option) else {
        #[cfg(feature = "log")]
        log::warn!("extension {} set unknown option {option}", inner.id);
        return;
    };
    with_current(|state| match option {
        ExtensionOption::DlcloseModuleLibrary => inner.unload.set(true),
        _ => state.set_option(option),
    });
}

unsafe extern "C" fn get_flags(_impl: *mut c_void) -> u32 {
    with_current(|state| state.flags().public()).unwrap_or(0)
}
