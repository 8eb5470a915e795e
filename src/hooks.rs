//! The bootstrap hooks placed in the runtime library.
//!
//! Each trampoline forwards to the import target it replaced and lets the
//! process-wide [`Loader`] act before or after it.

use crate::{
    Result, arch, custom_error,
    host::TailCall,
    jni::{self, JNI_ERR, JniEnv, jclass, jint},
    loader::{HookSpec, Loader},
    native::NativeMethod,
};
use core::ffi::{c_int, c_void};
use std::sync::{
    OnceLock,
    atomic::{AtomicUsize, Ordering},
};

static LOADER: OnceLock<Loader> = OnceLock::new();

static FORK: AtomicUsize = AtomicUsize::new(0);
static UNSHARE: AtomicUsize = AtomicUsize::new(0);
static SET_CREATE_THREAD_FUNC: AtomicUsize = AtomicUsize::new(0);
static LOG_CLOSE: AtomicUsize = AtomicUsize::new(0);
static PTHREAD_ATTR_DESTROY: AtomicUsize = AtomicUsize::new(0);

type ForkFn = unsafe extern "C" fn() -> libc::pid_t;
type UnshareFn = unsafe extern "C" fn(c_int) -> c_int;
type SetCreateThreadFuncFn = unsafe extern "C" fn(*mut c_void);
type LogCloseFn = unsafe extern "C" fn();
type PthreadAttrDestroyFn = unsafe extern "C" fn(*mut libc::pthread_attr_t) -> c_int;

/// Reads a saved import target.
///
/// # Safety
/// `F` must be the function type the slot was saved for.
#[inline]
unsafe fn original<F: Copy>(slot: &AtomicUsize) -> Option<F> {
    let addr = slot.load(Ordering::Acquire);
    (addr != 0).then(|| unsafe { core::mem::transmute_copy::<usize, F>(&addr) })
}

/// Installs `loader` as the process-wide loader and hooks the runtime
/// library.
///
/// Imports that cannot be hooked are skipped; the others stay in place.
pub fn install(loader: Loader) -> Result<&'static Loader> {
    let loader = loader.with_unload_hook(HookSpec::new(
        "pthread_attr_destroy",
        arch::unload_trampoline as *const c_void,
        &PTHREAD_ATTR_DESTROY,
    ));
    if LOADER.set(loader).is_err() {
        return Err(custom_error("loader already installed"));
    }
    let loader = LOADER
        .get()
        .ok_or_else(|| custom_error("loader vanished"))?;

    let hooks = [
        HookSpec::new("fork", fork_hook as *const c_void, &FORK),
        HookSpec::new("unshare", unshare_hook as *const c_void, &UNSHARE),
        HookSpec::new(
            "androidSetCreateThreadFunc",
            set_create_thread_func_hook as *const c_void,
            &SET_CREATE_THREAD_FUNC,
        ),
        HookSpec::new("__android_log_close", log_close_hook as *const c_void, &LOG_CLOSE),
    ];
    let recorded = loader.hook_image(&loader.config().runtime_library, &hooks)?;
    #[cfg(feature = "log")]
    log::info!("{recorded} runtime hooks installed");
    let _ = recorded;
    Ok(loader)
}

/// The installed loader, if any.
pub fn loader() -> Option<&'static Loader> {
    LOADER.get()
}

/// `fork` as it was before the loader hooked it.
pub(crate) fn real_fork() -> libc::pid_t {
    match unsafe { original::<ForkFn>(&FORK) } {
        Some(fork) => unsafe { fork() },
        None => unsafe { libc::fork() },
    }
}

unsafe extern "C" fn fork_hook() -> libc::pid_t {
    match LOADER.get() {
        Some(loader) => loader.on_fork(),
        None => real_fork(),
    }
}

unsafe extern "C" fn unshare_hook(flags: c_int) -> c_int {
    let res = match unsafe { original::<UnshareFn>(&UNSHARE) } {
        Some(unshare) => unsafe { unshare(flags) },
        None => unsafe { libc::unshare(flags) },
    };
    if let Some(loader) = LOADER.get() {
        loader.on_unshare(flags, res);
    }
    res
}

unsafe extern "C" fn set_create_thread_func_hook(func: *mut c_void) {
    if let Some(set) = unsafe { original::<SetCreateThreadFuncFn>(&SET_CREATE_THREAD_FUNC) } {
        unsafe { set(func) };
    }
    let Some(loader) = LOADER.get() else {
        return;
    };
    if let Err(err) = loader.on_runtime_ready(register_natives_hook) {
        #[cfg(feature = "log")]
        log::error!("{err}");
        let _ = err;
    }
}

unsafe extern "C" fn log_close_hook() {
    if let Some(loader) = LOADER.get() {
        loader.on_log_close();
    }
    if let Some(close) = unsafe { original::<LogCloseFn>(&LOG_CLOSE) } {
        unsafe { close() };
    }
}

/// Body of the `pthread_attr_destroy` hook, called by
/// [`arch::unload_trampoline`] with a slot for the continuation the
/// trampoline jumps to.
pub(crate) unsafe extern "C" fn unload_step(attr: *mut libc::pthread_attr_t, next: *mut TailCall) {
    let res = match unsafe { original::<PthreadAttrDestroyFn>(&PTHREAD_ATTR_DESTROY) } {
        Some(destroy) => unsafe { destroy(attr) },
        None => unsafe { libc::pthread_attr_destroy(attr) },
    };
    let tail = LOADER
        .get()
        .and_then(|loader| loader.on_unload_hook())
        .unwrap_or(TailCall {
            target: destroy_result as usize,
            arg: res as usize,
        });
    unsafe { next.write(tail) };
}

/// Continuation that just hands back the result of the real call.
extern "C" fn destroy_result(res: usize) -> c_int {
    res as c_int
}

unsafe extern "C" fn register_natives_hook(
    env: *mut JniEnv,
    class: jclass,
    methods: *const NativeMethod,
    count: jint,
) -> jint {
    let Some(loader) = LOADER.get() else {
        return JNI_ERR;
    };
    let Some(register) = loader.original_register_natives() else {
        return JNI_ERR;
    };
    let Ok(len) = usize::try_from(count) else {
        return unsafe { register(env, class, methods, count) };
    };
    if methods.is_null() || len == 0 {
        return unsafe { register(env, class, methods, count) };
    }
    let Some(name) = (unsafe { jni::class_name(env, class) }) else {
        return unsafe { register(env, class, methods, count) };
    };
    let slice = unsafe { core::slice::from_raw_parts(methods, len) };
    match unsafe { loader.intercept_natives(&name, slice) } {
        Some(substituted) => unsafe { register(env, class, substituted.as_ptr(), count) },
        None => unsafe { register(env, class, methods, count) },
    }
}
