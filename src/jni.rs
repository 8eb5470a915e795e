//! The slice of the JNI ABI the loader needs.
//!
//! A `JNIEnv*` points at a pointer to the function table. The loader
//! redirects `RegisterNatives` by pointing the environment at a private copy
//! of that table and switching it back at teardown.

#![allow(non_camel_case_types)]

use crate::{Result, custom_error, native::{NativeMethod, NativeRegistrar}};
use core::ffi::{c_char, c_int, c_void};
use std::ffi::CString;

pub type jint = i32;
pub type jlong = i64;
pub type jboolean = u8;
pub type jsize = jint;
pub type jobject = *mut c_void;
pub type jclass = jobject;
pub type jstring = jobject;
pub type jintArray = jobject;
pub type jobjectArray = jobject;
pub type jmethodID = *mut c_void;

pub const JNI_OK: jint = 0;
pub const JNI_ERR: jint = -1;
pub const JNI_VERSION_1_6: jint = 0x0001_0006;

/// Number of entries in `JNINativeInterface`, reserved slots included.
pub const JNI_TABLE_LEN: usize = 233;

const FIND_CLASS: usize = 6;
const DELETE_LOCAL_REF: usize = 23;
const GET_METHOD_ID: usize = 33;
const CALL_OBJECT_METHOD: usize = 34;
const GET_STRING_UTF_CHARS: usize = 169;
const RELEASE_STRING_UTF_CHARS: usize = 170;
const EXCEPTION_CHECK: usize = 228;
const EXCEPTION_CLEAR: usize = 17;
pub const REGISTER_NATIVES: usize = 215;

/// Index of `GetEnv` in `JNIInvokeInterface`.
const GET_ENV: usize = 6;

#[repr(C)]
pub struct JniNativeInterface {
    pub functions: [*mut c_void; JNI_TABLE_LEN],
}

/// What a `JNIEnv*` points at.
pub type JniEnv = *const JniNativeInterface;

#[repr(C)]
pub struct JniInvokeInterface {
    pub functions: [*mut c_void; 8],
}

/// What a `JavaVM*` points at.
pub type JavaVm = *const JniInvokeInterface;

pub type RegisterNativesFn =
    unsafe extern "C" fn(*mut JniEnv, jclass, *const NativeMethod, jint) -> jint;

type FindClassFn = unsafe extern "C" fn(*mut JniEnv, *const c_char) -> jclass;
type DeleteLocalRefFn = unsafe extern "C" fn(*mut JniEnv, jobject);
type GetMethodIdFn =
    unsafe extern "C" fn(*mut JniEnv, jclass, *const c_char, *const c_char) -> jmethodID;
type CallObjectMethodFn = unsafe extern "C" fn(*mut JniEnv, jobject, jmethodID, ...) -> jobject;
type GetStringUtfCharsFn =
    unsafe extern "C" fn(*mut JniEnv, jstring, *mut jboolean) -> *const c_char;
type ReleaseStringUtfCharsFn = unsafe extern "C" fn(*mut JniEnv, jstring, *const c_char);
type ExceptionCheckFn = unsafe extern "C" fn(*mut JniEnv) -> jboolean;
type ExceptionClearFn = unsafe extern "C" fn(*mut JniEnv);
type GetEnvFn = unsafe extern "C" fn(*mut JavaVm, *mut *mut c_void, jint) -> jint;

/// Reads entry `index` of the function table `env` currently points at.
///
/// # Safety
/// `env` must be a live `JNIEnv*` and `F` the entry's exact type.
#[inline]
unsafe fn function<F: Copy>(env: *mut JniEnv, index: usize) -> F {
    unsafe {
        let table = &**env;
        core::mem::transmute_copy::<*mut c_void, F>(&table.functions[index])
    }
}

/// Returns the JNI environment of the calling thread from `vm`.
///
/// # Safety
/// `vm` must be a live `JavaVM*`.
pub unsafe fn env_from_vm(vm: *mut JavaVm) -> Option<*mut JniEnv> {
    unsafe {
        let get_env: GetEnvFn = core::mem::transmute_copy(&(**vm).functions[GET_ENV]);
        let mut env: *mut c_void = core::ptr::null_mut();
        let res = get_env(vm, &mut env, JNI_VERSION_1_6);
        (res == JNI_OK && !env.is_null()).then_some(env.cast())
    }
}

/// Returns the slash-separated binary name of `class`, for example
/// `com/android/internal/os/Zygote`.
///
/// # Safety
/// `env` must be the live environment of the calling thread.
pub unsafe fn class_name(env: *mut JniEnv, class: jclass) -> Option<String> {
    unsafe {
        let find_class: FindClassFn = function(env, FIND_CLASS);
        let get_method_id: GetMethodIdFn = function(env, GET_METHOD_ID);
        let call_object_method: CallObjectMethodFn = function(env, CALL_OBJECT_METHOD);
        let get_chars: GetStringUtfCharsFn = function(env, GET_STRING_UTF_CHARS);
        let release_chars: ReleaseStringUtfCharsFn = function(env, RELEASE_STRING_UTF_CHARS);
        let delete_local_ref: DeleteLocalRefFn = function(env, DELETE_LOCAL_REF);

        let class_class = find_class(env, c"java/lang/Class".as_ptr());
        if class_class.is_null() {
            return None;
        }
        let get_name = get_method_id(
            env,
            class_class,
            c"getName".as_ptr(),
            c"()Ljava/lang/String;".as_ptr(),
        );
        delete_local_ref(env, class_class);
        if get_name.is_null() {
            return None;
        }
        let name_ref = call_object_method(env, class, get_name);
        if name_ref.is_null() {
            return None;
        }
        let chars = get_chars(env, name_ref, core::ptr::null_mut());
        let name = (!chars.is_null())
            .then(|| core::ffi::CStr::from_ptr(chars).to_string_lossy().replace('.', "/"));
        if !chars.is_null() {
            release_chars(env, name_ref, chars);
        }
        delete_local_ref(env, name_ref);
        name
    }
}

/// A private function table installed into one `JNIEnv`.
pub struct EnvInterceptor {
    env: *mut JniEnv,
    original: JniEnv,
    table: Box<JniNativeInterface>,
}

// SAFETY: the environment belongs to the thread that drives specialization,
// the interceptor is only moved between owners, never used concurrently.
unsafe impl Send for EnvInterceptor {}

impl EnvInterceptor {
    /// Points `env` at a copy of its function table whose `RegisterNatives`
    /// entry is `register_natives`.
    ///
    /// # Safety
    /// `env` must be a live `JNIEnv*` that outlives the interceptor.
    pub unsafe fn install(env: *mut JniEnv, register_natives: RegisterNativesFn) -> Self {
        unsafe {
            let original = *env;
            let mut table = Box::new(JniNativeInterface {
                functions: (*original).functions,
            });
            table.functions[REGISTER_NATIVES] = register_natives as *mut c_void;
            *env = &*table as *const JniNativeInterface;
            Self {
                env,
                original,
                table,
            }
        }
    }

    /// The runtime's own `RegisterNatives`.
    pub fn original_register_natives(&self) -> RegisterNativesFn {
        unsafe { core::mem::transmute_copy(&(*self.original).functions[REGISTER_NATIVES]) }
    }

    pub fn env(&self) -> *mut JniEnv {
        self.env
    }

    /// Points the environment back at the runtime's table if it still uses
    /// ours.
    pub fn restore(self) {
        unsafe {
            if core::ptr::eq(*self.env, &*self.table) {
                *self.env = self.original;
            }
        }
    }
}

/// Registers natives through the runtime's own `RegisterNatives`.
pub struct JniRegistrar {
    env: *mut JniEnv,
    register_natives: RegisterNativesFn,
}

// SAFETY: see `EnvInterceptor`.
unsafe impl Send for JniRegistrar {}
unsafe impl Sync for JniRegistrar {}

impl JniRegistrar {
    pub fn new(interceptor: &EnvInterceptor) -> Self {
        Self {
            env: interceptor.env(),
            register_natives: interceptor.original_register_natives(),
        }
    }
}

impl NativeRegistrar for JniRegistrar {
    fn register_natives(&self, class: &str, methods: &[NativeMethod]) -> Result<()> {
        let name = CString::new(class.replace('.', "/"))
            .map_err(|_| custom_error(format!("class name [{class}] contains NUL")))?;
        unsafe {
            let find_class: FindClassFn = function(self.env, FIND_CLASS);
            let delete_local_ref: DeleteLocalRefFn = function(self.env, DELETE_LOCAL_REF);
            let clazz = find_class(self.env, name.as_ptr());
            if clazz.is_null() {
                clear_exception(self.env);
                return Err(custom_error(format!("class [{class}] not found")));
            }
            let res = (self.register_natives)(
                self.env,
                clazz,
                methods.as_ptr(),
                methods.len() as c_int,
            );
            delete_local_ref(self.env, clazz);
            if res != JNI_OK {
                clear_exception(self.env);
                return Err(custom_error(format!("RegisterNatives of [{class}] returned {res}")));
            }
        }
        Ok(())
    }
}

unsafe fn clear_exception(env: *mut JniEnv) {
    unsafe {
        let check: ExceptionCheckFn = function(env, EXCEPTION_CHECK);
        if check(env) != 0 {
            let clear: ExceptionClearFn = function(env, EXCEPTION_CLEAR);
            clear(env);
        }
    }
}
