//! The C ABI shared with extensions.
//!
//! An extension exports [`ENTRY_SYMBOL`]. The loader calls it with an
//! [`ApiTable`]; the extension answers by calling `register_module` with its
//! [`ModuleAbi`]. Which capability slots get populated depends on the API
//! version the extension declares.

use crate::{
    jni::{JniEnv, jboolean, jint, jintArray, jlong, jobjectArray, jstring},
    native::NativeMethod,
};
use bitflags::bitflags;
use core::ffi::{c_char, c_int, c_long, c_void};

/// Name of the symbol every extension image exports.
pub const ENTRY_SYMBOL: &str = "zygisk_module_entry";

/// Highest API version this loader implements.
pub const MAX_API_VERSION: c_long = 4;

bitflags! {
    /// Per-process facts reported by the daemon.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ProcessFlags: u32 {
        const GRANTED_ROOT = 1 << 0;
        const ON_DENYLIST = 1 << 1;
        const IS_MANAGER = 1 << 28;
        const ROOT_IS_KSU = 1 << 29;
        const ROOT_IS_MAGISK = 1 << 30;
        const IS_SYS_UI = 1 << 31;
    }
}

impl ProcessFlags {
    /// Bits that are never reported to extensions.
    pub const PRIVATE_MASK: ProcessFlags = ProcessFlags::ROOT_IS_KSU
        .union(ProcessFlags::ROOT_IS_MAGISK)
        .union(ProcessFlags::IS_SYS_UI);

    /// The flags as seen by extensions.
    #[inline]
    pub fn public(self) -> u32 {
        self.difference(Self::PRIVATE_MASK).bits()
    }
}

/// Options an extension may set through `set_option`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtensionOption {
    /// Revert the root implementation's unmounts for this process.
    ForceDenylistUnmount = 0,
    /// Unload the extension image after its post callback.
    DlcloseModuleLibrary = 1,
    /// Unload the loader itself once this event is over.
    UnloadLoader = 2,
}

impl ExtensionOption {
    pub fn from_raw(raw: c_int) -> Option<Self> {
        match raw {
            0 => Some(Self::ForceDenylistUnmount),
            1 => Some(Self::DlcloseModuleLibrary),
            2 => Some(Self::UnloadLoader),
            _ => None,
        }
    }
}

/// Arguments of an application specialization.
///
/// Required arguments are references into the caller's frame; optional
/// ones are absent on runtimes that do not pass them.
#[repr(C)]
pub struct AppSpecializeArgs<'a> {
    pub uid: &'a mut jint,
    pub gid: &'a mut jint,
    pub gids: &'a mut jintArray,
    pub runtime_flags: &'a mut jint,
    pub rlimits: &'a mut jobjectArray,
    pub mount_external: &'a mut jint,
    pub se_info: &'a mut jstring,
    pub nice_name: &'a mut jstring,
    pub instruction_set: &'a mut jstring,
    pub app_data_dir: &'a mut jstring,

    pub fds_to_ignore: Option<&'a mut jintArray>,
    pub is_child_zygote: Option<&'a mut jboolean>,
    pub is_top_app: Option<&'a mut jboolean>,
    pub pkg_data_info_list: Option<&'a mut jobjectArray>,
    pub whitelisted_data_info_list: Option<&'a mut jobjectArray>,
    pub mount_data_dirs: Option<&'a mut jboolean>,
    pub mount_storage_dirs: Option<&'a mut jboolean>,
}

/// Arguments of the system server specialization.
#[repr(C)]
pub struct ServerSpecializeArgs<'a> {
    pub uid: &'a mut jint,
    pub gid: &'a mut jint,
    pub gids: &'a mut jintArray,
    pub runtime_flags: &'a mut jint,
    pub permitted_capabilities: &'a mut jlong,
    pub effective_capabilities: &'a mut jlong,
}

pub type PreAppFn = unsafe extern "C" fn(*mut c_void, *mut AppSpecializeArgs<'_>);
pub type PostAppFn = unsafe extern "C" fn(*mut c_void, *const AppSpecializeArgs<'_>);
pub type PreServerFn = unsafe extern "C" fn(*mut c_void, *mut ServerSpecializeArgs<'_>);
pub type PostServerFn = unsafe extern "C" fn(*mut c_void, *const ServerSpecializeArgs<'_>);

/// The descriptor an extension registers.
#[repr(C)]
pub struct ModuleAbi {
    pub api_version: c_long,
    /// Opaque extension object handed back to every callback.
    pub instance: *mut c_void,
    pub pre_app_specialize: Option<PreAppFn>,
    pub post_app_specialize: Option<PostAppFn>,
    pub pre_server_specialize: Option<PreServerFn>,
    pub post_server_specialize: Option<PostServerFn>,
}

/// Signature of [`ENTRY_SYMBOL`].
pub type ModuleEntryFn = unsafe extern "C" fn(*mut ApiTable, *mut JniEnv);

pub type HookJniNativeMethodsFn =
    unsafe extern "C" fn(*mut JniEnv, *const c_char, *mut NativeMethod, c_int);
pub type PltHookRegisterFn =
    unsafe extern "C" fn(*const c_char, *const c_char, *mut c_void, *mut *mut c_void);
pub type PltHookExcludeFn = unsafe extern "C" fn(*const c_char, *const c_char);
pub type PltHookCommitFn = unsafe extern "C" fn() -> bool;
pub type ConnectCompanionFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type SetOptionFn = unsafe extern "C" fn(*mut c_void, c_int);
pub type GetModuleDirFn = unsafe extern "C" fn(*mut c_void) -> c_int;
pub type GetFlagsFn = unsafe extern "C" fn(*mut c_void) -> u32;
pub type PltHookRegisterImageFn = unsafe extern "C" fn(
    libc::dev_t,
    libc::ino_t,
    *const c_char,
    *mut c_void,
    *mut *mut c_void,
);
pub type ExemptFdFn = unsafe extern "C" fn(c_int) -> bool;
pub type RegisterModuleFn = unsafe extern "C" fn(*mut ApiTable, *mut ModuleAbi) -> bool;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ApiBase {
    /// Back pointer to the loader-side extension record.
    pub impl_: *mut c_void,
    pub register_module: Option<RegisterModuleFn>,
}

/// Capability layout for API versions 1 to 3.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ApiV1 {
    pub hook_jni_native_methods: Option<HookJniNativeMethodsFn>,
    pub plt_hook_register: Option<PltHookRegisterFn>,
    pub plt_hook_exclude: Option<PltHookExcludeFn>,
    pub plt_hook_commit: Option<PltHookCommitFn>,
    pub connect_companion: Option<ConnectCompanionFn>,
    pub set_option: Option<SetOptionFn>,
    /// Version 2 and later.
    pub get_module_dir: Option<GetModuleDirFn>,
    /// Version 2 and later.
    pub get_flags: Option<GetFlagsFn>,
}

/// Capability layout for API version 4.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ApiV4 {
    pub hook_jni_native_methods: Option<HookJniNativeMethodsFn>,
    pub plt_hook_register: Option<PltHookRegisterImageFn>,
    pub exempt_fd: Option<ExemptFdFn>,
    pub plt_hook_commit: Option<PltHookCommitFn>,
    pub connect_companion: Option<ConnectCompanionFn>,
    pub set_option: Option<SetOptionFn>,
    pub get_module_dir: Option<GetModuleDirFn>,
    pub get_flags: Option<GetFlagsFn>,
}

/// The capability slots; which member is valid follows the negotiated
/// API version.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ApiSlots {
    pub v1: ApiV1,
    pub v4: ApiV4,
}

impl Default for ApiSlots {
    fn default() -> Self {
        ApiSlots {
            v4: ApiV4::default(),
        }
    }
}

/// The table passed to [`ENTRY_SYMBOL`].
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ApiTable {
    pub base: ApiBase,
    pub slots: ApiSlots,
}

impl ApiTable {
    /// A table with only `register_module` populated.
    pub fn new(impl_: *mut c_void, register_module: RegisterModuleFn) -> Self {
        Self {
            base: ApiBase {
                impl_,
                register_module: Some(register_module),
            },
            slots: ApiSlots::default(),
        }
    }

    /// Strips every capability so stale pointers can no longer be called.
    pub fn clear(&mut self) {
        self.base.register_module = None;
        self.slots = ApiSlots::default();
    }
}
