//! Collaborators outside the specialization core.
//!
//! Every process-level primitive the loader relies on sits behind a trait
//! so the state machine can be driven without forking, closing real
//! descriptors or talking to a daemon.

use crate::{
    Result,
    api::ProcessFlags,
    config::RootImpl,
    custom_error, io_error,
    jni::{JavaVm, JniEnv, env_from_vm, jint, jsize, JNI_OK},
    maps::{MapInfo, find_image},
};
use core::ffi::c_void;
use std::{
    ffi::CString,
    os::fd::{OwnedFd, RawFd},
    path::PathBuf,
};

/// Where an extension image comes from.
#[derive(Debug)]
pub enum ModuleSource {
    /// An anonymous file holding the image.
    Fd(OwnedFd),
    Path(PathBuf),
}

/// The companion daemon.
pub trait Daemon: Send + Sync {
    /// Opens a connection to the companion of extension `id`.
    fn connect_companion(&self, id: usize) -> Result<RawFd>;

    /// Opens the storage directory of extension `id`.
    fn get_module_dir(&self, id: usize) -> Result<RawFd>;

    fn get_process_flags(&self, uid: jint) -> ProcessFlags;

    /// Extension images to load, in registration order.
    fn read_modules(&self) -> Vec<ModuleSource>;
}

/// Process primitives used around the fork.
pub trait Host: Send + Sync {
    /// The real fork, bypassing the loader's own fork hook.
    fn fork(&self) -> libc::pid_t;

    fn set_sigchld_blocked(&self, blocked: bool);

    fn is_main_thread(&self) -> bool;

    /// The JNI environment of the calling thread, once the VM exists.
    fn jni_env(&self, native_helper: &str) -> Option<*mut JniEnv>;

    fn clear_errno(&self);
}

/// Reverts the mounts a root implementation applied to this process.
pub trait MountReverter: Send + Sync {
    fn revert(&self, root: RootImpl) -> Result<()>;
}

/// A call entered by a jump instead of a call: `target(arg)` returns
/// straight to the caller of the hook that made the jump.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TailCall {
    pub target: usize,
    pub arg: usize,
}

/// Removes the loader image from the process.
///
/// Called on the main thread from a hook whose caller lives in another
/// image. The returned call performs the unmap and is entered once every
/// frame of the loader has been popped.
pub trait Unloader: Send + Sync {
    fn unload(&self) -> Result<TailCall>;
}

/// [`Host`] on top of `libc`.
#[derive(Default)]
pub struct LinuxHost;

impl Host for LinuxHost {
    fn fork(&self) -> libc::pid_t {
        crate::hooks::real_fork()
    }

    fn set_sigchld_blocked(&self, blocked: bool) {
        unsafe {
            let mut set: libc::sigset_t = core::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGCHLD);
            let how = if blocked {
                libc::SIG_BLOCK
            } else {
                libc::SIG_UNBLOCK
            };
            libc::sigprocmask(how, &set, core::ptr::null_mut());
        }
    }

    fn is_main_thread(&self) -> bool {
        unsafe { libc::gettid() == libc::getpid() }
    }

    fn jni_env(&self, native_helper: &str) -> Option<*mut JniEnv> {
        type GetCreatedJavaVms = unsafe extern "C" fn(*mut *mut JavaVm, jsize, *mut jsize) -> jint;
        const SYMBOL: &[u8] = b"JNI_GetCreatedJavaVMs\0";

        let get_vms = |lib: &libloading::Library| unsafe {
            lib.get::<GetCreatedJavaVms>(SYMBOL).map(|sym| *sym).ok()
        };

        let this: libloading::Library = libloading::os::unix::Library::this().into();
        let mut getter = get_vms(&this);
        let mut helper = None;
        if getter.is_none() {
            let maps = MapInfo::scan().ok()?;
            let path = maps
                .iter()
                .find(|map| map.path.ends_with(native_helper))
                .or_else(|| find_image(&maps, native_helper))?
                .path
                .clone();
            let lib = unsafe { libloading::Library::new(&path) }.ok()?;
            getter = get_vms(&lib);
            helper = Some(lib);
        }
        let Some(getter) = getter else {
            #[cfg(feature = "log")]
            log::warn!("JNI_GetCreatedJavaVMs not found");
            return None;
        };

        let mut vm: *mut JavaVm = core::ptr::null_mut();
        let mut count: jsize = 0;
        let res = unsafe { getter(&mut vm, 1, &mut count) };
        drop(helper);
        if res != JNI_OK || vm.is_null() {
            return None;
        }
        unsafe { env_from_vm(vm) }
    }

    fn clear_errno(&self) {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "android")] {
                unsafe { *libc::__errno() = 0 };
            } else {
                unsafe { *libc::__errno_location() = 0 };
            }
        }
    }
}

/// [`MountReverter`] that detaches every mount of the root implementation
/// listed in `/proc/self/mountinfo`.
#[derive(Default)]
pub struct MountInfoReverter;

/// The fields of one `/proc/self/mountinfo` line that matter for reverting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountEntry {
    pub root: String,
    pub target: String,
    pub source: String,
}

impl MountEntry {
    /// Parses a line such as
    /// `36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw`.
    pub fn parse(line: &str) -> Option<MountEntry> {
        let (head, tail) = line.split_once(" - ")?;
        let mut head = head.split_ascii_whitespace();
        let root = head.nth(3)?;
        let target = head.next()?;
        let mut tail = tail.split_ascii_whitespace();
        let source = tail.nth(1)?;
        Some(MountEntry {
            root: root.to_owned(),
            target: target.to_owned(),
            source: source.to_owned(),
        })
    }

    pub fn belongs_to(&self, root: RootImpl) -> bool {
        self.source == root.mount_source() || self.root.starts_with("/adb/modules")
    }
}

impl MountReverter for MountInfoReverter {
    fn revert(&self, root: RootImpl) -> Result<()> {
        let content = std::fs::read_to_string("/proc/self/mountinfo")
            .map_err(|err| io_error(format!("failed to read mountinfo: {err}")))?;
        let targets: Vec<String> = content
            .lines()
            .filter_map(MountEntry::parse)
            .filter(|entry| entry.belongs_to(root))
            .map(|entry| entry.target)
            .collect();

        let mut failed = 0;
        for target in targets.iter().rev() {
            let Ok(path) = CString::new(target.as_str()) else {
                continue;
            };
            if unsafe { libc::umount2(path.as_ptr(), libc::MNT_DETACH) } != 0 {
                #[cfg(feature = "log")]
                log::warn!("failed to unmount {target}");
                failed += 1;
            } else {
                #[cfg(feature = "log")]
                log::debug!("unmounted {target}");
            }
        }
        if failed != 0 {
            return Err(custom_error(format!("{failed} mounts of {root:?} remain")));
        }
        Ok(())
    }
}

/// [`Unloader`] that ends the hook in `dlclose` of the loader's own
/// handle.
#[derive(Default)]
pub struct DlcloseUnloader;

impl Unloader for DlcloseUnloader {
    fn unload(&self) -> Result<TailCall> {
        let handle = self_handle()?;
        Ok(TailCall {
            target: libc::dlclose as usize,
            arg: handle as usize,
        })
    }
}

/// Returns a `dlopen` handle of the image containing this function.
///
/// The reference taken by `RTLD_NOLOAD` is dropped again before returning,
/// so one `dlclose` of the result releases the loader's own reference.
fn self_handle() -> Result<*mut c_void> {
    unsafe {
        let mut info: libc::Dl_info = core::mem::zeroed();
        if libc::dladdr(self_handle as *const c_void, &mut info) == 0 || info.dli_fname.is_null() {
            return Err(custom_error("dladdr failed for the loader image"));
        }
        let handle = libc::dlopen(info.dli_fname, libc::RTLD_NOW | libc::RTLD_NOLOAD);
        if handle.is_null() {
            return Err(custom_error("the loader image is not a dlopen-ed library"));
        }
        libc::dlclose(handle);
        Ok(handle)
    }
}
