//! Loader configuration.

use crate::api::{MAX_API_VERSION, ProcessFlags};
use core::ffi::c_long;

/// Root implementations whose unmounts can be reverted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RootImpl {
    Ksu,
    Magisk,
}

impl RootImpl {
    /// Mount source name the implementation uses for its own mounts.
    pub fn mount_source(self) -> &'static str {
        match self {
            RootImpl::Ksu => "KSU",
            RootImpl::Magisk => "magisk",
        }
    }
}

/// Rules for acting on an extension's unmount-reversal request.
#[derive(Clone, Debug)]
pub struct UnmountPolicy {
    /// Processes carrying any of these flags are never touched.
    pub exempt: ProcessFlags,
    /// Checked in order; the first flag the process carries wins.
    pub roots: Vec<(ProcessFlags, RootImpl)>,
}

impl Default for UnmountPolicy {
    fn default() -> Self {
        Self {
            exempt: ProcessFlags::IS_SYS_UI,
            roots: vec![
                (ProcessFlags::ROOT_IS_KSU, RootImpl::Ksu),
                (ProcessFlags::ROOT_IS_MAGISK, RootImpl::Magisk),
            ],
        }
    }
}

impl UnmountPolicy {
    /// Returns the root implementation whose mounts must be reverted, if any.
    pub fn resolve(&self, flags: ProcessFlags, requested: bool) -> Option<RootImpl> {
        if !requested || flags.intersects(self.exempt) {
            return None;
        }
        self.roots
            .iter()
            .find(|(flag, _)| !flag.is_empty() && flags.contains(*flag))
            .map(|(_, root)| *root)
    }
}

/// Configuration of a [`Loader`](crate::Loader).
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    /// Path suffix of the runtime library whose imports carry the
    /// bootstrap hooks.
    pub runtime_library: String,
    /// Path suffix of the library whose `pthread_attr_destroy` import
    /// drives the deferred unload.
    pub unloader_library: String,
    /// Path suffix of the library exporting `JNI_GetCreatedJavaVMs`.
    pub native_helper_library: String,
    pub max_api_version: c_long,
    pub unmount: UnmountPolicy,
    /// Unload the loader after every child specialization. When off, the
    /// loader only leaves if an extension asks for it. On by default.
    pub self_unload: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            runtime_library: "libandroid_runtime.so".to_owned(),
            unloader_library: "/libart.so".to_owned(),
            native_helper_library: "/libnativehelper.so".to_owned(),
            max_api_version: MAX_API_VERSION,
            unmount: UnmountPolicy::default(),
            self_unload: true,
        }
    }
}

impl LoaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn runtime_library(mut self, suffix: impl Into<String>) -> Self {
        self.runtime_library = suffix.into();
        self
    }

    #[inline]
    pub fn unloader_library(mut self, suffix: impl Into<String>) -> Self {
        self.unloader_library = suffix.into();
        self
    }

    #[inline]
    pub fn native_helper_library(mut self, suffix: impl Into<String>) -> Self {
        self.native_helper_library = suffix.into();
        self
    }

    /// Caps the API version extensions may declare. Values above the
    /// version this crate implements are clamped.
    #[inline]
    pub fn max_api_version(mut self, version: c_long) -> Self {
        self.max_api_version = version.min(MAX_API_VERSION);
        self
    }

    #[inline]
    pub fn unmount_policy(mut self, policy: UnmountPolicy) -> Self {
        self.unmount = policy;
        self
    }

    #[inline]
    pub fn self_unload(mut self, enabled: bool) -> Self {
        self.self_unload = enabled;
        self
    }
}
