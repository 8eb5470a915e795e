//! # zygisk_core
//! The in-process half of a Zygisk-style extension loader.
//!
//! The loader sits inside the zygote, the process every Android application
//! is forked from. It hooks a handful of imports of the runtime library and
//! wraps each specialization call in a [`SpecializeContext`] that loads
//! third-party extensions, runs their callbacks around the specialization,
//! sanitizes inherited descriptors and finally tears itself down.
//!
//! ## Layout
//! * [`registry`] and [`plt`]: regex-driven import hooking, applied by
//!   rewriting global offset table slots.
//! * [`native`] and [`jni`]: interception of native method registration.
//! * [`context`] and [`extension`]: the per-event state machine and the C
//!   ABI extensions are driven through.
//! * [`fd`]: descriptor sanitation across the fork.
//! * [`Loader`] and [`hooks`]: process-wide state and the bootstrap hooks,
//!   including the deferred self-unload.
//!
//! Everything that touches the real process sits behind a trait of
//! [`host`], so the whole state machine can be driven from tests.

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "arm",
    target_arch = "riscv64",
)))]
compile_error!("unsupported arch");

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("only Linux and Android processes can be hooked");

pub mod api;
pub(crate) mod arch;
pub mod config;
pub mod context;
mod error;
pub mod extension;
pub mod fd;
pub mod hooks;
pub mod host;
pub mod jni;
mod loader;
pub mod maps;
pub mod native;
pub mod plt;
pub mod registry;

pub use api::{
    AppSpecializeArgs, ExtensionOption, ModuleAbi, ProcessFlags, ServerSpecializeArgs,
};
pub use config::{LoaderConfig, RootImpl, UnmountPolicy};
pub use context::{EventKind, Phase, SpecializeContext, SpecializeEvent, SpecializeReport};
pub use error::{Error, custom_error};
pub(crate) use error::{
    argument_error, io_error, patch_error, pattern_error, protocol_error, restore_error,
};
pub use loader::{HookSpec, Loader};
pub use maps::MapInfo;
pub use registry::{HookRegistry, InstalledHook};

/// A type alias for `Result`s returned by `zygisk_core` functions.
///
/// This is a convenience alias that eliminates the need to repeatedly specify
/// the `Error` type in function signatures.
pub type Result<T> = core::result::Result<T, Error>;
