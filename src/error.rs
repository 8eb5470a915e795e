use std::borrow::Cow;
use core::fmt::{Debug, Display};

/// Error types used throughout the `zygisk-core` library.
///
/// None of these is ever escalated into a process abort: every public entry
/// point that mirrors the host ABI logs the error and degrades to the
/// unmodified host behavior.
#[derive(Debug)]
pub enum Error {
    /// An error occurred while reading a procfs table or another file.
    Io {
        /// A descriptive message about the I/O error.
        msg: Cow<'static, str>,
    },

    /// A module path pattern failed to compile.
    Pattern {
        /// A descriptive message about the pattern error.
        msg: Cow<'static, str>,
    },

    /// An import slot could not be located or rewritten.
    ///
    /// This error typically indicates:
    /// * The target image is no longer mapped
    /// * The image has no dynamic section or no import slot for the symbol
    /// * The slot's page protection could not be changed
    Patch {
        /// A descriptive message about the patch error.
        msg: Cow<'static, str>,
    },

    /// A hook or a native binding could not be put back.
    ///
    /// Self-unload is suppressed for the rest of the process lifetime once
    /// this has been observed.
    Restore {
        /// A descriptive message about the restore error.
        msg: Cow<'static, str>,
    },

    /// An extension violated the registration protocol.
    Protocol {
        /// A descriptive message about the protocol violation.
        msg: Cow<'static, str>,
    },

    /// A capability was called with a null or otherwise unusable argument.
    Argument {
        /// A descriptive message about the argument error.
        msg: Cow<'static, str>,
    },

    /// An error occurred in a user-provided collaborator.
    Custom {
        /// A descriptive message about the custom error.
        msg: Cow<'static, str>,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Io { msg } => write!(f, "I/O error: {msg}"),
            Error::Pattern { msg } => write!(f, "Pattern error: {msg}"),
            Error::Patch { msg } => write!(f, "Patch error: {msg}"),
            Error::Restore { msg } => write!(f, "Restore error: {msg}"),
            Error::Protocol { msg } => write!(f, "Protocol error: {msg}"),
            Error::Argument { msg } => write!(f, "Argument error: {msg}"),
            Error::Custom { msg } => write!(f, "Custom error: {msg}"),
        }
    }
}

impl core::error::Error for Error {}

/// Creates an I/O error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn io_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Io { msg: msg.into() }
}

/// Creates a pattern error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn pattern_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Pattern { msg: msg.into() }
}

/// Creates a patch error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn patch_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Patch { msg: msg.into() }
}

/// Creates a restore error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn restore_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Restore { msg: msg.into() }
}

/// Creates a protocol error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn protocol_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Protocol { msg: msg.into() }
}

/// Creates an argument error with the specified message.
#[cold]
#[inline(never)]
pub(crate) fn argument_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Argument { msg: msg.into() }
}

/// Creates a custom error with the specified message.
///
/// This is the constructor collaborators (daemon clients, mount reverters,
/// image loaders) are expected to use for their own failures.
#[cold]
#[inline(never)]
pub fn custom_error(msg: impl Into<Cow<'static, str>>) -> Error {
    Error::Custom { msg: msg.into() }
}
