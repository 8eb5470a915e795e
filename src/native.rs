//! Interception of native method registration.
//!
//! Every native method of the runtime becomes callable through one
//! registration entry point. [`NativeHookTable::install`] sits on that entry
//! point: it swaps in pending overrides, remembers the originals for
//! [`restore`](NativeHookTable::restore) and keeps every other binding as a
//! claimable original for extensions.

use crate::{Result, restore_error};
use core::ffi::{CStr, c_char, c_void};
use hashbrown::HashMap;

/// ABI-compatible `JNINativeMethod`.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct NativeMethod {
    pub name: *const c_char,
    pub signature: *const c_char,
    pub fn_ptr: *mut c_void,
}

impl NativeMethod {
    pub const fn new(name: &'static CStr, signature: &'static CStr, fn_ptr: *mut c_void) -> Self {
        Self {
            name: name.as_ptr(),
            signature: signature.as_ptr(),
            fn_ptr,
        }
    }

    /// # Safety
    /// `name` must point to a valid C string.
    unsafe fn name_str(&self) -> &str {
        unsafe { CStr::from_ptr(self.name) }.to_str().unwrap_or_default()
    }

    /// # Safety
    /// `signature` must point to a valid C string.
    unsafe fn signature_str(&self) -> &str {
        unsafe { CStr::from_ptr(self.signature) }
            .to_str()
            .unwrap_or_default()
    }
}

/// Binds native methods to a class, bypassing any interception.
pub trait NativeRegistrar: Send + Sync {
    fn register_natives(&self, class: &str, methods: &[NativeMethod]) -> Result<()>;
}

struct PendingOverride {
    name: String,
    signature: String,
    fn_ptr: usize,
}

/// A binding replaced by the loader, kept for restoration.
#[derive(Clone)]
struct SavedOriginal {
    // Owned so the method table outlives the caller's array.
    name: std::ffi::CString,
    signature: std::ffi::CString,
    fn_ptr: usize,
}

#[derive(Default)]
pub struct NativeHookTable {
    /// class -> overrides not yet applied.
    pending: HashMap<String, Vec<PendingOverride>>,
    /// class -> originals replaced by core overrides.
    replaced: HashMap<String, Vec<SavedOriginal>>,
    /// class -> name -> signature -> original still free to be claimed.
    claimable: HashMap<String, HashMap<String, HashMap<String, usize>>>,
}

impl NativeHookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a core override for `class.name` with the given signature.
    pub fn queue_override(&mut self, class: &str, name: &str, signature: &str, fn_ptr: *mut c_void) {
        self.pending
            .entry(class.to_owned())
            .or_default()
            .push(PendingOverride {
                name: name.to_owned(),
                signature: signature.to_owned(),
                fn_ptr: fn_ptr as usize,
            });
    }

    /// Number of core overrides that have not been applied yet.
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Classes whose bindings were replaced and will be restored.
    pub fn replaced_classes(&self) -> impl Iterator<Item = &str> {
        self.replaced.keys().map(String::as_str)
    }

    /// Runs on every registration of `methods` for `class`.
    ///
    /// Returns the substituted method array, or `None` if nothing was
    /// overridden and the registration must be forwarded unchanged.
    ///
    /// # Safety
    /// The name and signature of every method must be valid C strings.
    pub unsafe fn install(&mut self, class: &str, methods: &[NativeMethod]) -> Option<Vec<NativeMethod>> {
        let mut substituted: Option<Vec<NativeMethod>> = None;
        for (index, method) in methods.iter().enumerate() {
            let (name, signature) = unsafe { (method.name_str(), method.signature_str()) };

            let mut mismatched = false;
            let matched = self.pending.get_mut(class).and_then(|overrides| {
                let position = overrides
                    .iter()
                    .position(|o| o.name == name && o.signature == signature);
                if position.is_none() && overrides.iter().any(|o| o.name == name) {
                    #[cfg(feature = "log")]
                    log::error!("unknown signature of {class}#{name}: {signature}");
                    mismatched = true;
                }
                position.map(|position| overrides.remove(position))
            });

            match matched {
                Some(hook) => {
                    self.replaced
                        .entry(class.to_owned())
                        .or_default()
                        .push(SavedOriginal {
                            name: unsafe { CStr::from_ptr(method.name) }.to_owned(),
                            signature: unsafe { CStr::from_ptr(method.signature) }.to_owned(),
                            fn_ptr: method.fn_ptr as usize,
                        });
                    let array = substituted.get_or_insert_with(|| methods.to_vec());
                    array[index].fn_ptr = hook.fn_ptr as *mut c_void;
                    #[cfg(feature = "log")]
                    log::info!("replaced {class}#{name}");
                }
                // A method the runtime registers with an unexpected
                // signature is never handed out.
                None if mismatched => {}
                None => {
                    self.claimable
                        .entry(class.to_owned())
                        .or_default()
                        .entry(name.to_owned())
                        .or_default()
                        .insert(signature.to_owned(), method.fn_ptr as usize);
                }
            }
        }
        if self.pending.get(class).is_some_and(Vec::is_empty) {
            self.pending.remove(class);
        }
        substituted
    }

    /// Binds extension overrides for already registered methods of `class`.
    ///
    /// Each method that still has a claimable original is registered with
    /// the override and its slot is rewritten to the original. Every other
    /// slot, including a method someone already claimed, is set to null.
    ///
    /// # Safety
    /// The name and signature of every method must be valid C strings.
    pub unsafe fn hook_native_methods(
        &mut self,
        registrar: &dyn NativeRegistrar,
        class: &str,
        methods: &mut [NativeMethod],
    ) -> Result<()> {
        let mut hooks = Vec::new();
        let Some(class_map) = self.claimable.get_mut(class) else {
            for method in methods.iter_mut() {
                method.fn_ptr = core::ptr::null_mut();
            }
            return Ok(());
        };

        for method in methods.iter_mut() {
            let (name, signature) = unsafe { (method.name_str(), method.signature_str()) };
            let original = class_map
                .get_mut(name)
                .and_then(|signatures| signatures.remove(signature));
            match original {
                Some(original) => {
                    hooks.push(*method);
                    method.fn_ptr = original as *mut c_void;
                }
                None => method.fn_ptr = core::ptr::null_mut(),
            }
        }

        if hooks.is_empty() {
            return Ok(());
        }
        registrar.register_natives(class, &hooks)
    }

    /// Re-binds every original replaced by a core override.
    ///
    /// All classes are attempted; the error reports the ones that failed.
    pub fn restore(&mut self, registrar: &dyn NativeRegistrar) -> Result<()> {
        let mut failed = Vec::new();
        for (class, originals) in self.replaced.drain() {
            if originals.is_empty() {
                continue;
            }
            let methods: Vec<NativeMethod> = originals
                .iter()
                .map(|saved| NativeMethod {
                    name: saved.name.as_ptr(),
                    signature: saved.signature.as_ptr(),
                    fn_ptr: saved.fn_ptr as *mut c_void,
                })
                .collect();
            if let Err(err) = registrar.register_natives(&class, &methods) {
                #[cfg(feature = "log")]
                log::error!("Failed to restore JNI hook of class [{class}]: {err}");
                let _ = err;
                failed.push(class);
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(restore_error(format!(
                "failed to restore native methods of {}",
                failed.join(", ")
            )))
        }
    }
}
