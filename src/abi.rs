//! Calling-convention-exact invocation of exports.
//!
//! [`RawFn`] is the untyped code address that crosses module boundaries.
//! [`ExportFn`] turns it back into a typed function pointer and calls it with
//! its arguments packed in a tuple, so the dispatcher can stay generic over
//! every signature while the actual call is a plain Rust call through a
//! `extern "C"` / `extern "system"` function pointer.

use std::ffi::c_void;
use std::fmt;
use std::mem;
use std::ptr::NonNull;

/// Non-null address of a function living in some loaded module.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawFn(NonNull<c_void>);

// Code addresses are plain integers as far as thread safety goes.
unsafe impl Send for RawFn {}
unsafe impl Sync for RawFn {}

impl RawFn {
    /// Wrap an address, returning `None` if it is null.
    pub fn new(ptr: *const c_void) -> Option<Self> {
        NonNull::new(ptr as *mut c_void).map(Self)
    }

    pub(crate) fn from_addr(addr: usize) -> Option<Self> {
        Self::new(addr as *const c_void)
    }

    /// Raw pointer to the function.
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    /// Address of the function as an integer.
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl fmt::Debug for RawFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawFn({:#x})", self.addr())
    }
}

/// A function pointer type that exports can be called through.
///
/// Implemented for `unsafe extern "C" fn` and `unsafe extern "system" fn`
/// pointers with up to ten parameters. `Args` is the tuple of parameter types.
///
/// # Safety
///
/// Implementors must be function pointers, so that transmuting a [`RawFn`]
/// into `Self` and back is lossless.
pub unsafe trait ExportFn: Copy + Send + Sync + 'static {
    /// Parameters, as a tuple.
    type Args: 'static;
    /// Return type.
    type Output: 'static;

    /// Reinterpret an address as this function type.
    ///
    /// # Safety
    ///
    /// The address must point to a function with exactly this signature and
    /// calling convention.
    unsafe fn from_raw(raw: RawFn) -> Self;

    /// Erase the type of this function pointer.
    fn into_raw(self) -> RawFn;

    /// Call the function.
    ///
    /// # Safety
    ///
    /// Whatever the called function requires of its arguments.
    unsafe fn invoke(self, args: Self::Args) -> Self::Output;
}

macro_rules! impl_export_fn {
    ($abi:tt; $($arg:ident),*) => {
        unsafe impl<R: 'static, $($arg: 'static),*> ExportFn
            for unsafe extern $abi fn($($arg),*) -> R
        {
            type Args = ($($arg,)*);
            type Output = R;

            unsafe fn from_raw(raw: RawFn) -> Self {
                mem::transmute_copy(&raw.as_ptr())
            }

            fn into_raw(self) -> RawFn {
                // SAFETY: function pointers are never null.
                RawFn(unsafe { NonNull::new_unchecked(self as *const () as *mut c_void) })
            }

            #[allow(non_snake_case, clippy::unused_unit)]
            unsafe fn invoke(self, ($($arg,)*): Self::Args) -> R {
                (self)($($arg),*)
            }
        }
    };
}

macro_rules! impl_export_fn_arities {
    ($abi:tt) => {
        impl_export_fn!($abi;);
        impl_export_fn!($abi; A);
        impl_export_fn!($abi; A, B);
        impl_export_fn!($abi; A, B, C);
        impl_export_fn!($abi; A, B, C, D);
        impl_export_fn!($abi; A, B, C, D, E);
        impl_export_fn!($abi; A, B, C, D, E, F);
        impl_export_fn!($abi; A, B, C, D, E, F, G);
        impl_export_fn!($abi; A, B, C, D, E, F, G, H);
        impl_export_fn!($abi; A, B, C, D, E, F, G, H, I);
        impl_export_fn!($abi; A, B, C, D, E, F, G, H, I, J);
    };
}

impl_export_fn_arities!("C");
impl_export_fn_arities!("system");
