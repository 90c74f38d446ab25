//! Forwarding trampolines.
//!
//! A forward export is a naked function that loads the target address out of
//! its [`Slot`] and jumps to it. No register, stack slot or flag the caller
//! set up is touched on the way, so the genuine export (or a raw interceptor
//! with the same signature) runs as if it had been called directly. This is
//! the only place in the crate that knows about calling conventions at the
//! instruction level.
//!
//! A trampoline whose slot is not bound can't block: it has no idea how many
//! arguments it would have to preserve. It logs the offending export and
//! aborts the process instead of jumping through a null pointer.

use std::process;

use tracing::error;

use crate::surface::Slot;

/// Called by a trampoline whose slot has no target.
///
/// # Safety
///
/// `slot` must be null or point to a live [`Slot`].
#[doc(hidden)]
pub unsafe extern "C" fn unresolved_export(slot: *const Slot) -> ! {
    match unsafe { slot.as_ref() } {
        Some(slot) => {
            error!("{} was called before the genuine library was bound; aborting", slot.key())
        },
        None => error!("unbound export was called; aborting"),
    }

    process::abort()
}

/// Moves the slot address left in the scratch register by the trampoline into
/// the first argument register and tail-calls [`unresolved_export`].
#[cfg(all(target_arch = "x86_64", windows))]
#[doc(hidden)]
#[unsafe(naked)]
pub unsafe extern "C" fn unresolved_entry() {
    core::arch::naked_asm!(
        "mov rcx, r11",
        "jmp {handler}",
        handler = sym unresolved_export,
    )
}

/// Moves the slot address left in the scratch register by the trampoline into
/// the first argument register and tail-calls [`unresolved_export`].
#[cfg(all(target_arch = "x86_64", not(windows)))]
#[doc(hidden)]
#[unsafe(naked)]
pub unsafe extern "C" fn unresolved_entry() {
    core::arch::naked_asm!(
        "mov rdi, r11",
        "jmp {handler}",
        handler = sym unresolved_export,
    )
}

/// Pushes the slot address left in `eax` by the trampoline and calls
/// [`unresolved_export`], which never returns.
#[cfg(all(target_arch = "x86", windows))]
#[doc(hidden)]
#[unsafe(naked)]
pub unsafe extern "C" fn unresolved_entry() {
    core::arch::naked_asm!(
        "push eax",
        "call {handler}",
        handler = sym unresolved_export,
    )
}

// r11 is caller-saved and never carries arguments in either the Microsoft x64
// or the System V convention.
#[cfg(target_arch = "x86_64")]
#[doc(hidden)]
#[macro_export]
macro_rules! __trampoline {
    ($name:ident) => {
        #[no_mangle]
        #[unsafe(naked)]
        #[allow(non_snake_case, clippy::missing_safety_doc)]
        pub unsafe extern "C" fn $name() {
            ::core::arch::naked_asm!(
                "mov r11, qword ptr [rip + {slot}]",
                "test r11, r11",
                "jz 2f",
                "jmp r11",
                "2:",
                "lea r11, [rip + {slot}]",
                "jmp {unresolved}",
                slot = sym $name::SLOT,
                unresolved = sym $crate::trampoline::unresolved_entry,
            )
        }
    };
}

// eax is a return register and carries no arguments in cdecl or stdcall.
#[cfg(all(target_arch = "x86", windows))]
#[doc(hidden)]
#[macro_export]
macro_rules! __trampoline {
    ($name:ident) => {
        #[no_mangle]
        #[unsafe(naked)]
        #[allow(non_snake_case, clippy::missing_safety_doc)]
        pub unsafe extern "C" fn $name() {
            ::core::arch::naked_asm!(
                "mov eax, dword ptr [{slot}]",
                "test eax, eax",
                "jz 2f",
                "jmp eax",
                "2:",
                "lea eax, [{slot}]",
                "jmp {unresolved}",
                slot = sym $name::SLOT,
                unresolved = sym $crate::trampoline::unresolved_entry,
            )
        }
    };
}

#[cfg(not(any(target_arch = "x86_64", all(target_arch = "x86", windows))))]
#[doc(hidden)]
#[macro_export]
macro_rules! __trampoline {
    ($name:ident) => {
        compile_error!("forward exports are only supported on x86_64 and 32-bit Windows targets");
    };
}
