//! The export surface of a proxy module.
//!
//! A proxy declares, at build time, one [`Slot`] per export of the genuine
//! library it replaces. Forward slots are backed by a trampoline that jumps
//! to whatever address the slot currently targets; typed slots are backed by
//! a Rust function with the export's exact signature that goes through the
//! [dispatcher](crate::dispatch). The [`exports!`](crate::exports) macro
//! generates both, along with the [`Surface`] that lists them.

use std::any::TypeId;
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::abi::{ExportFn, RawFn};

/// Identity of an export: its name, or its ordinal if it has none.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExportKey {
    /// Named export.
    Name(Cow<'static, str>),
    /// Ordinal-only export.
    Ordinal(u16),
}

impl ExportKey {
    /// Parse a user-facing export identifier. `#N` designates ordinal `N`,
    /// anything else is a name.
    pub fn parse(s: &str) -> Self {
        match s.strip_prefix('#').and_then(|ordinal| ordinal.parse().ok()) {
            Some(ordinal) => ExportKey::Ordinal(ordinal),
            None => ExportKey::Name(Cow::Owned(s.to_owned())),
        }
    }
}

impl fmt::Display for ExportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportKey::Name(name) => f.write_str(name),
            ExportKey::Ordinal(ordinal) => write!(f, "#{ordinal}"),
        }
    }
}

/// How calls reach a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Signature unknown; a trampoline jumps through [`Slot::target`].
    Forward,
    /// Signature known; a Rust export calls the dispatcher.
    Typed,
}

/// Per-export binding state.
///
/// `target` must stay the first field: trampolines load it at offset 0.
#[repr(C)]
pub struct Slot {
    target: AtomicUsize,
    original: AtomicUsize,
    name: Option<&'static str>,
    ordinal: u16,
    kind: SlotKind,
    signature: Option<fn() -> TypeId>,
}

impl Slot {
    /// A named export with unknown signature.
    pub const fn forward(name: &'static str, ordinal: u16) -> Self {
        Self::new(Some(name), ordinal, SlotKind::Forward, None)
    }

    /// An ordinal-only export.
    pub const fn noname(ordinal: u16) -> Self {
        Self::new(None, ordinal, SlotKind::Forward, None)
    }

    /// A named export with signature `F`, e.g.
    /// `unsafe extern "system" fn(u32) -> i32`.
    pub const fn typed<F: ExportFn>(name: &'static str, ordinal: u16) -> Self {
        Self::new(Some(name), ordinal, SlotKind::Typed, Some(TypeId::of::<F> as fn() -> TypeId))
    }

    const fn new(
        name: Option<&'static str>,
        ordinal: u16,
        kind: SlotKind,
        signature: Option<fn() -> TypeId>,
    ) -> Self {
        Self {
            target: AtomicUsize::new(0),
            original: AtomicUsize::new(0),
            name,
            ordinal,
            kind,
            signature,
        }
    }

    /// Export name, if any.
    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Export ordinal.
    pub fn ordinal(&self) -> u16 {
        self.ordinal
    }

    /// How calls reach this slot.
    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    /// Type of the function pointer a typed export was declared with.
    pub fn signature(&self) -> Option<TypeId> {
        self.signature.map(|signature| signature())
    }

    /// Registry key of this slot.
    pub fn key(&self) -> ExportKey {
        match self.name {
            Some(name) => ExportKey::Name(Cow::Borrowed(name)),
            None => ExportKey::Ordinal(self.ordinal),
        }
    }

    /// Address of the genuine export, once bound.
    pub fn original(&self) -> Option<RawFn> {
        RawFn::from_addr(self.original.load(Ordering::Acquire))
    }

    /// Address the trampoline currently jumps to.
    pub fn target(&self) -> Option<RawFn> {
        RawFn::from_addr(self.target.load(Ordering::Acquire))
    }

    /// Whether the slot has been bound to the genuine export.
    pub fn is_bound(&self) -> bool {
        self.original.load(Ordering::Acquire) != 0
    }

    // The original is published before the target, so a trampoline that
    // observes a target always finds the original bound as well.
    pub(crate) fn bind(&self, original: RawFn, target: RawFn) {
        self.original.store(original.addr(), Ordering::Release);
        self.target.store(target.addr(), Ordering::Release);
    }

    pub(crate) fn retarget(&self, target: RawFn) {
        self.target.store(target.addr(), Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.target.store(0, Ordering::Release);
        self.original.store(0, Ordering::Release);
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("key", &self.key())
            .field("ordinal", &self.ordinal)
            .field("kind", &self.kind)
            .field("original", &self.original())
            .field("target", &self.target())
            .finish()
    }
}

/// The declared export surface of a proxy module.
///
/// Fields are public so that [`exports!`](crate::exports) can build a surface
/// in a `static` initializer; use the accessors otherwise.
#[derive(Debug)]
pub struct Surface {
    /// File name of the genuine library, e.g. `dinput8.dll`.
    #[doc(hidden)]
    pub library: &'static str,
    /// One slot per export.
    #[doc(hidden)]
    pub slots: &'static [&'static Slot],
}

impl Surface {
    /// Create a surface.
    pub const fn new(library: &'static str, slots: &'static [&'static Slot]) -> Self {
        Self { library, slots }
    }

    /// File name of the genuine library.
    pub fn library(&self) -> &'static str {
        self.library
    }

    /// All slots, in declaration order.
    pub fn slots(&self) -> &'static [&'static Slot] {
        self.slots
    }

    /// Find a slot by registry key.
    pub fn lookup(&self, key: &ExportKey) -> Option<&'static Slot> {
        self.slots.iter().copied().find(|slot| match key {
            ExportKey::Name(name) => slot.name == Some(name.as_ref()),
            ExportKey::Ordinal(ordinal) => slot.name.is_none() && slot.ordinal == *ordinal,
        })
    }

    /// Find a slot by user-facing identifier (see [`ExportKey::parse`]).
    pub fn find(&self, export: &str) -> Option<&'static Slot> {
        self.lookup(&ExportKey::parse(export))
    }
}

#[doc(hidden)]
#[macro_export]
macro_rules! __export_name {
    ($ident:ident) => {
        stringify!($ident)
    };
    ($ident:ident, $name:literal) => {
        $name
    };
}

/// Declare the export surface of a proxy module.
///
/// Three groups, all optional but in this order:
///
/// - `forward` exports are trampolines that jump straight to the genuine
///   export (or to a raw interceptor). An explicit export name can be given
///   when it isn't a valid Rust identifier.
/// - `noname` exports are ordinal-only trampolines.
/// - `typed` exports are Rust functions with the export's exact signature;
///   they support closure interceptors. The expression after `=` is returned
///   when the call can't be dispatched.
///
/// Example usage:
/// ```ignore
/// uniproxy::exports! {
///     pub static DINPUT8 = "dinput8.dll";
///     forward {
///         DllCanUnloadNow @ 2,
///         DllGetClassObject @ 3,
///     }
///     noname {
///         __ordinal_17 @ 17,
///     }
///     typed {
///         #[ordinal = 1]
///         extern "system" fn DirectInput8Create(
///             hinst: HINSTANCE,
///             version: u32,
///             riid: *const GUID,
///             out: *mut *mut c_void,
///             outer: *mut c_void,
///         ) -> HRESULT = E_FAIL;
///     }
/// }
/// ```
///
/// On Windows, the [`codegen`](crate::codegen) module generates this
/// invocation, plus the linker arguments that assign ordinals, from the
/// genuine library.
#[macro_export]
macro_rules! exports {
    (
        $vis:vis static $surface:ident = $library:literal;
        $( forward { $( $fname:ident $( = $fexport:literal )? @ $ford:literal ),* $(,)? } )?
        $( noname { $( $nname:ident @ $nord:literal ),* $(,)? } )?
        $( typed {
            $(
                #[ordinal = $tord:literal]
                extern $abi:tt fn $tname:ident ( $( $arg:ident : $aty:ty ),* $(,)? ) -> $ret:ty
                    = $fallback:expr;
            )*
        } )?
    ) => {
        $($(
            #[allow(non_snake_case)]
            #[doc(hidden)]
            pub mod $fname {
                pub static SLOT: $crate::Slot =
                    $crate::Slot::forward($crate::__export_name!($fname $(, $fexport)?), $ford);
            }

            $crate::__trampoline!($fname);
        )*)?

        $($(
            #[allow(non_snake_case)]
            #[doc(hidden)]
            pub mod $nname {
                pub static SLOT: $crate::Slot = $crate::Slot::noname($nord);
            }

            $crate::__trampoline!($nname);
        )*)?

        $($(
            #[allow(non_snake_case)]
            #[doc(hidden)]
            pub mod $tname {
                pub static SLOT: $crate::Slot = $crate::Slot::typed::<
                    unsafe extern $abi fn( $( $aty ),* ) -> $ret
                >(stringify!($tname), $tord);
            }

            #[no_mangle]
            #[allow(non_snake_case, clippy::missing_safety_doc)]
            pub unsafe extern $abi fn $tname( $( $arg: $aty ),* ) -> $ret {
                match $crate::dispatch::<unsafe extern $abi fn( $( $aty ),* ) -> $ret>(
                    &$tname::SLOT,
                    ( $( $arg, )* ),
                ) {
                    Ok(ret) => ret,
                    Err(e) => {
                        $crate::tracing::error!("{e}");
                        $fallback
                    },
                }
            }
        )*)?

        $vis static $surface: $crate::Surface = $crate::Surface {
            library: $library,
            slots: &[
                $($( &$fname::SLOT, )*)?
                $($( &$nname::SLOT, )*)?
                $($( &$tname::SLOT, )*)?
            ],
        };
    };
}
