//! # uniproxy
//!
//! This library implements the machinery of a proxy DLL: a module that takes
//! the place of a genuine system library (say, `dinput8.dll`), forwards every
//! export to the genuine one, and lets you intercept the exports you care
//! about.
//!
//! The pieces, in the order they come into play:
//!
//! - the [export surface](surface), declared at build time with
//!   [`exports!`] (usually [generated](codegen) from the genuine library);
//! - the [resolver](resolver), which finds and loads the genuine library
//!   without loading the proxy itself a second time;
//! - the [export table](synth), which binds every declared export to its
//!   genuine counterpart;
//! - the [registry](registry) of interceptors;
//! - the [dispatcher](dispatch), which routes each call;
//! - the [lifecycle](lifecycle) gate, which keeps calls out until the table
//!   is bound and drains them at unload.
//!
//! All of them hang off a [`Proxy`] object. A proxy DLL installs exactly one,
//! which is what [`proxy_dll!`] does from `DllMain`.
//!
//! ## Fair warning
//!
//! A proxy sits between an application and a library it was never meant to
//! be separated from, so any deviation from the genuine calling convention
//! crashes the host. Forward exports are plain indirect jumps and are as safe
//! as the genuine library; typed exports are only as correct as the signature
//! you declare for them.
//!
//! ## Example
//!
//! ```ignore
//! // lib.rs of a `cdylib` crate named `dinput8`
//! use std::ffi::c_void;
//!
//! use uniproxy::windows::core::{GUID, HRESULT};
//! use uniproxy::windows::Win32::Foundation::{E_FAIL, HINSTANCE};
//!
//! type FnDirectInput8Create = unsafe extern "system" fn(
//!     HINSTANCE, u32, *const GUID, *mut *mut c_void, *mut c_void,
//! ) -> HRESULT;
//!
//! uniproxy::exports! {
//!     pub static DINPUT8 = "dinput8.dll";
//!     forward {
//!         DllCanUnloadNow @ 2,
//!         DllGetClassObject @ 3,
//!         DllRegisterServer @ 4,
//!         DllUnregisterServer @ 5,
//!         GetdfDIJoystick @ 6,
//!     }
//!     typed {
//!         #[ordinal = 1]
//!         extern "system" fn DirectInput8Create(
//!             hinst: HINSTANCE,
//!             version: u32,
//!             riid: *const GUID,
//!             out: *mut *mut c_void,
//!             outer: *mut c_void,
//!         ) -> HRESULT = E_FAIL;
//!     }
//! }
//!
//! uniproxy::proxy_dll!(DINPUT8, |proxy: &'static uniproxy::Proxy| {
//!     uniproxy::open_debug_terminal();
//!     proxy
//!         .register::<FnDirectInput8Create, _>("DirectInput8Create", |forward, args| {
//!             uniproxy::tracing::info!("DirectInput8Create called");
//!             unsafe { forward.call(args) }
//!         })
//!         .ok();
//! });
//! ```
#![deny(missing_docs)]

use once_cell::sync::OnceCell;
pub use tracing;
#[cfg(windows)]
pub use windows;

pub mod abi;
pub mod codegen;
pub mod config;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod image;
pub mod library;
pub mod lifecycle;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod surface;
pub mod synth;
#[doc(hidden)]
pub mod trampoline;
pub mod util;

pub use abi::{ExportFn, RawFn};
pub use config::{Config, UnresolvedPolicy};
pub use dispatch::{Dispatcher, ExportState, Forward, Handler};
pub use error::{Error, Result};
pub use lifecycle::Phase;
pub use proxy::Proxy;
pub use registry::OriginalAccessor;
pub use surface::{ExportKey, Slot, SlotKind, Surface};
pub use util::ProxyModule;

use crate::error::{DispatchError, LifecycleError};

// Global state objects.
static PROXY: OnceCell<Proxy> = OnceCell::new();

/// Install the process-wide proxy. Fails if one is already installed.
pub fn install(proxy: Proxy) -> Result<&'static Proxy, LifecycleError> {
    let mut installed = false;
    let proxy = PROXY.get_or_init(|| {
        installed = true;
        proxy
    });

    if installed {
        Ok(proxy)
    } else {
        Err(LifecycleError::AlreadyInstalled)
    }
}

/// The process-wide proxy.
pub fn proxy() -> Result<&'static Proxy, LifecycleError> {
    PROXY.get().ok_or(LifecycleError::NotInstalled)
}

/// Attach a console and start diagnostic logging. Failures are swallowed.
///
/// Uses the configuration of the installed proxy, or the environment if
/// there is none yet. Logs go to the configured file, or next to the proxy
/// module.
pub fn open_debug_terminal() {
    let config = match PROXY.get() {
        Some(proxy) => proxy.config().clone(),
        None => Config::from_env(),
    };

    let log_file = config
        .log_file
        .clone()
        .or_else(|| ProxyModule::current().ok().map(|module| module.log_path()));

    console::open_debug_terminal(&config, log_file);
}

/// Intercept `export` of the installed proxy with a function of the same
/// signature. Returns an accessor for the genuine export.
pub fn register_callback(export: &str, interceptor: RawFn) -> Result<OriginalAccessor> {
    Ok(proxy()?.register_raw(export, interceptor)?)
}

/// Intercept the typed `export` of the installed proxy with a closure. See
/// [`Proxy::register`].
pub fn register<F, C>(export: &str, interceptor: C) -> Result<OriginalAccessor>
where
    F: ExportFn,
    C: Fn(&Forward<F>, F::Args) -> F::Output + Send + Sync + 'static,
{
    Ok(proxy()?.register(export, interceptor)?)
}

/// Locate the genuine library and bind the export table of the installed
/// proxy. `module` is the proxy module itself.
pub fn create_proxy(module: &ProxyModule) -> Result<()> {
    Ok(proxy()?.attach(module)?)
}

/// Route a typed export call through the installed proxy.
///
/// # Safety
///
/// See [`Dispatcher::dispatch`].
#[doc(hidden)]
pub unsafe fn dispatch<F: ExportFn>(
    slot: &Slot,
    args: F::Args,
) -> Result<F::Output, DispatchError> {
    match PROXY.get() {
        Some(proxy) => unsafe { proxy.dispatcher().dispatch::<F>(slot, args) },
        None => Err(DispatchError::InvalidState { export: slot.key(), phase: Phase::NotAttached }),
    }
}

/// Process attach: install a proxy for `surface`, run `init`, then attach.
/// Returns whether the host may keep the module loaded.
#[cfg(windows)]
pub fn attach_module(
    surface: &'static Surface,
    hinstance: windows::Win32::Foundation::HINSTANCE,
    init: impl FnOnce(&'static Proxy),
) -> bool {
    let module = match ProxyModule::from_hinstance(hinstance) {
        Ok(module) => module,
        Err(e) => {
            tracing::error!("Couldn't identify the proxy module: {e:?}");
            return false;
        },
    };

    let proxy = match install(Proxy::new(surface, Config::from_env())) {
        Ok(proxy) => proxy,
        Err(e) => {
            tracing::error!("{e}");
            return false;
        },
    };

    init(proxy);

    match proxy.attach(&module) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("{e}");
            false
        },
    }
}

/// Process detach: tear the installed proxy down.
#[cfg(windows)]
pub fn detach_module(terminating: bool) {
    if let Some(proxy) = PROXY.get() {
        proxy.detach(terminating);
    }

    #[cfg(feature = "console")]
    {
        if let Err(e) = console::free_console() {
            tracing::error!("{e:?}");
        }
    }
}

/// Entry point generator for the library.
///
/// Declare the export surface with [`exports!`], then invoke the macro to
/// generate the `DllMain` that installs a [`Proxy`] for it. `init` runs
/// before the genuine library is loaded and is the place to open the debug
/// terminal and register interceptors. If the genuine library can't be
/// found or doesn't match the surface, `DllMain` fails and the host sees the
/// same error it would for a missing library.
///
/// Example usage:
/// ```ignore
/// uniproxy::exports! {
///     pub static VERSION = "version.dll";
///     forward {
///         GetFileVersionInfoA @ 1,
///         // ...
///     }
/// }
///
/// uniproxy::proxy_dll!(VERSION, |_proxy: &'static uniproxy::Proxy| {
///     uniproxy::open_debug_terminal();
/// });
/// ```
#[cfg(windows)]
#[macro_export]
macro_rules! proxy_dll {
    ($surface:path, $init:expr) => {
        /// Entry point created by the `uniproxy` library.
        #[no_mangle]
        pub unsafe extern "system" fn DllMain(
            hmodule: $crate::windows::Win32::Foundation::HINSTANCE,
            reason: u32,
            reserved: *mut ::std::ffi::c_void,
        ) -> $crate::windows::Win32::Foundation::BOOL {
            use $crate::windows::Win32::Foundation::{BOOL, TRUE};
            use $crate::windows::Win32::System::SystemServices::{
                DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH,
            };

            match reason {
                DLL_PROCESS_ATTACH => {
                    $crate::tracing::trace!("DllMain(DLL_PROCESS_ATTACH)");
                    BOOL::from($crate::attach_module(&$surface, hmodule, $init))
                },
                DLL_PROCESS_DETACH => {
                    $crate::tracing::trace!("DllMain(DLL_PROCESS_DETACH)");
                    // Non-null when the whole process is going away.
                    $crate::detach_module(!reserved.is_null());
                    TRUE
                },
                _ => TRUE,
            }
        }
    };
}
