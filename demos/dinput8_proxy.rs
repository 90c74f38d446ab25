//! A `dinput8.dll` proxy that logs every `DirectInput8Create` call and
//! forwards everything to the genuine library.
//!
//! Build with `cargo build --example dinput8_proxy`, rename the resulting
//! `dinput8_proxy.dll` to `dinput8.dll` and drop it next to the executable of
//! a DirectInput application.
#![cfg(windows)]

use std::ffi::c_void;

use once_cell::sync::OnceCell;
use tracing::{error, info};
use uniproxy::windows::core::{GUID, HRESULT};
use uniproxy::windows::Win32::Foundation::{E_FAIL, HINSTANCE};
use uniproxy::{ExportFn, OriginalAccessor, Proxy};

type FnDirectInput8Create = unsafe extern "system" fn(
    hinst: HINSTANCE,
    dwversion: u32,
    riidltf: *const GUID,
    ppvout: *mut *mut c_void,
    punkouter: *mut c_void,
) -> HRESULT;

uniproxy::exports! {
    pub static DINPUT8 = "dinput8.dll";
    forward {
        DllCanUnloadNow @ 2,
        DllGetClassObject @ 3,
        DllRegisterServer @ 4,
        DllUnregisterServer @ 5,
        GetdfDIJoystick @ 6,
    }
    typed {
        #[ordinal = 1]
        extern "system" fn DirectInput8Create(
            hinst: HINSTANCE,
            dwversion: u32,
            riidltf: *const GUID,
            ppvout: *mut *mut c_void,
            punkouter: *mut c_void,
        ) -> HRESULT = E_FAIL;
    }
}

static ORIGINAL: OnceCell<OriginalAccessor> = OnceCell::new();

unsafe extern "system" fn direct_input8_create_callback(
    hinst: HINSTANCE,
    dwversion: u32,
    riidltf: *const GUID,
    ppvout: *mut *mut c_void,
    punkouter: *mut c_void,
) -> HRESULT {
    info!("DirectInput8Create(version = {dwversion:#x})");

    let original =
        ORIGINAL.get().map(|original| unsafe { original.get_as::<FnDirectInput8Create>() });
    match original {
        Some(Ok(original)) => unsafe { original(hinst, dwversion, riidltf, ppvout, punkouter) },
        Some(Err(e)) => {
            error!("{e}");
            E_FAIL
        },
        None => E_FAIL,
    }
}

fn init(_proxy: &'static Proxy) {
    uniproxy::open_debug_terminal();

    let callback: FnDirectInput8Create = direct_input8_create_callback;
    match uniproxy::register_callback("DirectInput8Create", callback.into_raw()) {
        Ok(original) => {
            ORIGINAL.set(original).ok();
        },
        Err(e) => error!("Couldn't register callback: {e}"),
    }
}

uniproxy::proxy_dll!(DINPUT8, init);
