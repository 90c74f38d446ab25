//! Identification of the proxy module itself.

use std::path::{Path, PathBuf};

/// The module the proxy is compiled into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyModule {
    path: PathBuf,
}

impl ProxyModule {
    /// A module loaded from `path`.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The module identified by the handle the loader passes to `DllMain`.
    #[cfg(windows)]
    pub fn from_hinstance(
        hinstance: windows::Win32::Foundation::HINSTANCE,
    ) -> windows::core::Result<Self> {
        use windows::Win32::Foundation::HMODULE;

        module_path(HMODULE(hinstance.0)).map(Self::from_path)
    }

    /// The module this function is compiled into.
    #[cfg(windows)]
    pub fn current() -> windows::core::Result<Self> {
        use windows::core::PCWSTR;
        use windows::Win32::Foundation::HMODULE;
        use windows::Win32::System::LibraryLoader::{
            GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
            GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
        };

        let mut hmodule = HMODULE(0);
        unsafe {
            GetModuleHandleExW(
                GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT
                    | GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
                PCWSTR(Self::current as *const () as *const u16),
                &mut hmodule,
            )?
        };

        module_path(hmodule).map(Self::from_path)
    }

    /// The module this function is compiled into.
    #[cfg(unix)]
    pub fn current() -> std::io::Result<Self> {
        use std::ffi::{CStr, OsStr};
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
        let found =
            unsafe { libc::dladdr(Self::current as *const libc::c_void, info.as_mut_ptr()) };
        let info = unsafe { info.assume_init() };
        if found == 0 || info.dli_fname.is_null() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "dladdr couldn't identify the proxy module",
            ));
        }

        let name = unsafe { CStr::from_ptr(info.dli_fname) };
        Ok(Self::from_path(Path::new(OsStr::from_bytes(name.to_bytes()))))
    }

    /// Full path of the module.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File name of the module.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    /// Whether the module occupies the file name of `library`.
    pub fn matches_library(&self, library: &str) -> bool {
        self.file_name().is_some_and(|name| {
            if cfg!(windows) {
                name.eq_ignore_ascii_case(library)
            } else {
                name == library
            }
        })
    }

    /// Default log file: the module path with a `.log` extension.
    pub fn log_path(&self) -> PathBuf {
        self.path.with_extension("log")
    }
}

#[cfg(windows)]
fn module_path(hmodule: windows::Win32::Foundation::HMODULE) -> windows::core::Result<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    use windows::Win32::System::LibraryLoader::GetModuleFileNameW;

    // Long paths are truncated by GetModuleFileNameW; grow until it fits.
    let mut buf = vec![0u16; 260];
    loop {
        let len = unsafe { GetModuleFileNameW(hmodule, buf.as_mut_slice()) } as usize;
        if len == 0 {
            return Err(windows::core::Error::from_win32());
        }
        if len < buf.len() {
            return Ok(OsString::from_wide(&buf[..len]).into());
        }
        buf.resize(buf.len() * 2, 0);
    }
}
