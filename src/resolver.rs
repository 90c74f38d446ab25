//! Locating the genuine library.
//!
//! The proxy usually sits where the host looks for the genuine library first
//! (next to the executable), so the genuine one has to be found elsewhere:
//! explicitly configured locations first, then the platform's system
//! directories. The proxy's own path is never a candidate.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::config::Config;
use crate::error::ResolutionError;
use crate::library::{Library, Loader};

/// Finds and loads the genuine library.
pub struct Resolver<'a> {
    config: &'a Config,
    loader: &'a dyn Loader,
}

impl<'a> Resolver<'a> {
    /// Create a resolver.
    pub fn new(config: &'a Config, loader: &'a dyn Loader) -> Self {
        Self { config, loader }
    }

    /// Candidate paths for `library`, in search order.
    pub fn candidates(&self, library: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Some(path) = &self.config.genuine_path {
            candidates.push(if path.is_dir() { path.join(library) } else { path.clone() });
        }

        candidates.extend(self.config.search_paths.iter().map(|dir| dir.join(library)));
        candidates.extend(system_dirs().into_iter().map(|dir| dir.join(library)));

        let mut seen: Vec<PathBuf> = Vec::with_capacity(candidates.len());
        candidates.retain(|candidate| {
            let fresh = !seen.iter().any(|s| same_path(s, candidate));
            if fresh {
                seen.push(candidate.clone());
            }
            fresh
        });
        candidates
    }

    /// Load the first existing candidate for `library` that isn't `exclude`.
    pub fn locate(
        &self,
        library: &str,
        exclude: Option<&Path>,
    ) -> Result<Box<dyn Library>, ResolutionError> {
        let mut searched = Vec::new();

        for candidate in self.candidates(library) {
            if exclude.is_some_and(|exclude| same_path(&candidate, exclude)) {
                debug!("skipping {candidate:?}: it's the proxy itself");
                continue;
            }

            searched.push(candidate.clone());
            if !candidate.is_file() {
                debug!("{candidate:?} doesn't exist");
                continue;
            }

            return match self.loader.load(&candidate) {
                Ok(genuine) => {
                    info!("genuine {library} loaded from {candidate:?}");
                    Ok(genuine)
                },
                Err(source) => Err(ResolutionError::LoadFailed { path: candidate, source }),
            };
        }

        Err(ResolutionError::NotFound { library: library.to_owned(), searched })
    }
}

/// Whether two paths designate the same file.
pub(crate) fn same_path(a: &Path, b: &Path) -> bool {
    let a = fs::canonicalize(a).unwrap_or_else(|_| a.to_path_buf());
    let b = fs::canonicalize(b).unwrap_or_else(|_| b.to_path_buf());

    if cfg!(windows) {
        a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}

/// Platform library directories, in search order.
#[cfg(windows)]
pub fn system_dirs() -> Vec<PathBuf> {
    use std::ffi::OsString;
    use std::os::windows::ffi::OsStringExt;

    use windows::Win32::Foundation::MAX_PATH;
    use windows::Win32::System::SystemInformation::{GetSystemDirectoryW, GetWindowsDirectoryW};

    let query = |f: unsafe fn(Option<&mut [u16]>) -> u32| {
        let mut buf = [0u16; MAX_PATH as usize];
        let len = unsafe { f(Some(&mut buf)) } as usize;
        (len > 0 && len < buf.len()).then(|| PathBuf::from(OsString::from_wide(&buf[..len])))
    };

    [query(GetSystemDirectoryW), query(GetWindowsDirectoryW)].into_iter().flatten().collect()
}

/// Platform library directories, in search order.
#[cfg(all(unix, not(target_os = "macos")))]
pub fn system_dirs() -> Vec<PathBuf> {
    let multiarch = format!("{}-linux-gnu", std::env::consts::ARCH);
    vec![
        Path::new("/lib").join(&multiarch),
        Path::new("/usr/lib").join(&multiarch),
        PathBuf::from("/lib64"),
        PathBuf::from("/usr/lib64"),
        PathBuf::from("/lib"),
        PathBuf::from("/usr/lib"),
    ]
}

/// Platform library directories, in search order.
#[cfg(target_os = "macos")]
pub fn system_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("/usr/local/lib"), PathBuf::from("/usr/lib")]
}
