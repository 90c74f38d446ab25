//! Loaded genuine libraries.
//!
//! A [`Loader`] turns a path into a [`Library`]: a pinned module handle plus
//! the resolved address of every export. The system implementation pairs
//! [`libloading`] with the [`image`](crate::image) scanner; tests inject stub
//! loaders backed by plain Rust functions.

use std::borrow::Cow;
use std::ffi::c_void;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::abi::RawFn;
use crate::error::LoadError;
use crate::image::{self, ImageExport};
use crate::surface::ExportKey;

/// An export of the genuine library with its resolved address.
#[derive(Clone, PartialEq, Eq)]
pub struct ExportDescriptor {
    /// Export name, `None` for ordinal-only exports.
    pub name: Option<String>,
    /// Export ordinal.
    pub ordinal: u16,
    /// Address of the export in the loaded library.
    pub address: RawFn,
}

impl ExportDescriptor {
    /// Registry key of this export.
    pub fn key(&self) -> ExportKey {
        match &self.name {
            Some(name) => ExportKey::Name(Cow::Owned(name.clone())),
            None => ExportKey::Ordinal(self.ordinal),
        }
    }
}

impl fmt::Debug for ExportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @{} -> {:?}", self.key(), self.ordinal, self.address)
    }
}

/// A loaded library. The module stays mapped for as long as the value lives.
pub trait Library: Send + Sync {
    /// Path the library was loaded from.
    fn path(&self) -> &Path;

    /// Every export of the library, in ordinal order.
    fn exports(&self) -> &[ExportDescriptor];
}

/// Loads libraries by path.
pub trait Loader: Send + Sync {
    /// Load the library at `path` and resolve all of its exports.
    fn load(&self, path: &Path) -> Result<Box<dyn Library>, LoadError>;
}

/// [`Loader`] backed by the platform dynamic loader.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoader;

impl Loader for SystemLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Library>, LoadError> {
        let entries = image::scan(path)?;
        Ok(Box::new(SystemLibrary::load(path, &entries)?))
    }
}

/// A library loaded by [`SystemLoader`].
pub struct SystemLibrary {
    path: PathBuf,
    exports: Vec<ExportDescriptor>,
    // Dropped last: the addresses above point into it.
    _library: os::Library,
}

impl SystemLibrary {
    fn load(path: &Path, entries: &[ImageExport]) -> Result<Self, LoadError> {
        let library = unsafe { os::Library::new(path) }?;

        let exports = entries
            .iter()
            .filter_map(|entry| {
                let address = match os::resolve(&library, entry) {
                    Ok(address) => RawFn::new(address),
                    Err(e) => {
                        debug!("couldn't resolve {entry:?}: {e}");
                        None
                    },
                }?;

                Some(ExportDescriptor { name: entry.name.clone(), ordinal: entry.ordinal, address })
            })
            .collect();

        Ok(Self { path: path.to_path_buf(), exports, _library: library })
    }
}

impl Library for SystemLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn exports(&self) -> &[ExportDescriptor] {
        &self.exports
    }
}

impl fmt::Debug for SystemLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemLibrary")
            .field("path", &self.path)
            .field("exports", &self.exports.len())
            .finish()
    }
}

#[cfg(windows)]
mod os {
    use super::*;

    pub(super) use libloading::os::windows::Library;

    pub(super) fn resolve(
        library: &Library,
        entry: &ImageExport,
    ) -> Result<*const c_void, libloading::Error> {
        let symbol = match &entry.name {
            Some(name) => unsafe { library.get::<*const c_void>(name.as_bytes()) }?,
            None => unsafe { library.get_ordinal::<*const c_void>(entry.ordinal) }?,
        };
        Ok(*symbol)
    }
}

#[cfg(unix)]
mod os {
    use super::*;

    pub(super) use libloading::os::unix::Library;

    pub(super) fn resolve(
        library: &Library,
        entry: &ImageExport,
    ) -> Result<*const c_void, libloading::Error> {
        let Some(name) = &entry.name else {
            return Err(libloading::Error::DlSymUnknown);
        };
        let symbol = unsafe { library.get::<*const c_void>(name.as_bytes()) }?;
        Ok(*symbol)
    }
}
