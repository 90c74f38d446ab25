//! Error types.
//!
//! Every fallible operation of the crate returns one of the component errors
//! below; [`Error`] wraps all of them for callers that don't care which
//! component failed.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::Phase;
use crate::surface::ExportKey;

/// Errors raised while reading the export directory of a library image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The image couldn't be read from disk.
    #[error("couldn't read image: {0}")]
    Io(#[from] std::io::Error),
    /// The image is not a well-formed executable.
    #[error("couldn't parse image: {0}")]
    Parse(#[from] goblin::error::Error),
    /// The image is well-formed but its format carries no export directory we
    /// understand.
    #[error("unsupported image format: {0}")]
    Unsupported(&'static str),
}

/// Errors raised by a [`Loader`](crate::library::Loader).
#[derive(Debug, Error)]
pub enum LoadError {
    /// The platform loader refused the library.
    #[error(transparent)]
    Loader(#[from] libloading::Error),
    /// The library's export directory couldn't be read.
    #[error(transparent)]
    Image(#[from] ImageError),
    /// Any other loader-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Errors raised while locating and loading the genuine library.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// No candidate path contains the library.
    #[error("genuine library {library} not found ({} candidates searched)", .searched.len())]
    NotFound {
        /// Library file name.
        library: String,
        /// Candidates that were checked, in order.
        searched: Vec<PathBuf>,
    },
    /// A candidate exists but couldn't be loaded (corrupt image, wrong
    /// architecture, ...).
    #[error("couldn't load genuine library at {}: {source}", .path.display())]
    LoadFailed {
        /// Path of the candidate.
        path: PathBuf,
        /// Underlying loader error.
        #[source]
        source: LoadError,
    },
}

/// Errors raised while binding the declared surface to the genuine exports.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The proxy declares an export the genuine library doesn't have.
    #[error("export {0} is declared by the proxy but missing from the genuine library")]
    MissingExport(ExportKey),
    /// The genuine library has exports the proxy doesn't surface.
    #[error("{} genuine exports are not surfaced by the proxy", .0.len())]
    Uncovered(Vec<ExportKey>),
}

/// Errors raised by the callback registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistrationError {
    /// An interceptor is already registered for this export.
    #[error("an interceptor is already registered for {0}")]
    DuplicateName(String),
    /// The genuine library hasn't been resolved yet.
    #[error("original address of {0} is not resolved yet")]
    NotYetResolved(String),
    /// The export is not part of the proxy's surface.
    #[error("{0} is not exported by this proxy")]
    UnknownExport(String),
    /// A typed interceptor was registered on an export without a known
    /// signature.
    #[error("{0} is a forward-only export and cannot take a typed interceptor")]
    Untyped(String),
    /// A typed interceptor doesn't have the signature the export was
    /// declared with.
    #[error("interceptor signature doesn't match the declaration of {0}")]
    SignatureMismatch(String),
}

/// Errors raised by the call dispatcher. These are distinct from whatever the
/// genuine function returns.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The genuine library wasn't resolved within the configured timeout.
    #[error("export {export} was not resolved within {waited:?}")]
    Timeout {
        /// Export being called.
        export: ExportKey,
        /// Time spent waiting.
        waited: Duration,
    },
    /// The proxy is not in a phase admitting calls.
    #[error("export {export} called while the proxy is {phase:?}")]
    InvalidState {
        /// Export being called.
        export: ExportKey,
        /// Phase observed at admission.
        phase: Phase,
    },
    /// The registered interceptor was built for a different signature.
    #[error("interceptor for {export} was registered with a different signature")]
    SignatureMismatch {
        /// Export being called.
        export: ExportKey,
    },
}

/// Reasons an attach can fail.
#[derive(Debug, Error)]
pub enum AttachError {
    /// The genuine library couldn't be located or loaded.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// The surface doesn't match the genuine library.
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    /// Attach was requested from a phase that doesn't allow it.
    #[error("cannot attach while {0:?}")]
    Phase(Phase),
}

/// Errors raised by the lifecycle controller.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Attach failed; the proxy is unloaded and refuses every call.
    #[error("proxy attach failed: {0}")]
    AttachFailed(#[source] AttachError),
    /// A proxy was already installed in this process.
    #[error("a proxy is already installed in this process")]
    AlreadyInstalled,
    /// No proxy has been installed in this process.
    #[error("no proxy is installed in this process")]
    NotInstalled,
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    /// See [`ImageError`].
    #[error(transparent)]
    Image(#[from] ImageError),
    /// See [`LoadError`].
    #[error(transparent)]
    Load(#[from] LoadError),
    /// See [`ResolutionError`].
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// See [`SynthesisError`].
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    /// See [`RegistrationError`].
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    /// See [`DispatchError`].
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// See [`LifecycleError`].
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Crate-level result.
pub type Result<T, E = Error> = std::result::Result<T, E>;
