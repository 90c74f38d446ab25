#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use uniproxy::error::LoadError;
use uniproxy::library::{ExportDescriptor, Library, Loader};
use uniproxy::{Config, ExportFn, ProxyModule, RawFn, Slot, Surface};

pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A named genuine export.
pub fn export<F: ExportFn>(name: &str, ordinal: u16, f: F) -> ExportDescriptor {
    ExportDescriptor { name: Some(name.to_owned()), ordinal, address: f.into_raw() }
}

/// An ordinal-only genuine export.
pub fn noname<F: ExportFn>(ordinal: u16, f: F) -> ExportDescriptor {
    ExportDescriptor { name: None, ordinal, address: f.into_raw() }
}

/// A surface with its own slots, so tests never share binding state.
pub fn surface(library: &'static str, slots: Vec<Slot>) -> &'static Surface {
    let slots = slots.into_iter().map(|slot| &*Box::leak(Box::new(slot))).collect::<Vec<&Slot>>();
    Box::leak(Box::new(Surface::new(library, Box::leak(slots.into_boxed_slice()))))
}

pub struct StubLibrary {
    path: PathBuf,
    exports: Vec<ExportDescriptor>,
    drops: Arc<AtomicUsize>,
}

impl Library for StubLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn exports(&self) -> &[ExportDescriptor] {
        &self.exports
    }
}

impl Drop for StubLibrary {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serves the same export list for every path, recording what it loaded.
#[derive(Clone, Default)]
pub struct StubLoader {
    exports: Vec<ExportDescriptor>,
    fail: bool,
    pub loads: Arc<Mutex<Vec<PathBuf>>>,
    pub drops: Arc<AtomicUsize>,
}

impl StubLoader {
    pub fn new(exports: Vec<ExportDescriptor>) -> Self {
        Self { exports, ..Default::default() }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Default::default() }
    }

    pub fn loads(&self) -> Vec<PathBuf> {
        self.loads.lock().unwrap().clone()
    }

    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

impl Loader for StubLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Library>, LoadError> {
        self.loads.lock().unwrap().push(path.to_path_buf());
        if self.fail {
            return Err(LoadError::Other(format!("{} is not a valid image", path.display())));
        }

        Ok(Box::new(StubLibrary {
            path: path.to_path_buf(),
            exports: self.exports.clone(),
            drops: Arc::clone(&self.drops),
        }))
    }
}

/// A directory tree with the proxy in `app/` and the genuine library in
/// `system/`. Both directories are on the search path, `app/` first.
pub struct Fixture {
    pub dir: TempDir,
    pub module: ProxyModule,
    pub genuine: PathBuf,
}

impl Fixture {
    pub fn new(library: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        let system = dir.path().join("system");
        fs::create_dir_all(&app).unwrap();
        fs::create_dir_all(&system).unwrap();

        let module = app.join(library);
        let genuine = system.join(library);
        fs::write(&module, b"proxy").unwrap();
        fs::write(&genuine, b"genuine").unwrap();

        Self { dir, module: ProxyModule::from_path(module), genuine }
    }

    /// Only the proxy exists.
    pub fn without_genuine(library: &str) -> Self {
        let fixture = Self::new(library);
        fs::remove_file(&fixture.genuine).unwrap();
        fixture
    }

    pub fn app_dir(&self) -> PathBuf {
        self.dir.path().join("app")
    }

    pub fn system_dir(&self) -> PathBuf {
        self.dir.path().join("system")
    }

    pub fn config(&self) -> Config {
        Config::default().with_search_path(self.app_dir()).with_search_path(self.system_dir())
    }
}

pub fn raw<F: ExportFn>(f: F) -> RawFn {
    f.into_raw()
}
