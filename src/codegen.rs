//! Build-time generation of the export surface.
//!
//! A proxy must export everything the genuine library exports, under the same
//! names and ordinals, and that list is fixed when the proxy is linked. Call
//! [`Generator`] from the proxy crate's `build.rs` to read the genuine image
//! and emit the matching [`exports!`](crate::exports) invocation, a module
//! definition file, and the linker arguments that pin the ordinals.
//!
//! ```no_run
//! // build.rs
//! uniproxy::codegen::Generator::from_image(r"C:\Windows\System32\dinput8.dll")
//!     .unwrap()
//!     .typed("DirectInput8Create", uniproxy::codegen::TypedExport::new(
//!         "system",
//!         "hinst: HINSTANCE, version: u32, riid: *const GUID, \
//!          out: *mut *mut c_void, outer: *mut c_void",
//!         "HRESULT",
//!         "E_FAIL",
//!     ))
//!     .emit()
//!     .unwrap();
//!
//! // lib.rs
//! // include!(concat!(env!("OUT_DIR"), "/exports.rs"));
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::{env, fs, io};

use crate::error::ImageError;
use crate::image::{self, ImageExport};

/// Signature of an export that should be generated as a typed export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedExport {
    /// Calling convention, e.g. `system` or `C`.
    pub abi: String,
    /// Parameter list without parentheses, e.g. `a: u32, b: *mut u8`.
    pub params: String,
    /// Return type.
    pub ret: String,
    /// Expression returned when the call can't be dispatched.
    pub fallback: String,
}

impl TypedExport {
    /// Create a typed export signature.
    pub fn new(
        abi: impl Into<String>,
        params: impl Into<String>,
        ret: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        Self { abi: abi.into(), params: params.into(), ret: ret.into(), fallback: fallback.into() }
    }
}

/// Generates the export surface of a proxy for a genuine library.
#[derive(Debug, Clone)]
pub struct Generator {
    library: String,
    source: Option<PathBuf>,
    surface: String,
    crate_path: String,
    exports: Vec<ImageExport>,
    typed: HashMap<String, TypedExport>,
}

enum Entry<'a> {
    Forward { ident: String, name: &'a str, ordinal: u16 },
    NoName { ident: String, ordinal: u16 },
    Typed { name: &'a str, ordinal: u16, signature: &'a TypedExport },
}

impl Generator {
    /// Read the exports of the genuine library at `path`.
    pub fn from_image(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let library = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or(ImageError::Unsupported("library path has no file name"))?;

        let mut generator = Self::from_exports(library, image::scan(path)?);
        generator.source = Some(path.to_path_buf());
        Ok(generator)
    }

    /// Use an explicit export list.
    pub fn from_exports(library: impl Into<String>, exports: Vec<ImageExport>) -> Self {
        Self {
            library: library.into(),
            source: None,
            surface: "SURFACE".to_owned(),
            crate_path: "uniproxy".to_owned(),
            exports,
            typed: HashMap::new(),
        }
    }

    /// Name of the generated surface static. Defaults to `SURFACE`.
    pub fn surface_name(mut self, name: impl Into<String>) -> Self {
        self.surface = name.into();
        self
    }

    /// Path this crate is reachable at from the proxy crate. Defaults to
    /// `uniproxy`.
    pub fn crate_path(mut self, path: impl Into<String>) -> Self {
        self.crate_path = path.into();
        self
    }

    /// Generate `name` as a typed export with the given signature.
    pub fn typed(mut self, name: impl Into<String>, signature: TypedExport) -> Self {
        self.typed.insert(name.into(), signature);
        self
    }

    fn entries(&self) -> Vec<Entry<'_>> {
        let mut entries = self
            .exports
            .iter()
            .map(|export| match &export.name {
                Some(name) => match self.typed.get(name) {
                    Some(signature) if is_ident(name) => {
                        Entry::Typed { name, ordinal: export.ordinal, signature }
                    },
                    _ => Entry::Forward {
                        ident: if is_ident(name) {
                            name.clone()
                        } else {
                            format!("__export_{}", export.ordinal)
                        },
                        name,
                        ordinal: export.ordinal,
                    },
                },
                None => Entry::NoName {
                    ident: format!("__ordinal_{}", export.ordinal),
                    ordinal: export.ordinal,
                },
            })
            .collect::<Vec<_>>();

        entries.sort_by_key(|entry| match entry {
            Entry::Forward { ordinal, .. } => (0, *ordinal),
            Entry::NoName { ordinal, .. } => (1, *ordinal),
            Entry::Typed { ordinal, .. } => (2, *ordinal),
        });
        entries
    }

    /// The `exports!` invocation.
    pub fn render_exports(&self) -> String {
        let entries = self.entries();
        let mut out = String::new();

        let _ = writeln!(out, "// Generated from {}. Do not edit.", self.library);
        let _ = writeln!(out, "{}::exports! {{", self.crate_path);
        let _ = writeln!(out, "    pub static {} = {:?};", self.surface, self.library);

        let forward = entries.iter().filter(|e| matches!(e, Entry::Forward { .. }));
        if forward.clone().next().is_some() {
            out.push_str("    forward {\n");
            for entry in forward {
                if let Entry::Forward { ident, name, ordinal } = entry {
                    if ident.as_str() == *name {
                        let _ = writeln!(out, "        {ident} @ {ordinal},");
                    } else {
                        let _ = writeln!(out, "        {ident} = {name:?} @ {ordinal},");
                    }
                }
            }
            out.push_str("    }\n");
        }

        let noname = entries.iter().filter(|e| matches!(e, Entry::NoName { .. }));
        if noname.clone().next().is_some() {
            out.push_str("    noname {\n");
            for entry in noname {
                if let Entry::NoName { ident, ordinal } = entry {
                    let _ = writeln!(out, "        {ident} @ {ordinal},");
                }
            }
            out.push_str("    }\n");
        }

        let typed = entries.iter().filter(|e| matches!(e, Entry::Typed { .. }));
        if typed.clone().next().is_some() {
            out.push_str("    typed {\n");
            for entry in typed {
                if let Entry::Typed { name, ordinal, signature } = entry {
                    let _ = writeln!(out, "        #[ordinal = {ordinal}]");
                    let _ = writeln!(
                        out,
                        "        extern {:?} fn {name}({}) -> {} = {};",
                        signature.abi, signature.params, signature.ret, signature.fallback
                    );
                }
            }
            out.push_str("    }\n");
        }

        out.push_str("}\n");
        out
    }

    /// A module definition file for the proxy.
    pub fn render_def(&self) -> String {
        let stem = Path::new(&self.library)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.library);

        let mut out = format!("LIBRARY {stem}\nEXPORTS\n");
        for (export, symbol, ordinal, noname) in self.export_lines() {
            let suffix = if noname { " NONAME" } else { "" };
            if export == symbol {
                let _ = writeln!(out, "    {export} @{ordinal}{suffix}");
            } else {
                let _ = writeln!(out, "    {export}={symbol} @{ordinal}{suffix}");
            }
        }
        out
    }

    /// MSVC linker arguments assigning every export its genuine ordinal.
    pub fn link_args(&self) -> Vec<String> {
        self.export_lines()
            .into_iter()
            .map(|(export, symbol, ordinal, noname)| {
                let target = if export == symbol { export } else { format!("{export}={symbol}") };
                let suffix = if noname { ",NONAME" } else { "" };
                format!("/EXPORT:{target},@{ordinal}{suffix}")
            })
            .collect()
    }

    // (exported name, symbol, ordinal, ordinal-only)
    fn export_lines(&self) -> Vec<(String, String, u16, bool)> {
        let mut lines = self
            .entries()
            .into_iter()
            .map(|entry| match entry {
                Entry::Forward { ident, name, ordinal } => (name.to_owned(), ident, ordinal, false),
                Entry::NoName { ident, ordinal } => (ident.clone(), ident, ordinal, true),
                Entry::Typed { name, ordinal, .. } => {
                    (name.to_owned(), name.to_owned(), ordinal, false)
                },
            })
            .collect::<Vec<_>>();
        lines.sort_by_key(|line| line.2);
        lines
    }

    /// Write `exports.rs` and `<library stem>.def` into `dir`.
    pub fn write(&self, dir: impl AsRef<Path>) -> io::Result<(PathBuf, PathBuf)> {
        let dir = dir.as_ref();
        let exports = dir.join("exports.rs");
        let def = dir.join(Path::new(&self.library).with_extension("def"));

        fs::write(&exports, self.render_exports())?;
        fs::write(&def, self.render_def())?;
        Ok((exports, def))
    }

    /// Build script entry point: write the generated files to `OUT_DIR` and
    /// pass the ordinals to the MSVC linker.
    pub fn emit(&self) -> io::Result<PathBuf> {
        let out_dir = env::var_os("OUT_DIR")
            .map(PathBuf::from)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "OUT_DIR is not set"))?;

        let (exports, _) = self.write(&out_dir)?;

        if let Some(source) = &self.source {
            println!("cargo:rerun-if-changed={}", source.display());
        }

        if env::var("CARGO_CFG_TARGET_ENV").as_deref() == Ok("msvc") {
            for arg in self.link_args() {
                println!("cargo:rustc-cdylib-link-arg={arg}");
            }
        }

        Ok(exports)
    }
}

fn is_ident(name: &str) -> bool {
    const KEYWORDS: &[&str] = &[
        "as", "async", "await", "break", "const", "continue", "crate", "dyn", "else", "enum",
        "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
        "mut", "pub", "ref", "return", "self", "Self", "static", "struct", "super", "trait",
        "true", "type", "unsafe", "use", "where", "while", "abstract", "become", "box", "do",
        "final", "macro", "override", "priv", "try", "typeof", "unsized", "virtual", "yield", "_",
    ];

    let mut chars = name.chars();
    let first_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    first_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') && !KEYWORDS.contains(&name)
}
