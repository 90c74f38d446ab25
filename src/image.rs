//! Export directory scanning.
//!
//! The platform loaders only resolve exports we already know the name or
//! ordinal of, so the export list of the genuine library is read from its
//! image on disk with [`goblin`].

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use goblin::elf::section_header::SHN_UNDEF;
use goblin::elf::sym::{STB_GLOBAL, STB_WEAK, STT_FUNC, STT_GNU_IFUNC};
use goblin::pe::export::ExportAddressTableEntry;
use goblin::Object;
use tracing::debug;

use crate::error::ImageError;

/// An entry of an image's export directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageExport {
    /// Export name, `None` for ordinal-only exports.
    pub name: Option<String>,
    /// Export ordinal. Always 0 on formats without ordinals.
    pub ordinal: u16,
}

/// Read the export directory of the image at `path`.
pub fn scan(path: &Path) -> Result<Vec<ImageExport>, ImageError> {
    let bytes = fs::read(path)?;
    let exports = parse(&bytes)?;
    debug!("{} exports in {path:?}", exports.len());
    Ok(exports)
}

/// Read the export directory of an in-memory image.
pub fn parse(bytes: &[u8]) -> Result<Vec<ImageExport>, ImageError> {
    match Object::parse(bytes)? {
        Object::PE(pe) => {
            let Some(data) = pe.export_data else {
                return Ok(Vec::new());
            };

            let functions = data
                .export_address_table
                .iter()
                .map(|entry| match *entry {
                    ExportAddressTableEntry::ExportRVA(rva) => rva,
                    ExportAddressTableEntry::ForwarderRVA(rva) => rva,
                })
                .collect::<Vec<_>>();

            let names = pe
                .exports
                .iter()
                .filter_map(|export| export.name.map(|name| (name.to_owned(), export.rva as u32)))
                .collect::<Vec<_>>();

            Ok(assign_ordinals(
                data.export_directory_table.ordinal_base,
                &functions,
                &data.export_ordinal_table,
                &names,
            ))
        },
        Object::Elf(elf) => {
            let mut exports = elf
                .dynsyms
                .iter()
                .filter(|sym| {
                    matches!(sym.st_type(), STT_FUNC | STT_GNU_IFUNC)
                        && sym.st_shndx != SHN_UNDEF as usize
                        && matches!(sym.st_bind(), STB_GLOBAL | STB_WEAK)
                })
                .filter_map(|sym| elf.dynstrtab.get_at(sym.st_name))
                .filter(|name| !name.is_empty())
                .map(|name| ImageExport { name: Some(name.to_owned()), ordinal: 0 })
                .collect::<Vec<_>>();
            exports.sort_by(|a, b| a.name.cmp(&b.name));
            exports.dedup();
            Ok(exports)
        },
        Object::Mach(_) => Err(ImageError::Unsupported("Mach-O")),
        Object::Archive(_) => Err(ImageError::Unsupported("archive")),
        _ => Err(ImageError::Unsupported("unknown")),
    }
}

/// Pair names with ordinals and append the ordinal-only exports.
///
/// `functions` is the export address table, `name_ordinals` the ordinal table
/// (indices into `functions`, parallel to the name table) and `names` the
/// `(name, rva)` pairs in name table order. A name is paired with the ordinal
/// table entry at its own index when the addresses agree, otherwise with the
/// first unclaimed entry pointing at the same address.
pub(crate) fn assign_ordinals(
    base: u32,
    functions: &[u32],
    name_ordinals: &[u16],
    names: &[(String, u32)],
) -> Vec<ImageExport> {
    let rva_of = |index: u16| functions.get(index as usize).copied();
    let mut claimed = HashSet::new();
    let mut exports = Vec::with_capacity(functions.len());

    for (i, (name, rva)) in names.iter().enumerate() {
        let index = name_ordinals
            .get(i)
            .copied()
            .filter(|&index| rva_of(index) == Some(*rva) && !claimed.contains(&index))
            .or_else(|| {
                name_ordinals
                    .iter()
                    .copied()
                    .find(|&index| rva_of(index) == Some(*rva) && !claimed.contains(&index))
            });

        let Some(index) = index else {
            debug!("couldn't find an ordinal for {name}");
            continue;
        };

        claimed.insert(index);
        exports.push(ImageExport { name: Some(name.clone()), ordinal: ordinal(base, index) });
    }

    for (index, &rva) in functions.iter().enumerate() {
        let index = index as u16;
        // Zero entries are holes in the ordinal range.
        if rva != 0 && !name_ordinals.contains(&index) {
            exports.push(ImageExport { name: None, ordinal: ordinal(base, index) });
        }
    }

    exports.sort_by_key(|export| export.ordinal);
    exports
}

fn ordinal(base: u32, index: u16) -> u16 {
    (base + index as u32) as u16
}
