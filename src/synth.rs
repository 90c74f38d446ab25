//! Binding the declared surface to the genuine exports.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::error::SynthesisError;
use crate::library::{ExportDescriptor, Library};
use crate::registry::Registry;
use crate::surface::{ExportKey, Slot, SlotKind, Surface};

/// A declared slot and the genuine export it forwards to.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Proxy slot.
    pub slot: &'static Slot,
    /// Genuine export.
    pub descriptor: ExportDescriptor,
}

/// The proxy's forwarding table: every declared slot bound 1:1 to a genuine
/// export.
#[derive(Debug)]
pub struct ExportTable {
    bindings: Vec<Binding>,
    uncovered: Vec<ExportKey>,
}

impl ExportTable {
    /// Bind every slot of `surface` to the export of `genuine` with the same
    /// key.
    ///
    /// Nothing is published unless every declared slot has a genuine
    /// counterpart. Genuine exports without a slot fail the synthesis when
    /// `strict`, and are only reported otherwise.
    pub fn synthesize(
        surface: &Surface,
        genuine: &dyn Library,
        registry: &Registry,
        strict: bool,
    ) -> Result<Self, SynthesisError> {
        let exports = genuine
            .exports()
            .iter()
            .map(|descriptor| (descriptor.key(), descriptor))
            .collect::<HashMap<_, _>>();

        let bindings = surface
            .slots()
            .iter()
            .map(|&slot| {
                let key = slot.key();
                match exports.get(&key) {
                    Some(&descriptor) => Ok(Binding { slot, descriptor: descriptor.clone() }),
                    None => Err(SynthesisError::MissingExport(key)),
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let declared = surface.slots().iter().map(|slot| slot.key()).collect::<HashSet<_>>();
        let mut uncovered = genuine
            .exports()
            .iter()
            .map(ExportDescriptor::key)
            .filter(|key| !declared.contains(key))
            .collect::<Vec<_>>();
        uncovered.sort();

        if !uncovered.is_empty() {
            if strict {
                return Err(SynthesisError::Uncovered(uncovered));
            }
            for key in &uncovered {
                warn!("genuine export {key} is not surfaced by the proxy");
            }
        }

        let published = bindings
            .iter()
            .map(|binding| (binding.slot, binding.descriptor.address))
            .collect::<Vec<_>>();
        registry.bind(&published);

        for binding in &bindings {
            debug!("bound {:?}", binding.descriptor);
        }

        Ok(Self { bindings, uncovered })
    }

    /// Every binding, in surface order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Genuine exports the table forwards to.
    pub fn descriptors(&self) -> impl Iterator<Item = &ExportDescriptor> {
        self.bindings.iter().map(|binding| &binding.descriptor)
    }

    /// Genuine exports the surface doesn't cover. Always empty for strict
    /// tables.
    pub fn uncovered(&self) -> &[ExportKey] {
        &self.uncovered
    }

    /// Reset the typed slots of the table. Forward slots keep their
    /// binding.
    pub(crate) fn unbind_typed(&self) {
        for binding in &self.bindings {
            if binding.slot.kind() == SlotKind::Typed {
                binding.slot.reset();
            }
        }
    }
}
