//! The proxy context object.

use std::any::{Any, TypeId};
use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::abi::{ExportFn, RawFn};
use crate::config::Config;
use crate::dispatch::{Dispatcher, Forward, Handler};
use crate::error::{AttachError, LifecycleError, RegistrationError};
use crate::library::{Library, Loader, SystemLoader};
use crate::lifecycle::{Lifecycle, Phase};
use crate::registry::{Interceptor, OriginalAccessor, Registry};
use crate::resolver::Resolver;
use crate::surface::{ExportKey, Slot, SlotKind, Surface};
use crate::synth::ExportTable;
use crate::util::ProxyModule;

#[derive(Default)]
struct Attached {
    library: Option<Box<dyn Library>>,
    table: Option<ExportTable>,
}

/// Everything a proxy module owns: its surface, the genuine library, the
/// export table, the interceptor registry and the lifecycle gate.
///
/// A process normally has exactly one, [installed](crate::install) by the
/// generated `DllMain`; the object itself carries no global state, so any
/// number can coexist in tests as long as their surfaces don't share slots.
pub struct Proxy {
    surface: &'static Surface,
    config: Config,
    loader: Box<dyn Loader>,
    lifecycle: Lifecycle,
    registry: Registry,
    attached: Mutex<Attached>,
}

impl Proxy {
    /// A proxy for `surface` loading the genuine library with the system
    /// loader.
    pub fn new(surface: &'static Surface, config: Config) -> Self {
        Self::with_loader(surface, config, SystemLoader)
    }

    /// A proxy for `surface` loading the genuine library with `loader`.
    pub fn with_loader(
        surface: &'static Surface,
        config: Config,
        loader: impl Loader + 'static,
    ) -> Self {
        Self {
            surface,
            config,
            loader: Box::new(loader),
            lifecycle: Lifecycle::new(),
            registry: Registry::new(),
            attached: Mutex::new(Attached::default()),
        }
    }

    /// The declared export surface.
    pub fn surface(&self) -> &'static Surface {
        self.surface
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.lifecycle.phase()
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Registered interceptors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// A dispatcher routing calls through this proxy.
    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher::new(self)
    }

    fn slot(&self, export: &str) -> Result<&'static Slot, RegistrationError> {
        self.surface.find(export).ok_or_else(|| RegistrationError::UnknownExport(export.to_owned()))
    }

    /// Replace `export` with `interceptor`, a function with the exact
    /// signature of the genuine export.
    ///
    /// Works on every export. `export` is a name, or `#N` for ordinal `N`.
    pub fn register_raw(
        &self,
        export: &str,
        interceptor: RawFn,
    ) -> Result<OriginalAccessor, RegistrationError> {
        let slot = self.slot(export)?;
        self.registry.insert(slot, Interceptor::Raw(interceptor))
    }

    /// Replace the typed export `export` with a closure. The closure receives
    /// a [`Forward`] to call the genuine export with.
    ///
    /// `F` must be the function pointer type the export was declared with,
    /// e.g. `unsafe extern "system" fn(u32) -> i32`, otherwise registration
    /// fails with [`RegistrationError::SignatureMismatch`].
    pub fn register<F, C>(
        &self,
        export: &str,
        interceptor: C,
    ) -> Result<OriginalAccessor, RegistrationError>
    where
        F: ExportFn,
        C: Fn(&Forward<F>, F::Args) -> F::Output + Send + Sync + 'static,
    {
        let slot = self.slot(export)?;
        if slot.kind() != SlotKind::Typed {
            return Err(RegistrationError::Untyped(export.to_owned()));
        }
        if slot.signature() != Some(TypeId::of::<F>()) {
            return Err(RegistrationError::SignatureMismatch(export.to_owned()));
        }

        let handler: Handler<F> = Box::new(interceptor);
        let handler: Arc<dyn Any + Send + Sync> = Arc::new(handler);
        self.registry.insert(slot, Interceptor::Typed(handler))
    }

    /// Remove the interceptor of `export`, restoring direct forwarding.
    pub fn unregister(&self, export: &str) -> Result<(), RegistrationError> {
        let slot = self.slot(export)?;
        self.registry.remove(&slot.key());
        Ok(())
    }

    /// Accessor for the genuine address of `export`, whether intercepted or
    /// not.
    pub fn original(&self, export: &str) -> Result<OriginalAccessor, RegistrationError> {
        self.slot(export).map(OriginalAccessor::new)
    }

    /// Locate the genuine library and bind the export table.
    ///
    /// Only the first call from [`Phase::NotAttached`] does anything; calls
    /// during or after a successful attach are no-ops. A failure leaves the
    /// proxy [`Phase::Unloaded`] for good.
    pub fn attach(&self, module: &ProxyModule) -> Result<(), LifecycleError> {
        match self.lifecycle.transition(Phase::NotAttached, Phase::Attaching) {
            Ok(()) => {},
            Err(Phase::Attaching | Phase::Active) => {
                debug!("proxy is already attached");
                return Ok(());
            },
            Err(phase) => return Err(LifecycleError::AttachFailed(AttachError::Phase(phase))),
        }

        match self.bind(module) {
            Ok(()) => {
                self.lifecycle
                    .transition(Phase::Attaching, Phase::Active)
                    .map_err(|phase| LifecycleError::AttachFailed(AttachError::Phase(phase)))?;
                info!("proxy for {} is active", self.surface.library());
                Ok(())
            },
            Err(e) => {
                self.lifecycle.set(Phase::Unloaded);
                error!("couldn't attach proxy for {}: {e}", self.surface.library());
                Err(LifecycleError::AttachFailed(e))
            },
        }
    }

    fn bind(&self, module: &ProxyModule) -> Result<(), AttachError> {
        let library = self.surface.library();
        if !module.matches_library(library) {
            warn!("proxy module {:?} doesn't occupy the name of {library}", module.path());
        }

        let genuine = Resolver::new(&self.config, self.loader.as_ref())
            .locate(library, Some(module.path()))?;
        let table = ExportTable::synthesize(
            self.surface,
            genuine.as_ref(),
            &self.registry,
            self.config.strict,
        )?;

        let mut attached = self.attached.lock();
        attached.library = Some(genuine);
        attached.table = Some(table);
        Ok(())
    }

    /// Stop admitting calls, drain the in-flight ones, drop every interceptor
    /// and release the genuine library.
    ///
    /// Forward exports stay bound to the genuine library, which then stays
    /// mapped for the life of the process: calls through them are not
    /// tracked and may still be running, or arrive later. The same happens
    /// to every binding if typed calls are still in flight after the
    /// configured timeout, or the process is `terminating`.
    pub fn detach(&self, terminating: bool) {
        match self.lifecycle.transition(Phase::Active, Phase::Detaching) {
            Ok(()) => {},
            Err(Phase::Detaching | Phase::Unloaded) => return,
            Err(phase) => {
                debug!("detaching from {phase:?}");
                self.lifecycle.set(Phase::Detaching);
            },
        }

        let drained = !terminating && self.lifecycle.drain(self.config.detach_timeout);
        if !drained && !terminating {
            warn!(
                "{} calls still in flight after {:?}, leaking the genuine library",
                self.lifecycle.in_flight(),
                self.config.detach_timeout
            );
        }

        self.registry.clear();

        let mut attached = self.attached.lock();
        let table = attached.table.take();
        let library = attached.library.take();
        drop(attached);

        // Trampoline calls aren't counted, so a surface with forward exports
        // can never tell that the genuine library is idle.
        let forwards = self.surface.slots().iter().any(|slot| slot.kind() == SlotKind::Forward);

        if drained {
            if let Some(table) = &table {
                table.unbind_typed();
            }
        }
        if drained && !forwards {
            drop(library);
        } else {
            debug!("keeping the genuine library mapped");
            mem::forget(library);
        }

        self.lifecycle.set(Phase::Unloaded);
        info!("proxy for {} unloaded", self.surface.library());
    }

    /// Run `f` on the export table, if attached.
    pub fn with_table<R>(&self, f: impl FnOnce(&ExportTable) -> R) -> Option<R> {
        self.attached.lock().table.as_ref().map(f)
    }

    /// Keys of every export the proxy forwards, once attached.
    pub fn exports(&self) -> Vec<ExportKey> {
        self.with_table(|table| table.bindings().iter().map(|b| b.slot.key()).collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("library", &self.surface.library())
            .field("phase", &self.phase())
            .field("interceptors", &self.registry.len())
            .finish()
    }
}
