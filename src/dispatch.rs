//! Runtime routing of typed export calls.
//!
//! A typed export hands its arguments, packed in a tuple, to
//! [`Dispatcher::dispatch`]. The call is admitted through the lifecycle gate,
//! then either forwarded straight to the genuine export or handed to the
//! registered interceptor together with a [`Forward`] capability.

use std::fmt;

use crate::abi::ExportFn;
use crate::config::UnresolvedPolicy;
use crate::error::DispatchError;
use crate::lifecycle::Refusal;
use crate::proxy::Proxy;
use crate::registry::Interceptor;
use crate::surface::Slot;

/// Routing state of a single export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    /// The genuine export isn't bound yet.
    Unresolved,
    /// Calls go straight to the genuine export.
    Forwarding,
    /// Calls go to the registered interceptor.
    Intercepted,
    /// The proxy is detaching or detached.
    Closed,
}

/// Capability handed to interceptors to call the genuine export.
///
/// It may be called any number of times, including zero.
pub struct Forward<F: ExportFn> {
    original: F,
}

impl<F: ExportFn> Forward<F> {
    pub(crate) fn new(original: F) -> Self {
        Self { original }
    }

    /// Call the genuine export.
    ///
    /// # Safety
    ///
    /// Whatever the genuine export requires of its arguments.
    pub unsafe fn call(&self, args: F::Args) -> F::Output {
        unsafe { self.original.invoke(args) }
    }

    /// The genuine export as a function pointer.
    pub fn original(&self) -> F {
        self.original
    }
}

impl<F: ExportFn> fmt::Debug for Forward<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forward").field("original", &self.original.into_raw()).finish()
    }
}

/// A closure interceptor for exports of signature `F`.
pub type Handler<F> = Box<
    dyn Fn(&Forward<F>, <F as ExportFn>::Args) -> <F as ExportFn>::Output + Send + Sync + 'static,
>;

/// Routes calls through a [`Proxy`].
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'p> {
    proxy: &'p Proxy,
}

impl<'p> Dispatcher<'p> {
    pub(crate) fn new(proxy: &'p Proxy) -> Self {
        Self { proxy }
    }

    /// Current routing state of the export backed by `slot`.
    pub fn state(&self, slot: &Slot) -> ExportState {
        if self.proxy.phase().is_closed() {
            ExportState::Closed
        } else if !slot.is_bound() {
            ExportState::Unresolved
        } else if self.proxy.registry().contains(&slot.key()) {
            ExportState::Intercepted
        } else {
            ExportState::Forwarding
        }
    }

    /// Route a call to the export backed by `slot`.
    ///
    /// Returns an error, without touching the genuine export, if the call
    /// can't be admitted or the registered interceptor doesn't match `F`.
    ///
    /// # Safety
    ///
    /// `F` must be the exact signature of the genuine export, and `args` must
    /// satisfy whatever it requires of them.
    pub unsafe fn dispatch<F: ExportFn>(
        &self,
        slot: &Slot,
        args: F::Args,
    ) -> Result<F::Output, DispatchError> {
        let wait = match self.proxy.config().unresolved {
            UnresolvedPolicy::Block(timeout) => Some(timeout),
            UnresolvedPolicy::FailFast => None,
        };

        let _guard = self.proxy.lifecycle().admit(wait).map_err(|refusal| match refusal {
            Refusal::Timeout(waited) => DispatchError::Timeout { export: slot.key(), waited },
            Refusal::Phase(phase) => DispatchError::InvalidState { export: slot.key(), phase },
        })?;

        // Admission implies the table is bound, barring a slot that was
        // declared on another surface.
        let original = slot.original().ok_or_else(|| DispatchError::InvalidState {
            export: slot.key(),
            phase: self.proxy.phase(),
        })?;

        let Some(entry) = self.proxy.registry().get(&slot.key()) else {
            return Ok(unsafe { F::from_raw(original).invoke(args) });
        };

        match entry.interceptor() {
            Interceptor::Raw(raw) => Ok(unsafe { F::from_raw(*raw).invoke(args) }),
            Interceptor::Typed(handler) => {
                let handler = handler
                    .downcast_ref::<Handler<F>>()
                    .ok_or_else(|| DispatchError::SignatureMismatch { export: slot.key() })?;
                Ok(handler(&Forward::new(unsafe { F::from_raw(original) }), args))
            },
        }
    }
}
