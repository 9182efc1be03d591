//! Cooperative cancellation of transfers through the abort channel.
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    Session,
    error::{Error, Result},
    transfer::Transfer,
    transport::Transport,
};

/// The application a session runs in.
///
/// Abortable transfers poll [`Host::interrupt_requested`] between chunks. Every session
/// operation asserts [`Host::measurement_active`]: using a session while the host is only
/// being configured is a programming error.
pub trait Host {
    /// Whether the user asked to interrupt the current operation.
    fn interrupt_requested(&self) -> bool;

    fn measurement_active(&self) -> bool {
        true
    }
}

/// A host that never interrupts, for scripts and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unattended;

impl Host for Unattended {
    fn interrupt_requested(&self) -> bool {
        false
    }
}

/// A flag set from elsewhere, typically a signal handler.
impl Host for AtomicBool {
    fn interrupt_requested(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

impl<H: Host + ?Sized> Host for &H {
    fn interrupt_requested(&self) -> bool {
        (**self).interrupt_requested()
    }

    fn measurement_active(&self) -> bool {
        (**self).measurement_active()
    }
}

impl<H: Host + ?Sized> Host for Arc<H> {
    fn interrupt_requested(&self) -> bool {
        (**self).interrupt_requested()
    }

    fn measurement_active(&self) -> bool {
        (**self).measurement_active()
    }
}

impl<T: Transport, H: Host> Session<T, H> {
    /// Whether a transfer should stop before its next chunk.
    ///
    /// Without an async link an interruption could not be acted upon, so the host is not asked
    /// and the transfer runs to completion.
    pub(crate) fn interrupt_pending(&self, abortable: bool) -> bool {
        abortable && self.async_link.is_some() && self.host.interrupt_requested()
    }

    /// Aborts the transfer in progress after `transferred` bytes.
    ///
    /// The transfer has stopped whether or not the device acknowledges the abort, so a failing
    /// `device_abort` is logged and the outcome is still [`Transfer::Cancelled`].
    pub(crate) fn abort(&mut self, transferred: usize) -> Transfer {
        if let Err(err) = self.device_abort(transferred) {
            log::warn!("Aborting transfer on {} failed: {}", self.device_name(), err);
        }
        Transfer::Cancelled(transferred)
    }

    /// Issues `device_abort` on the async link.
    fn device_abort(&mut self, transferred: usize) -> Result<()> {
        let Some(link) = &self.async_link else {
            return Ok(());
        };
        log::info!(
            "Aborting transfer on link {} of {} after {} bytes",
            link.id,
            self.device_name(),
            transferred
        );
        let resp = self
            .transport
            .device_abort(link.id)
            .map_err(Error::rpc("device_abort", transferred))?;
        if !resp.error.is_ok() {
            return Err(Error::Device {
                operation: "device_abort",
                code: resp.error,
                transferred,
            });
        }
        Ok(())
    }
}
