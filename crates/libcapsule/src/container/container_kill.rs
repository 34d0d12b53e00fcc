//! Signal forwarding to the init process.
use nix::sys::signal::Signal as NixSignal;

use super::{Container, ContainerStatus};
use crate::error::CapsuleError;
use crate::signal::Signal;
use crate::Result;

impl Container {
    /// Sends a signal to the init process. Exits observed through the
    /// signal are picked up by the next status probe rather than recorded
    /// here; SIGTERM may well be ignored by the payload.
    pub fn signal<S: Into<Signal>>(&mut self, signal: S) -> Result<()> {
        self.refresh_status()?;
        if !self.status().can_kill() {
            return Err(CapsuleError::InvalidStateTransition {
                from: self.status(),
                to: ContainerStatus::Stopped,
            });
        }

        let signal: NixSignal = signal.into().into_raw();
        let parent = self
            .parent
            .as_ref()
            .ok_or_else(|| CapsuleError::Other("container has no init process".into()))?;
        tracing::debug!(id = self.id(), ?signal, "forwarding signal to init process");
        parent
            .signal(signal)
            .map_err(|err| CapsuleError::Other(err.to_string()))?;
        Ok(())
    }
}
