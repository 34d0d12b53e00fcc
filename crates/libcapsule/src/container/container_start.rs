//! Start: releases a Created container's init process into the user
//! program.
use std::fs::File;
use std::io::Read;

use super::{Container, ContainerStatus};
use crate::error::CapsuleError;
use crate::process::args::EXEC_FIFO;
use crate::Result;

impl Container {
    /// Signals the exec gate of a previously created container. Works from
    /// any runtime invocation: the gate is a fifo in the container
    /// directory, not a pipe tied to the creating process.
    pub fn start(&mut self) -> Result<()> {
        self.refresh_status()?;
        if !self.status().can_start() {
            return Err(CapsuleError::InvalidStateTransition {
                from: self.status(),
                to: ContainerStatus::Running,
            });
        }

        self.send_start_signal()?;
        self.set_status(ContainerStatus::Running);
        self.save()?;
        Ok(())
    }

    // Opening the fifo for reading unblocks the init process, which has
    // been sitting in its open-for-write since setup finished; the byte it
    // then sends confirms the handoff.
    pub(super) fn send_start_signal(&self) -> Result<()> {
        let fifo_path = self.root.join(EXEC_FIFO);
        let mut fifo = File::open(&fifo_path)?;
        let mut byte = [0u8; 1];
        let n = fifo.read(&mut byte)?;
        if n == 0 {
            return Err(CapsuleError::Other(
                "init process closed the exec gate without the go byte".into(),
            ));
        }
        tracing::debug!(id = self.id(), "start signal exchanged");
        Ok(())
    }
}
