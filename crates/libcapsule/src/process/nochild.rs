//! Driver for an init process created by a previous runtime invocation.
//! The process is not our child, so the kernel wait facility does not
//! apply; liveness is observed through /proc instead.
use std::thread;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::parent::{process_alive, ParentProcess, ParentProcessError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stand-in parent for a reacquired init process. Only `wait`, `signal` and
/// `start_time` are meaningful; the persisted start time guards every probe
/// against pid reuse.
pub struct NoChildParentProcess {
    init_pid: i32,
    init_start_time: u64,
}

impl NoChildParentProcess {
    pub fn new(init_pid: i32, init_start_time: u64) -> Self {
        Self {
            init_pid,
            init_start_time,
        }
    }
}

impl ParentProcess for NoChildParentProcess {
    fn pid(&self) -> Option<Pid> {
        Some(Pid::from_raw(self.init_pid))
    }

    fn start(&mut self) -> Result<(), ParentProcessError> {
        Err(ParentProcessError::InvalidOperation)
    }

    fn terminate(&mut self) -> Result<(), ParentProcessError> {
        Err(ParentProcessError::InvalidOperation)
    }

    /// Polls /proc/{pid}/stat every 100 ms until the file vanishes, the
    /// process turns zombie, or the pid is recycled. The exit status of a
    /// non-child is not observable; callers get 0.
    fn wait(&mut self) -> Result<i32, ParentProcessError> {
        loop {
            thread::sleep(POLL_INTERVAL);
            if !process_alive(self.init_pid, self.init_start_time)? {
                tracing::debug!(pid = self.init_pid, "reacquired init process exited");
                return Ok(0);
            }
        }
    }

    fn start_time(&self) -> Result<u64, ParentProcessError> {
        Ok(self.init_start_time)
    }

    fn signal(&self, signal: Signal) -> Result<(), ParentProcessError> {
        tracing::debug!(pid = self.init_pid, ?signal, "sending signal");
        signal::kill(Pid::from_raw(self.init_pid), signal)?;
        Ok(())
    }

    fn detach(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_terminate_are_invalid() {
        let mut parent = NoChildParentProcess::new(1, 0);
        assert!(matches!(
            parent.start(),
            Err(ParentProcessError::InvalidOperation)
        ));
        assert!(matches!(
            parent.terminate(),
            Err(ParentProcessError::InvalidOperation)
        ));
        assert!(!parent.detach());
    }

    #[test]
    fn test_start_time_is_the_persisted_one() {
        let parent = NoChildParentProcess::new(1, 777);
        assert_eq!(parent.start_time().unwrap(), 777);
    }

    #[test]
    fn test_wait_returns_for_recycled_pid() {
        // pid 1 is always alive, but never with a start time of u64::MAX,
        // so the liveness probe reports it gone immediately.
        let mut parent = NoChildParentProcess::new(1, u64::MAX);
        assert_eq!(parent.wait().unwrap(), 0);
    }
}
