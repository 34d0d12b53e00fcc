//! Parent side drivers for the container init process. Two variants exist:
//! [`InitParentProcess`] owns a child it cloned itself, while
//! [`super::nochild::NoChildParentProcess`] stands in for an init process
//! inherited from an earlier runtime invocation.
use std::os::fd::OwnedFd;
use std::path::PathBuf;

use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{mkfifo, Pid};

use super::args::{
    InitConfig, InitializerType, ENV_CONFIG_PIPE, ENV_EXEC_PIPE, ENV_INITIALIZER_TYPE, EXEC_FIFO,
};
use super::channel::{self, ChannelError, ReadyReceiver, Sender};
use super::fork::{self, ForkError, SpawnCommand};

#[derive(Debug, thiserror::Error)]
pub enum ParentProcessError {
    #[error("operation is not valid for this parent process variant")]
    InvalidOperation,
    #[error("init process has not been started yet")]
    NotStarted,
    #[error("unix error: {0}")]
    Unix(#[from] nix::Error),
    #[error("failed to read /proc for init process")]
    Procfs(#[from] procfs::ProcError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Fork(#[from] ForkError),
}

type Result<T> = std::result::Result<T, ParentProcessError>;

/// Common capability set of both driver variants.
pub trait ParentProcess {
    /// Pid of the init process; only meaningful once started.
    fn pid(&self) -> Option<Pid>;

    /// Spawns the child and carries the bootstrap through to the readiness
    /// report.
    fn start(&mut self) -> Result<()>;

    /// SIGKILL and reap.
    fn terminate(&mut self) -> Result<()>;

    /// Blocks until the init process exits; returns the exit code where it
    /// is observable.
    fn wait(&mut self) -> Result<i32>;

    /// Kernel start time of the init process in clock ticks.
    fn start_time(&self) -> Result<u64>;

    /// Forwards a signal to the init process.
    fn signal(&self, signal: Signal) -> Result<()>;

    /// Whether the caller intends to leave the process behind.
    fn detach(&self) -> bool;
}

/// Reads the start time of `pid` from `/proc/{pid}/stat`.
pub fn process_start_time(pid: i32) -> std::result::Result<u64, procfs::ProcError> {
    let process = procfs::process::Process::new(pid)?;
    Ok(process.stat()?.starttime)
}

/// Checks that `(pid, start_time)` still names a live, non-zombie process.
/// A matching pid with a different start time is a recycled pid.
pub fn process_alive(pid: i32, start_time: u64) -> std::result::Result<bool, procfs::ProcError> {
    use procfs::process::ProcState;

    let process = match procfs::process::Process::new(pid) {
        Ok(process) => process,
        Err(procfs::ProcError::NotFound(_)) => return Ok(false),
        Err(err) => return Err(err),
    };
    let stat = match process.stat() {
        Ok(stat) => stat,
        Err(procfs::ProcError::NotFound(_)) => return Ok(false),
        Err(err) => return Err(err),
    };
    if stat.starttime != start_time {
        return Ok(false);
    }
    match stat.state()? {
        ProcState::Zombie | ProcState::Dead => Ok(false),
        _ => Ok(true),
    }
}

/// Owning-child variant: this runtime invocation cloned the init process
/// itself, so the kernel wait facility applies.
pub struct InitParentProcess {
    init_config: InitConfig,
    container_root: PathBuf,
    pid: Option<Pid>,
    start_time: Option<u64>,
    detach: bool,
}

impl InitParentProcess {
    pub fn new(container_root: PathBuf, init_config: InitConfig) -> Self {
        let detach = init_config.process.detach;
        Self {
            init_config,
            container_root,
            pid: None,
            start_time: None,
            detach,
        }
    }

    fn spawn(&mut self) -> Result<ReadyWait> {
        let is_init = self.init_config.process.init;

        let (config_sender, config_child_fd): (Sender<InitConfig>, OwnedFd) =
            channel::config_channel()?;
        let mut extra_files = vec![config_child_fd];
        let mut envs = vec![
            (
                ENV_CONFIG_PIPE.to_owned(),
                SpawnCommand::fd_env_value(0),
            ),
            (
                ENV_INITIALIZER_TYPE.to_owned(),
                self.init_config.initializer.as_str().to_owned(),
            ),
        ];

        let ready_receiver = if is_init {
            let (ready_receiver, ready_child_fd) = channel::ready_channel()?;
            envs.push((
                ENV_EXEC_PIPE.to_owned(),
                SpawnCommand::fd_env_value(extra_files.len()),
            ));
            extra_files.push(ready_child_fd);

            // the start gate outlives this invocation, so it is a fifo in
            // the container directory rather than an inherited pipe
            let fifo_path = self.container_root.join(EXEC_FIFO);
            if !fifo_path.exists() {
                mkfifo(&fifo_path, Mode::from_bits_truncate(0o622))?;
            }
            Some(ready_receiver)
        } else {
            None
        };

        let clone_flags = match self.init_config.initializer {
            // a standard init is born into its new namespaces
            InitializerType::Standard => self.init_config.container_config.namespaces.clone_flags(),
            // an exec process joins existing namespaces from inside the child
            InitializerType::Exec => nix::sched::CloneFlags::empty(),
        };

        let pid = fork::spawn_init(SpawnCommand {
            clone_flags,
            extra_files,
            envs,
            cwd: self.init_config.container_config.rootfs.clone(),
        })?;
        self.pid = Some(pid);
        self.start_time = Some(process_start_time(pid.as_raw())?);

        config_sender.send(&self.init_config)?;

        Ok(ReadyWait { ready_receiver })
    }
}

struct ReadyWait {
    ready_receiver: Option<ReadyReceiver>,
}

impl ParentProcess for InitParentProcess {
    fn pid(&self) -> Option<Pid> {
        self.pid
    }

    fn start(&mut self) -> Result<()> {
        let ready = match self.spawn() {
            Ok(ready) => ready,
            Err(err) => {
                // a child may already exist; do not leave it behind
                if self.pid.is_some() {
                    let _ = self.terminate();
                }
                return Err(err);
            }
        };
        if let Some(receiver) = ready.ready_receiver {
            if let Err(err) = receiver.wait_for_ready() {
                tracing::error!(%err, "init process died before reporting ready");
                let _ = self.terminate();
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn terminate(&mut self) -> Result<()> {
        let pid = self.pid.ok_or(ParentProcessError::NotStarted)?;
        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(err) => return Err(err.into()),
        }
        // SIGKILL cannot be ignored, so the wait terminates
        self.wait()?;
        Ok(())
    }

    fn wait(&mut self) -> Result<i32> {
        let pid = self.pid.ok_or(ParentProcessError::NotStarted)?;
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECHILD) => return Ok(0),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn start_time(&self) -> Result<u64> {
        self.start_time.ok_or(ParentProcessError::NotStarted)
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self.pid.ok_or(ParentProcessError::NotStarted)?;
        signal::kill(pid, signal)?;
        Ok(())
    }

    fn detach(&self) -> bool {
        self.detach
    }
}
