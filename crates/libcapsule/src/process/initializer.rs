//! The child side of the bootstrap. After the re-exec the binary lands
//! here, finishes the container environment, and replaces itself with the
//! user program.
use std::ffi::CString;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use caps::{CapSet, Capability, CapsHashSet};
use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{self, Gid};

use super::args::{InitConfig, InitializerType, EXEC_FIFO};
use super::channel::{ChannelError, ReadySender, GO_SIGNAL};
use crate::config::{CapabilitySets, NamespaceType, Rlimit};
use crate::container::NOT_EXEC_FLAG;
use crate::rootfs::{self, RootfsError};

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("invalid environment pair {0:?}")]
    InvalidEnv(String),
    #[error("no arguments to exec")]
    EmptyArgs,
    #[error("exec initializer requires the target init pid")]
    MissingInitPid,
    #[error("argument contains a nul byte")]
    BadArg(#[from] std::ffi::NulError),
    #[error(transparent)]
    Rootfs(#[from] RootfsError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("failed to apply capabilities")]
    Capabilities(#[from] caps::errors::CapsError),
    #[error("failed to set no_new_privileges (errno {0})")]
    NoNewPrivileges(i32),
    #[error("failed to enter namespace {0:?}")]
    EnterNamespace(NamespaceType, #[source] nix::Error),
    #[error("unix error: {0}")]
    Unix(#[from] nix::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to exec {argv0:?}")]
    Exec { argv0: String, source: nix::Error },
}

type Result<T> = std::result::Result<T, InitError>;

/// Loads the `KEY=VAL` pairs into the process environment. Pairs without a
/// `=` are rejected rather than silently dropped.
pub fn populate_process_env(env: &[String]) -> Result<()> {
    for pair in env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| InitError::InvalidEnv(pair.clone()))?;
        if key.is_empty() {
            return Err(InitError::InvalidEnv(pair.clone()));
        }
        std::env::set_var(key, value);
    }
    Ok(())
}

/// Builds the initializer variant selected by the parent.
pub fn new_initializer(
    kind: InitializerType,
    config: InitConfig,
    ready_sender: Option<ReadySender>,
) -> Box<dyn Initializer> {
    match kind {
        InitializerType::Standard => Box::new(StandardInitializer {
            config,
            ready_sender,
        }),
        InitializerType::Exec => Box::new(ExecInitializer { config }),
    }
}

pub trait Initializer {
    /// Completes the environment and execs the user program. Returns only
    /// on failure.
    fn init(self: Box<Self>) -> Result<()>;
}

/// Full setup for the first process of a container. Runs inside the fresh
/// namespaces the clone created.
pub struct StandardInitializer {
    config: InitConfig,
    ready_sender: Option<ReadySender>,
}

impl Initializer for StandardInitializer {
    fn init(self: Box<Self>) -> Result<()> {
        let container_config = &self.config.container_config;
        let process = &self.config.process;

        // keep a handle on the host-side container dir before the pivot
        // makes its path unreachable; the sentinel file and the exec fifo
        // live there
        let dir_fd: OwnedFd = nix::fcntl::open(
            self.config.container_root.as_path(),
            OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })?;

        rootfs::prepare_rootfs(container_config)?;

        if container_config.namespaces.contains(NamespaceType::Uts) {
            if let Some(hostname) = &container_config.hostname {
                tracing::debug!(?hostname, "setting hostname");
                unistd::sethostname(hostname)?;
            }
        }

        for rlimit in &container_config.rlimits {
            apply_rlimit(rlimit)?;
        }

        if !process.additional_gids.is_empty() {
            let gids: Vec<Gid> = process
                .additional_gids
                .iter()
                .map(|gid| Gid::from_raw(*gid))
                .collect();
            unistd::setgroups(&gids)?;
        }

        apply_capabilities(&container_config.capabilities)?;

        if process.no_new_privileges {
            prctl::set_no_new_privileges(true).map_err(InitError::NoNewPrivileges)?;
        }

        unistd::chdir(&process.cwd)?;

        if process.init {
            // the sentinel marks Created; it exists exactly while we sit in
            // the gate below
            let flag_fd = openat(
                Some(dir_fd.as_raw_fd()),
                NOT_EXEC_FLAG,
                OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                Mode::from_bits_truncate(0o644),
            )?;
            unistd::close(flag_fd)?;

            if let Some(ready_sender) = self.ready_sender {
                ready_sender.notify_ready()?;
            }

            wait_for_start_signal(&dir_fd)?;

            unistd::unlinkat(
                Some(dir_fd.as_raw_fd()),
                NOT_EXEC_FLAG,
                unistd::UnlinkatFlags::NoRemoveDir,
            )?;
        }
        drop(dir_fd);

        do_exec(&process.args)
    }
}

// Blocks until a start invocation opens the fifo for reading, then sends
// the go byte through. The open is the gate: a fifo writer cannot proceed
// without a reader.
fn wait_for_start_signal(dir_fd: &OwnedFd) -> Result<()> {
    let fifo_fd = openat(
        Some(dir_fd.as_raw_fd()),
        EXEC_FIFO,
        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )?;
    let written = unistd::write(unsafe { BorrowedFd::borrow_raw(fifo_fd) }, &[GO_SIGNAL])?;
    unistd::close(fifo_fd)?;
    if written != 1 {
        return Err(InitError::Channel(ChannelError::BrokenChannel));
    }
    Ok(())
}

/// Joins the namespaces of a running init process and execs one more
/// program in them. No rootfs or hostname work: the target namespaces
/// already carry all of that.
pub struct ExecInitializer {
    config: InitConfig,
}

impl Initializer for ExecInitializer {
    fn init(self: Box<Self>) -> Result<()> {
        let container_config = &self.config.container_config;
        let process = &self.config.process;
        let init_pid = self.config.init_pid.ok_or(InitError::MissingInitPid)?;

        for namespace in container_config.namespaces.iter() {
            enter_namespace(init_pid, *namespace)?;
        }

        unistd::chdir(&process.cwd)?;

        if process.no_new_privileges {
            prctl::set_no_new_privileges(true).map_err(InitError::NoNewPrivileges)?;
        }

        do_exec(&process.args)
    }
}

fn enter_namespace(init_pid: i32, namespace: NamespaceType) -> Result<()> {
    let path = format!("/proc/{}/ns/{}", init_pid, namespace.proc_ns_name());
    let fd = nix::fcntl::open(path.as_str(), OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())
        .map_err(|err| InitError::EnterNamespace(namespace, err))?;
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    nix::sched::setns(&owned, namespace.clone_flag())
        .map_err(|err| InitError::EnterNamespace(namespace, err))?;
    Ok(())
}

fn apply_rlimit(rlimit: &Rlimit) -> Result<()> {
    nix::sys::resource::setrlimit(rlimit.typ.resource(), rlimit.soft, rlimit.hard)?;
    Ok(())
}

// Bounding goes first because dropping it afterwards would be blocked by
// the reduced effective set; ambient goes last because it must stay within
// permitted and inheritable.
fn apply_capabilities(sets: &CapabilitySets) -> Result<()> {
    let bounding: CapsHashSet = sets.bounding.iter().copied().collect();
    for cap in caps::all() {
        if !bounding.contains(&cap) {
            caps::drop(None, CapSet::Bounding, cap)?;
        }
    }

    let to_set = |caps_list: &[Capability]| caps_list.iter().copied().collect::<CapsHashSet>();
    caps::set(None, CapSet::Inheritable, &to_set(&sets.inheritable))?;
    caps::set(None, CapSet::Permitted, &to_set(&sets.permitted))?;
    caps::set(None, CapSet::Effective, &to_set(&sets.effective))?;
    caps::set(None, CapSet::Ambient, &to_set(&sets.ambient))?;
    Ok(())
}

// Replaces the process image. The environment was populated from the
// process spec before the initializer ran, so execv carries it over.
fn do_exec(args: &[String]) -> Result<()> {
    let argv0 = args.first().ok_or(InitError::EmptyArgs)?;
    let exe = CString::new(argv0.as_str())?;
    let argv: Vec<CString> = args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<std::result::Result<_, _>>()?;

    tracing::debug!(?args, "executing user program");
    let err = match unistd::execv(&exe, &argv) {
        Ok(infallible) => match infallible {},
        Err(err) => err,
    };
    Err(InitError::Exec {
        argv0: argv0.clone(),
        source: err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_populate_process_env() {
        populate_process_env(&["CAPSULE_TEST_ENV_A=1".to_owned()]).unwrap();
        assert_eq!(std::env::var("CAPSULE_TEST_ENV_A").unwrap(), "1");
        std::env::remove_var("CAPSULE_TEST_ENV_A");
    }

    #[test]
    fn test_populate_process_env_rejects_missing_separator() {
        assert!(matches!(
            populate_process_env(&["NOVALUE".to_owned()]),
            Err(InitError::InvalidEnv(_))
        ));
    }

    #[test]
    fn test_populate_process_env_rejects_empty_key() {
        assert!(matches!(
            populate_process_env(&["=value".to_owned()]),
            Err(InitError::InvalidEnv(_))
        ));
    }

    #[test]
    fn test_exec_with_no_args_fails() {
        assert!(matches!(do_exec(&[]), Err(InitError::EmptyArgs)));
    }
}
