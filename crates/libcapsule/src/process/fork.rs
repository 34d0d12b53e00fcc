//! Spawning the container init process: a clone with the configured
//! namespace flags whose child immediately re-execs the runtime binary in
//! init mode.
use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::sched::{self, CloneFlags};
use nix::sys::signal::Signal;
use nix::unistd::{self, Pid};

use super::args::DEFAULT_STD_FD_COUNT;

/// The child always re-executes the running binary; argv[1] selects init
/// mode before the CLI parser ever runs.
pub const INIT_EXE: &str = "/proc/self/exe";
pub const INIT_ARG: &str = "init";

// clone requires the caller to allocate the child stack; 1 MiB matches what
// the kernel hands a fresh thread by default.
const STACK_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ForkError {
    #[error("failed to clone init process")]
    Clone(#[source] nix::Error),
    #[error("invalid argument for exec: {0}")]
    BadArg(#[from] std::ffi::NulError),
}

/// Everything the clone callback needs. The extra files are dup'd to fd
/// `3 + index`, which both clears close-on-exec and pins the fd numbers the
/// environment variables promise.
pub struct SpawnCommand {
    pub clone_flags: CloneFlags,
    pub extra_files: Vec<OwnedFd>,
    pub envs: Vec<(String, String)>,
    pub cwd: PathBuf,
}

impl SpawnCommand {
    /// Environment value for the extra file at `index`.
    pub fn fd_env_value(index: usize) -> String {
        (DEFAULT_STD_FD_COUNT + index as i32).to_string()
    }
}

/// Clones the init process. The child never returns: it either execs the
/// runtime binary or exits with a non-zero status.
pub fn spawn_init(cmd: SpawnCommand) -> Result<Pid, ForkError> {
    let exe = CString::new(INIT_EXE)?;
    let argv = [CString::new("capsule")?, CString::new(INIT_ARG)?];

    let mut stack = vec![0u8; STACK_SIZE];
    let cb = Box::new(|| {
        let err = in_child(&cmd, &exe, &argv);
        // stderr is still the caller's stderr here; the message must not
        // vanish with the child
        eprintln!("capsule: failed to exec init process: {err}");
        -1
    });

    // pass SIGCHLD so the kernel treats the clone like a forked child for
    // wait purposes
    let pid = unsafe {
        sched::clone(
            cb,
            &mut stack,
            cmd.clone_flags,
            Some(Signal::SIGCHLD as libc::c_int),
        )
    }
    .map_err(ForkError::Clone)?;

    Ok(pid)
}

// Runs on the child side of the clone. Only ever returns an error: on
// success execv replaces the process image.
fn in_child(cmd: &SpawnCommand, exe: &CString, argv: &[CString; 2]) -> nix::Error {
    match place_extra_files(cmd) {
        Ok(()) => {}
        Err(err) => return err,
    }
    for (key, value) in &cmd.envs {
        std::env::set_var(key, value);
    }
    if let Err(err) = unistd::chdir(&cmd.cwd) {
        return err;
    }
    match unistd::execv(exe, argv) {
        Ok(infallible) => match infallible {},
        Err(err) => err,
    }
}

// Installs the inherited fds at 3, 4, ... First stage everything above the
// target window so a source fd is never clobbered before it is copied, then
// dup2 into place, which also clears close-on-exec.
fn place_extra_files(cmd: &SpawnCommand) -> Result<(), nix::Error> {
    use nix::fcntl::{fcntl, FcntlArg};

    let base = DEFAULT_STD_FD_COUNT + cmd.extra_files.len() as i32;
    let mut staged = Vec::with_capacity(cmd.extra_files.len());
    for file in &cmd.extra_files {
        staged.push(fcntl(file.as_raw_fd(), FcntlArg::F_DUPFD(base))?);
    }
    for (index, fd) in staged.into_iter().enumerate() {
        unistd::dup2(fd, DEFAULT_STD_FD_COUNT + index as i32)?;
        unistd::close(fd)?;
    }
    Ok(())
}
