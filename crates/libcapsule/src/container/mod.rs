//! Container lifecycle: the handle, the status machine, and the verb
//! implementations.
#[allow(clippy::module_inception)]
mod container;
mod container_create;
mod container_delete;
mod container_exec;
mod container_kill;
mod container_pause;
mod container_resume;
mod container_start;
pub mod state;

pub use container::Container;
pub use state::{not_exec_flag_path, ContainerStatus, State, StateError, NOT_EXEC_FLAG};
