//! Process management for the container bootstrap: the init pipe protocol,
//! the clone of the re-exec'd init process, the parent side drivers, and
//! the child side initializers.
pub mod args;
pub mod channel;
pub mod fork;
pub mod initializer;
pub mod nochild;
pub mod parent;
