//! The init pipe protocol. Two unidirectional pipes are opened before the
//! init process is cloned: the config pipe carries one InitConfig document
//! parent to child, the exec pipe carries one readiness byte child to
//! parent. Both child ends are inherited across the re-exec and recovered
//! from environment variables.
use std::fs::File;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to create pipe")]
    Create(#[source] nix::Error),
    #[error("failed to write to pipe")]
    Write(#[source] std::io::Error),
    #[error("failed to read from pipe")]
    Read(#[source] std::io::Error),
    #[error("failed serde serialization")]
    Serde(#[from] serde_json::Error),
    #[error("missing environment variable {0}")]
    MissingEnv(String),
    #[error("malformed fd in environment variable {0}")]
    MalformedFd(String),
    #[error("channel connection broken")]
    BrokenChannel,
}

/// The byte sent over the exec pipe and the exec fifo.
pub const GO_SIGNAL: u8 = 0x00;

/// Writing half of a one-shot typed pipe. Sending consumes the half so the
/// read side observes EOF as soon as the single payload is through.
pub struct Sender<T> {
    writer: File,
    phantom: PhantomData<T>,
}

impl<T> Sender<T>
where
    T: Serialize,
{
    pub fn send(mut self, object: &T) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(object)?;
        self.writer.write_all(&payload).map_err(ChannelError::Write)?;
        self.writer.flush().map_err(ChannelError::Write)?;
        // dropping the writer closes the write end, delivering EOF
        Ok(())
    }
}

/// Reading half of a one-shot typed pipe.
pub struct Receiver<T> {
    reader: File,
    phantom: PhantomData<T>,
}

impl<T> Receiver<T>
where
    T: DeserializeOwned,
{
    /// Recovers the read end from an inherited file descriptor.
    ///
    /// # Safety contract
    /// The fd must be the pipe end set up by the parent; it is consumed.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self {
            reader: unsafe { File::from_raw_fd(fd) },
            phantom: PhantomData,
        }
    }

    pub fn from_env(var: &str) -> Result<Self, ChannelError> {
        let value =
            std::env::var(var).map_err(|_| ChannelError::MissingEnv(var.to_owned()))?;
        let fd: RawFd = value
            .parse()
            .map_err(|_| ChannelError::MalformedFd(var.to_owned()))?;
        Ok(Self::from_raw_fd(fd))
    }

    /// Reads the whole payload to EOF and decodes it. An empty read means
    /// the parent died before sending the config.
    pub fn recv(mut self) -> Result<T, ChannelError> {
        let mut buf = Vec::new();
        self.reader
            .read_to_end(&mut buf)
            .map_err(ChannelError::Read)?;
        if buf.is_empty() {
            return Err(ChannelError::BrokenChannel);
        }
        Ok(serde_json::from_slice(&buf)?)
    }
}

/// Creates the config pipe. Returns the typed parent sender and the raw
/// child end, which the clone callback dups below the cloexec threshold.
pub fn config_channel<T: Serialize>() -> Result<(Sender<T>, OwnedFd), ChannelError> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(ChannelError::Create)?;
    let sender = Sender {
        writer: File::from(write_end),
        phantom: PhantomData,
    };
    Ok((sender, read_end))
}

/// Parent half of the exec readiness pipe.
pub struct ReadyReceiver {
    reader: File,
}

impl ReadyReceiver {
    /// Blocks until the child reports that environment setup is complete.
    /// EOF without a byte means the child exited before getting there.
    pub fn wait_for_ready(mut self) -> Result<(), ChannelError> {
        let mut byte = [0u8; 1];
        let n = self.reader.read(&mut byte).map_err(ChannelError::Read)?;
        if n == 0 {
            return Err(ChannelError::BrokenChannel);
        }
        tracing::debug!("init process reported ready");
        Ok(())
    }
}

/// Child half of the exec readiness pipe.
pub struct ReadySender {
    writer: File,
}

impl ReadySender {
    pub fn from_env(var: &str) -> Result<Self, ChannelError> {
        let value =
            std::env::var(var).map_err(|_| ChannelError::MissingEnv(var.to_owned()))?;
        let fd: RawFd = value
            .parse()
            .map_err(|_| ChannelError::MalformedFd(var.to_owned()))?;
        Ok(Self {
            writer: unsafe { File::from_raw_fd(fd) },
        })
    }

    /// Sends the readiness byte and closes the write end.
    pub fn notify_ready(mut self) -> Result<(), ChannelError> {
        self.writer
            .write_all(&[GO_SIGNAL])
            .map_err(ChannelError::Write)?;
        Ok(())
    }
}

/// Creates the exec readiness pipe: child writes, parent reads.
pub fn ready_channel() -> Result<(ReadyReceiver, OwnedFd), ChannelError> {
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(ChannelError::Create)?;
    let receiver = ReadyReceiver {
        reader: File::from(read_end),
    };
    Ok((receiver, write_end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsRawFd, IntoRawFd};

    #[test]
    fn test_config_channel_round_trip() {
        let (sender, child_fd) = config_channel::<Vec<String>>().unwrap();
        let payload = vec!["a".to_owned(), "b".to_owned()];
        let writer = std::thread::spawn(move || sender.send(&payload));
        let receiver = Receiver::<Vec<String>>::from_raw_fd(child_fd.into_raw_fd());
        let got = receiver.recv().unwrap();
        writer.join().unwrap().unwrap();
        assert_eq!(got, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn test_config_channel_broken_on_empty() {
        let (sender, child_fd) = config_channel::<Vec<String>>().unwrap();
        drop(sender.writer);
        let receiver = Receiver::<Vec<String>>::from_raw_fd(child_fd.into_raw_fd());
        assert!(matches!(
            receiver.recv(),
            Err(ChannelError::BrokenChannel)
        ));
    }

    #[test]
    fn test_ready_channel_delivers_byte() {
        let (receiver, child_fd) = ready_channel().unwrap();
        assert!(child_fd.as_raw_fd() >= 0);
        let sender = ReadySender {
            writer: File::from(child_fd),
        };
        let writer = std::thread::spawn(move || sender.notify_ready());
        receiver.wait_for_ready().unwrap();
        writer.join().unwrap().unwrap();
    }

    #[test]
    fn test_ready_channel_broken_when_child_dies() {
        let (receiver, child_fd) = ready_channel().unwrap();
        drop(child_fd);
        assert!(matches!(
            receiver.wait_for_ready(),
            Err(ChannelError::BrokenChannel)
        ));
    }
}
