//! Conversion of user supplied signal names and numbers into nix signals.
use std::convert::TryFrom;

use nix::sys::signal::Signal as NixSignal;

/// POSIX signal as given on the command line.
#[derive(Debug)]
pub struct Signal(NixSignal);

#[derive(Debug, thiserror::Error)]
pub enum SignalError<T> {
    #[error("invalid signal: {0}")]
    InvalidSignal(T),
}

impl TryFrom<&str> for Signal {
    type Error = SignalError<String>;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        use NixSignal::*;

        Ok(Signal(match s.to_ascii_uppercase().as_str() {
            "1" | "HUP" | "SIGHUP" => SIGHUP,
            "2" | "INT" | "SIGINT" => SIGINT,
            "3" | "QUIT" | "SIGQUIT" => SIGQUIT,
            "4" | "ILL" | "SIGILL" => SIGILL,
            "6" | "ABRT" | "SIGABRT" => SIGABRT,
            "8" | "FPE" | "SIGFPE" => SIGFPE,
            "9" | "KILL" | "SIGKILL" => SIGKILL,
            "10" | "USR1" | "SIGUSR1" => SIGUSR1,
            "11" | "SEGV" | "SIGSEGV" => SIGSEGV,
            "12" | "USR2" | "SIGUSR2" => SIGUSR2,
            "13" | "PIPE" | "SIGPIPE" => SIGPIPE,
            "14" | "ALRM" | "SIGALRM" => SIGALRM,
            "15" | "TERM" | "SIGTERM" => SIGTERM,
            "17" | "CHLD" | "SIGCHLD" => SIGCHLD,
            "18" | "CONT" | "SIGCONT" => SIGCONT,
            "19" | "STOP" | "SIGSTOP" => SIGSTOP,
            "20" | "TSTP" | "SIGTSTP" => SIGTSTP,
            "23" | "URG" | "SIGURG" => SIGURG,
            "28" | "WINCH" | "SIGWINCH" => SIGWINCH,
            _ => return Err(SignalError::InvalidSignal(s.to_string())),
        }))
    }
}

impl TryFrom<i32> for Signal {
    type Error = SignalError<i32>;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        NixSignal::try_from(value)
            .map_err(|_| SignalError::InvalidSignal(value))
            .map(Signal)
    }
}

impl From<NixSignal> for Signal {
    fn from(s: NixSignal) -> Self {
        Signal(s)
    }
}

impl Signal {
    pub fn into_raw(self) -> NixSignal {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_from_name_and_number() {
        for s in ["9", "KILL", "SIGKILL"] {
            assert_eq!(
                NixSignal::SIGKILL,
                Signal::try_from(s).unwrap().into_raw()
            );
        }
        for s in ["15", "TERM", "SIGTERM"] {
            assert_eq!(
                NixSignal::SIGTERM,
                Signal::try_from(s).unwrap().into_raw()
            );
        }
        assert_eq!(NixSignal::SIGHUP, Signal::try_from(1).unwrap().into_raw());
    }

    #[test]
    fn test_conversion_failure() {
        assert!(Signal::try_from("invalid").is_err());
        assert!(Signal::try_from(-3).is_err());
    }
}
