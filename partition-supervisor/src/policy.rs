use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// How the supervisor reacts when a worker task fails.
///
/// Parsed from `restart`, `shutdown`, or either followed by `:<delay in ms>`,
/// e.g. `restart:500` or `shutdown:5000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Run the failed task again on the same stream, after the delay.
    Restart(Duration),
    /// Stop the whole consumer, after the delay.
    Shutdown(Duration),
}

/// The concrete action the supervisor takes for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    RestartNow,
    RestartAfter(Duration),
    ShutdownNow,
    ShutdownAfter(Duration),
}

impl ErrorPolicy {
    pub fn action(&self) -> PolicyAction {
        match *self {
            ErrorPolicy::Restart(delay) if delay.is_zero() => PolicyAction::RestartNow,
            ErrorPolicy::Restart(delay) => PolicyAction::RestartAfter(delay),
            ErrorPolicy::Shutdown(delay) if delay.is_zero() => PolicyAction::ShutdownNow,
            ErrorPolicy::Shutdown(delay) => PolicyAction::ShutdownAfter(delay),
        }
    }

    pub fn delay(&self) -> Duration {
        match *self {
            ErrorPolicy::Restart(delay) | ErrorPolicy::Shutdown(delay) => delay,
        }
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::Restart(Duration::ZERO)
    }
}

impl PolicyAction {
    /// Short label used for metrics and structured logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::RestartNow | PolicyAction::RestartAfter(_) => "restart",
            PolicyAction::ShutdownNow | PolicyAction::ShutdownAfter(_) => "shutdown",
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyAction::RestartNow => write!(f, "restarting task"),
            PolicyAction::RestartAfter(delay) => write!(f, "restarting task in {delay:?}"),
            PolicyAction::ShutdownNow => write!(f, "shutting down consumer"),
            PolicyAction::ShutdownAfter(delay) => {
                write!(f, "shutting down consumer in {delay:?}")
            }
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseErrorPolicyError {
    #[error("unknown error policy `{0}`, expected `restart` or `shutdown`")]
    UnknownMode(String),
    #[error("invalid error policy delay `{0}`, expected milliseconds")]
    InvalidDelay(String),
}

impl FromStr for ErrorPolicy {
    type Err = ParseErrorPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, delay) = match s.trim().split_once(':') {
            Some((mode, delay)) => (mode.trim(), Some(delay.trim())),
            None => (s.trim(), None),
        };

        let delay = match delay {
            Some(ms) => ms
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ParseErrorPolicyError::InvalidDelay(ms.to_owned()))?,
            None => Duration::ZERO,
        };

        match mode.to_ascii_lowercase().as_str() {
            "restart" => Ok(ErrorPolicy::Restart(delay)),
            "shutdown" => Ok(ErrorPolicy::Shutdown(delay)),
            _ => Err(ParseErrorPolicyError::UnknownMode(mode.to_owned())),
        }
    }
}
