//! Interactive text sessions.
//!
//! Consoles are driven expect-style: send a line, then wait until the output
//! matches one of several patterns or a deadline passes. The lifecycle code
//! only sees the [`InteractiveSession`] and [`SessionFactory`] traits, so a
//! real SSH transport ([`process`]) and canned transcripts ([`scripted`]) are
//! interchangeable.

pub mod expect;
pub mod process;
pub mod scripted;

use regex::Regex;
use std::time::Duration;

pub use expect::{describe, ExpectBuffer};
pub use process::SshSessions;
pub use scripted::ScriptedSessions;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("timeout after {timeout:?} waiting for {patterns}")]
    Timeout {
        timeout: Duration,
        patterns: String,
        /// Output received while waiting
        before: String,
    },

    #[error("session closed while waiting for {patterns}")]
    Eof { patterns: String, before: String },

    #[error("couldn't connect to the host {host} via ssh: {reason}")]
    Connect { host: String, reason: String },

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful [`InteractiveSession::expect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Position of the matching pattern in the list passed to `expect`
    pub index: usize,
    /// Output preceding the match
    pub before: String,
    /// The matched text
    pub after: String,
}

pub trait InteractiveSession: Send {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError>;

    /// Wait until the unread output matches one of `patterns`.
    ///
    /// The earliest match in the output wins; on equal positions the pattern
    /// listed first wins. Output up to the end of the match is consumed.
    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<Match, SessionError>;

    fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens logged-in shell sessions on remote hosts
pub trait SessionFactory: Send + Sync {
    fn open(
        &self,
        host: &str,
        user: &str,
        password: &str,
        login_timeout: Duration,
    ) -> Result<Box<dyn InteractiveSession>, SessionError>;
}
