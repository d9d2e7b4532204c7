//! Sessions that answer from a script instead of a remote host.
//!
//! Every line sent is passed to a responder closure together with the
//! session's context; the returned text becomes available to `expect`. An
//! `expect` that finds nothing in the available text fails immediately with
//! a timeout, so scripts never stall a test.

use super::{describe, ExpectBuffer, InteractiveSession, Match, SessionError, SessionFactory};
use regex::Regex;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What a responder knows about the session it answers for
#[derive(Debug, Clone, Default)]
pub struct ScriptContext {
    pub host: String,
    pub user: String,
    /// Lines sent earlier in this session, oldest first
    pub history: Vec<String>,
}

impl ScriptContext {
    /// Argument of the last `nc -U '<path>'` line, i.e. the attached serial pipe
    pub fn serial_pipe(&self) -> Option<&str> {
        self.history.iter().rev().find_map(|line| {
            line.strip_prefix("nc -U ")
                .map(|path| path.trim_matches('\''))
        })
    }
}

/// A line sent through any scripted session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentLine {
    pub host: String,
    /// Serial pipe the session was attached to when the line was sent
    pub pipe: Option<String>,
    pub line: String,
}

type Responder = dyn Fn(&ScriptContext, &str) -> String + Send + Sync;

#[derive(Clone)]
pub struct ScriptedSessions {
    responder: Arc<Responder>,
    transcript: Arc<Mutex<Vec<SentLine>>>,
    refused: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSessions {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ScriptContext, &str) -> String + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            transcript: Arc::new(Mutex::new(Vec::new())),
            refused: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Make `open` fail for `host`
    pub fn refuse(&self, host: &str) {
        lock(&self.refused).push(host.to_string());
    }

    /// Every line sent so far, across all sessions
    pub fn sent(&self) -> Vec<SentLine> {
        lock(&self.transcript).clone()
    }

    /// Lines sent while attached to the serial pipe at `pipe`
    pub fn sent_to_pipe(&self, pipe: &str) -> Vec<String> {
        lock(&self.transcript)
            .iter()
            .filter(|s| s.pipe.as_deref() == Some(pipe))
            .map(|s| s.line.clone())
            .collect()
    }
}

impl std::fmt::Debug for ScriptedSessions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedSessions")
            .field("sent", &lock(&self.transcript).len())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionFactory for ScriptedSessions {
    fn open(
        &self,
        host: &str,
        user: &str,
        _password: &str,
        _login_timeout: Duration,
    ) -> Result<Box<dyn InteractiveSession>, SessionError> {
        if lock(&self.refused).iter().any(|h| h == host) {
            return Err(SessionError::Connect {
                host: host.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(ScriptedSession {
            context: ScriptContext {
                host: host.to_string(),
                user: user.to_string(),
                history: Vec::new(),
            },
            responder: Arc::clone(&self.responder),
            transcript: Arc::clone(&self.transcript),
            buffer: ExpectBuffer::new(),
            closed: false,
        }))
    }
}

struct ScriptedSession {
    context: ScriptContext,
    responder: Arc<Responder>,
    transcript: Arc<Mutex<Vec<SentLine>>>,
    buffer: ExpectBuffer,
    closed: bool,
}

impl InteractiveSession for ScriptedSession {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        let pipe = self.context.serial_pipe().map(String::from);
        lock(&self.transcript).push(SentLine {
            host: self.context.host.clone(),
            pipe,
            line: line.to_string(),
        });
        let output = (self.responder)(&self.context, line);
        self.context.history.push(line.to_string());
        self.buffer.push(&output);
        Ok(())
    }

    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<Match, SessionError> {
        if let Some(m) = self.buffer.try_match(patterns) {
            return Ok(m);
        }
        let before = self.buffer.pending().to_string();
        if self.closed {
            return Err(SessionError::Eof {
                patterns: describe(patterns),
                before,
            });
        }
        Err(SessionError::Timeout {
            timeout,
            patterns: describe(patterns),
            before,
        })
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.closed = true;
        Ok(())
    }
}
