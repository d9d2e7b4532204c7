//! SSH sessions backed by a local `ssh` child process.
//!
//! The password is handed to `sshpass` through the `SSHPASS` environment
//! variable; `-tt` forces a remote pty so prompts and echo behave as on an
//! interactive terminal.

use super::{describe, ExpectBuffer, InteractiveSession, Match, SessionError, SessionFactory};
use crate::vm::prompts::PROMPTS;
use log::{debug, trace};
use regex::Regex;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

/// Index of the password prompt in [`Prompts::ssh_login`](crate::vm::prompts::Prompts)
const SSH_PASSWORD: usize = 0;

enum Chunk {
    Data(String),
    Closed,
}

/// Opens [`SshSession`]s with the system `ssh` client
#[derive(Debug, Clone)]
pub struct SshSessions {
    program: String,
}

impl Default for SshSessions {
    fn default() -> Self {
        Self { program: "sshpass".to_string() }
    }
}

impl SshSessions {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionFactory for SshSessions {
    fn open(
        &self,
        host: &str,
        user: &str,
        password: &str,
        login_timeout: Duration,
    ) -> Result<Box<dyn InteractiveSession>, SessionError> {
        let connect_err = |reason: String| SessionError::Connect {
            host: host.to_string(),
            reason,
        };

        let mut child = Command::new(&self.program)
            .args([
                "-e",
                "ssh",
                "-tt",
                "-oStrictHostKeyChecking=no",
                "-oUserKnownHostsFile=/dev/null",
            ])
            .arg(format!("{}@{}", user, host))
            .env("SSHPASS", password)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| connect_err(format!("failed to spawn {}: {}", self.program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connect_err("child stdin unavailable".into()))?;

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, tx.clone(), true);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, tx, false);
        }

        let mut session = SshSession {
            host: host.to_string(),
            child,
            stdin,
            rx,
            buffer: ExpectBuffer::new(),
            eof: false,
        };

        let login = session
            .expect(&PROMPTS.ssh_login, login_timeout)
            .map_err(|e| connect_err(e.to_string()))?;
        if login.index == SSH_PASSWORD {
            session.send_line(password)?;
            session
                .expect(&PROMPTS.ssh_shell, login_timeout)
                .map_err(|e| connect_err(e.to_string()))?;
        }
        debug!("'{}' connected", host);
        Ok(Box::new(session))
    }
}

/// Decodes UTF-8 read in arbitrary pieces, holding back a character split
/// across two reads until its remaining bytes arrive
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Whatever is left once the stream has ended
    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R, tx: Sender<Chunk>, report_close: bool) {
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut decoder = Utf8Decoder::default();
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = decoder.decode(&buf[..n]);
                    if chunk.is_empty() {
                        continue;
                    }
                    if tx.send(Chunk::Data(chunk)).is_err() {
                        return;
                    }
                }
            }
        }
        let rest = decoder.finish();
        if !rest.is_empty() && tx.send(Chunk::Data(rest)).is_err() {
            return;
        }
        if report_close {
            let _ = tx.send(Chunk::Closed);
        }
    });
}

/// A shell on a remote host
pub struct SshSession {
    host: String,
    child: Child,
    stdin: ChildStdin,
    rx: Receiver<Chunk>,
    buffer: ExpectBuffer,
    eof: bool,
}

impl InteractiveSession for SshSession {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        trace!("{} << {}", self.host, line);
        self.stdin.write_all(line.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }

    fn expect(&mut self, patterns: &[Regex], timeout: Duration) -> Result<Match, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(m) = self.buffer.try_match(patterns) {
                return Ok(m);
            }
            if self.eof {
                return Err(SessionError::Eof {
                    patterns: describe(patterns),
                    before: self.buffer.take(),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout {
                    timeout,
                    patterns: describe(patterns),
                    before: self.buffer.pending().to_string(),
                });
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(Chunk::Data(chunk)) => {
                    trace!("{} >> {:?}", self.host, chunk);
                    self.buffer.push(&chunk);
                }
                Ok(Chunk::Closed) | Err(RecvTimeoutError::Disconnected) => self.eof = true,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    fn close(&mut self) -> Result<(), SessionError> {
        if self.child.try_wait()?.is_none() {
            // The remote side never exits on its own while a pipe is attached
            let _ = self.child.kill();
        }
        self.child.wait()?;
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
