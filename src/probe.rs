//! Host reachability checks.

use log::debug;
use std::collections::HashSet;
use std::process::{Command, Stdio};
use std::sync::Mutex;

pub trait Prober: Send + Sync {
    fn is_reachable(&self, addr: &str) -> bool;
}

/// Sends two ICMP echo requests with the system `ping`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPing;

impl Prober for SystemPing {
    fn is_reachable(&self, addr: &str) -> bool {
        debug!("Trying to ping {}", addr);
        Command::new("ping")
            .args(["-c", "2", addr])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Answers from a fixed set of unreachable addresses; everything else is up
#[derive(Debug, Default)]
pub struct StaticProber {
    down: Mutex<HashSet<String>>,
}

impl StaticProber {
    pub fn all_up() -> Self {
        Self::default()
    }

    pub fn with_down<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            down: Mutex::new(addrs.into_iter().map(Into::into).collect()),
        }
    }

    pub fn set_down(&self, addr: &str) {
        self.down
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(addr.to_string());
    }
}

impl Prober for StaticProber {
    fn is_reachable(&self, addr: &str) -> bool {
        !self
            .down
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_prober() {
        let p = StaticProber::with_down(["10.0.0.9"]);
        assert!(p.is_reachable("10.0.0.1"));
        assert!(!p.is_reachable("10.0.0.9"));
        p.set_down("10.0.0.1");
        assert!(!p.is_reachable("10.0.0.1"));
    }
}
