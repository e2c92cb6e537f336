use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::arrival_rate::ArrivalRate;

/// A single downstream metric-ingest server (spec §3, §4.2). Equality is by
/// `(host, tcpPort)`; `up` is read-only to the resolver and mutated
/// out-of-band by the health checker.
#[derive(Debug)]
pub struct Backend {
    pub host: String,
    pub tcp_port: u16,
    up: AtomicBool,
    arrival_rate: ArrivalRate,
}

impl Backend {
    pub fn new(host: impl Into<String>, tcp_port: u16) -> Self {
        Backend {
            host: host.into(),
            tcp_port,
            up: AtomicBool::new(true), // optimistic init, per teacher's Backend::new
            arrival_rate: ArrivalRate::new(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Relaxed);
    }

    pub fn arrival_rate(&self) -> f64 {
        self.arrival_rate.rate()
    }

    pub fn arrived(&self) {
        self.arrival_rate.arrived();
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.tcp_port == other.tcp_port
    }
}

impl Eq for Backend {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_host_and_port() {
        let a = Backend::new("h1", 1001);
        let b = Backend::new("h1", 1001);
        let c = Backend::new("h1", 1002);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn starts_up_and_with_zero_rate() {
        let b = Backend::new("h1", 1001);
        assert!(b.is_up());
        assert_eq!(b.arrival_rate(), 0.0);
    }
}
