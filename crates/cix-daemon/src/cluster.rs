//! Forward-overlay state: TCP peers that re-broadcast multicast
//! announcements beyond the local L2 domain, with exponential-backoff
//! reconnects driven by a single earliest-due timer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::events::ConnId;

pub type ForwardAddr = (String, u16);

#[derive(Debug, Default)]
struct Forward {
    conn: Option<ConnId>,
    failures: u32,
    last_attempt: Option<Instant>,
}

/// Backoff: `1000 × 2^(failures-1)` ms after the last attempt.
fn earliest_reconnect(last_attempt: Option<Instant>, failures: u32) -> Option<Instant> {
    let last = last_attempt?;
    if failures == 0 {
        return Some(last);
    }
    let wait = Duration::from_millis(1000u64.saturating_mul(1 << (failures - 1).min(20)));
    Some(last + wait)
}

#[derive(Debug, Default)]
pub struct ForwardRegistry {
    forwards: HashMap<ForwardAddr, Forward>,
}

impl ForwardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a forward address. Returns false if it already exists.
    pub fn add(&mut self, addr: ForwardAddr) -> bool {
        if self.forwards.contains_key(&addr) {
            return false;
        }
        self.forwards.insert(addr, Forward::default());
        true
    }

    /// Remove a forward. Returns its live connection, if any, so the caller
    /// can finish it.
    pub fn remove(&mut self, addr: &ForwardAddr) -> Option<Option<ConnId>> {
        self.forwards.remove(addr).map(|forward| forward.conn)
    }

    pub fn contains(&self, addr: &ForwardAddr) -> bool {
        self.forwards.contains_key(addr)
    }

    pub fn is_connected(&self, addr: &ForwardAddr) -> bool {
        self.forwards
            .get(addr)
            .map(|forward| forward.conn.is_some())
            .unwrap_or(false)
    }

    /// A dial is starting for `addr`.
    pub fn dialing(&mut self, addr: &ForwardAddr, now: Instant) {
        if let Some(forward) = self.forwards.get_mut(addr) {
            forward.last_attempt = Some(now);
        }
    }

    pub fn connected(&mut self, addr: &ForwardAddr, conn: ConnId) {
        if let Some(forward) = self.forwards.get_mut(addr) {
            forward.conn = Some(conn);
            forward.failures = 0;
        }
    }

    pub fn connect_failed(&mut self, addr: &ForwardAddr) {
        if let Some(forward) = self.forwards.get_mut(addr) {
            forward.conn = None;
            forward.failures += 1;
        }
    }

    /// A connection died. Returns the forward address it belonged to.
    pub fn connection_lost(&mut self, conn: ConnId) -> Option<ForwardAddr> {
        for (addr, forward) in self.forwards.iter_mut() {
            if forward.conn == Some(conn) {
                forward.conn = None;
                forward.failures += 1;
                return Some(addr.clone());
            }
        }
        None
    }

    /// Live connections to fan a datagram out to, split-horizon: the
    /// connection the packet came from (if any) is excluded.
    pub fn send_targets(&self, except: Option<ConnId>) -> Vec<ConnId> {
        self.forwards
            .values()
            .filter_map(|forward| forward.conn)
            .filter(|&conn| Some(conn) != except)
            .collect()
    }

    /// Disconnected forwards due for a reconnect now, plus the wait until
    /// the next one comes due (for the single reconnect timer).
    pub fn due_reconnects(&self, now: Instant) -> (Vec<ForwardAddr>, Option<Duration>) {
        let mut due = Vec::new();
        let mut next: Option<Duration> = None;
        for (addr, forward) in &self.forwards {
            if forward.conn.is_some() {
                continue;
            }
            match earliest_reconnect(forward.last_attempt, forward.failures) {
                None => due.push(addr.clone()),
                Some(at) if at <= now => due.push(addr.clone()),
                Some(at) => {
                    let wait = at.duration_since(now);
                    next = Some(match next {
                        None => wait,
                        Some(previous) => previous.min(wait),
                    });
                }
            }
        }
        (due, next)
    }

    pub fn status(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .forwards
            .iter()
            .map(|((host, port), forward)| {
                format!(
                    "{host}:{port} {}",
                    if forward.conn.is_some() {
                        "connected"
                    } else {
                        "not connected"
                    }
                )
            })
            .collect();
        lines.sort();
        lines
    }
}

/// Parse `host:port`, defaulting the port.
pub fn parse_host(input: &str, default_port: u16) -> Option<ForwardAddr> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    match input.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((input.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_failure() {
        let start = Instant::now();
        let one = earliest_reconnect(Some(start), 1).unwrap();
        let two = earliest_reconnect(Some(start), 2).unwrap();
        let five = earliest_reconnect(Some(start), 5).unwrap();
        assert_eq!(one - start, Duration::from_millis(1000));
        assert_eq!(two - start, Duration::from_millis(2000));
        assert_eq!(five - start, Duration::from_millis(16000));
    }

    #[test]
    fn reconnect_happens_no_earlier_than_the_bound() {
        let mut registry = ForwardRegistry::new();
        let addr = ("peer".to_string(), 7000);
        let start = Instant::now();

        registry.add(addr.clone());
        registry.dialing(&addr, start);
        registry.connect_failed(&addr);
        registry.dialing(&addr, start);
        registry.connect_failed(&addr);

        // Two failures: due at lastAttempt + 2000ms and not before.
        let (due, next) = registry.due_reconnects(start + Duration::from_millis(1999));
        assert!(due.is_empty());
        assert_eq!(next, Some(Duration::from_millis(1)));

        let (due, next) = registry.due_reconnects(start + Duration::from_millis(2000));
        assert_eq!(due, vec![addr]);
        assert_eq!(next, None);
    }

    #[test]
    fn success_resets_failures() {
        let mut registry = ForwardRegistry::new();
        let addr = ("peer".to_string(), 7000);
        let now = Instant::now();

        registry.add(addr.clone());
        registry.dialing(&addr, now);
        registry.connect_failed(&addr);
        registry.dialing(&addr, now);
        registry.connected(&addr, ConnId::from_raw(1));
        assert!(registry.is_connected(&addr));

        // Next drop starts the ladder at one failure again.
        assert_eq!(registry.connection_lost(ConnId::from_raw(1)), Some(addr.clone()));
        registry.dialing(&addr, now);
        let (due, next) = registry.due_reconnects(now + Duration::from_millis(999));
        assert!(due.is_empty());
        assert_eq!(next, Some(Duration::from_millis(1)));
    }

    #[test]
    fn split_horizon_excludes_the_source_connection() {
        let mut registry = ForwardRegistry::new();
        let a = ("a".to_string(), 1);
        let b = ("b".to_string(), 2);
        registry.add(a.clone());
        registry.add(b.clone());
        registry.connected(&a, ConnId::from_raw(1));
        registry.connected(&b, ConnId::from_raw(2));

        let mut targets = registry.send_targets(Some(ConnId::from_raw(1)));
        targets.sort();
        assert_eq!(targets, vec![ConnId::from_raw(2)]);

        let mut all = registry.send_targets(None);
        all.sort();
        assert_eq!(all, vec![ConnId::from_raw(1), ConnId::from_raw(2)]);
    }

    #[test]
    fn parse_host_accepts_bare_and_explicit_ports() {
        assert_eq!(
            parse_host("peer:7001", 7000),
            Some(("peer".to_string(), 7001))
        );
        assert_eq!(parse_host("peer", 7000), Some(("peer".to_string(), 7000)));
        assert_eq!(parse_host("", 7000), None);
        assert_eq!(parse_host("peer:bogus", 7000), None);
    }

    #[test]
    fn never_attempted_forwards_are_due_immediately() {
        let mut registry = ForwardRegistry::new();
        registry.add(("peer".to_string(), 7000));
        let (due, _) = registry.due_reconnects(Instant::now());
        assert_eq!(due.len(), 1);
    }
}
