use std::fmt;
use std::time::Instant;

/// Elapsed milliseconds between two optional instants.
///
/// Returns `None` when either endpoint was never recorded. `duration_since`
/// on a monotonic clock saturates at zero, so the result is never negative.
pub fn elapsed_ms(from: Option<Instant>, to: Option<Instant>) -> Option<f64> {
    Some(to?.duration_since(from?).as_secs_f64() * 1000.0)
}

/// One timestamp slot per request lifecycle milestone.
///
/// `start` is stamped at construction and never overwritten. Every other
/// slot is set the first time its event fires and ignored on repeats, with
/// one exception: `request_sent` is cleared when TCP connect lands after it
/// (see [`TimingRecord::mark_tcp_connected`]).
#[derive(Debug, Clone)]
pub struct TimingRecord {
    pub start: Instant,
    pub socket_acquired: Option<Instant>,
    pub dns_resolved: Option<Instant>,
    pub tcp_connected: Option<Instant>,
    pub tls_done: Option<Instant>,
    pub request_sent: Option<Instant>,
    pub first_byte: Option<Instant>,
    pub response_ended: Option<Instant>,
    pub errored: Option<Instant>,
}

fn mark(slot: &mut Option<Instant>) {
    if slot.is_none() {
        *slot = Some(Instant::now());
    }
}

impl TimingRecord {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            socket_acquired: None,
            dns_resolved: None,
            tcp_connected: None,
            tls_done: None,
            request_sent: None,
            first_byte: None,
            response_ended: None,
            errored: None,
        }
    }

    pub fn mark_socket_acquired(&mut self) {
        mark(&mut self.socket_acquired);
    }

    pub fn mark_dns_resolved(&mut self) {
        mark(&mut self.dns_resolved);
    }

    /// Stamps TCP connect and discards any `request_sent` stamp recorded
    /// before it. Some drivers deliver the request-finished signal ahead of
    /// the connect signal; keeping the early stamp would make the send
    /// duration run backwards, so it is dropped in favor of "unknown".
    pub fn mark_tcp_connected(&mut self) {
        mark(&mut self.tcp_connected);
        if self.request_sent.is_some() && self.request_sent < self.tcp_connected {
            self.request_sent = None;
        }
    }

    pub fn mark_tls_done(&mut self) {
        mark(&mut self.tls_done);
    }

    pub fn mark_request_sent(&mut self) {
        mark(&mut self.request_sent);
    }

    pub fn mark_first_byte(&mut self) {
        mark(&mut self.first_byte);
    }

    pub fn mark_response_ended(&mut self) {
        debug_assert!(self.errored.is_none(), "response end after error");
        mark(&mut self.response_ended);
    }

    pub fn mark_errored(&mut self) {
        debug_assert!(self.response_ended.is_none(), "error after response end");
        mark(&mut self.errored);
    }

    /// start → error time if set, else end time.
    pub fn total_ms(&self) -> Option<f64> {
        elapsed_ms(Some(self.start), self.errored.or(self.response_ended))
    }

    pub fn blocked_ms(&self) -> Option<f64> {
        elapsed_ms(Some(self.start), self.socket_acquired)
    }

    pub fn dns_ms(&self) -> Option<f64> {
        elapsed_ms(self.socket_acquired, self.dns_resolved)
    }

    /// DNS may be skipped entirely (cached entry, IP literal); connect then
    /// counts from socket acquisition.
    pub fn connect_ms(&self) -> Option<f64> {
        elapsed_ms(
            self.dns_resolved.or(self.socket_acquired),
            self.tcp_connected,
        )
    }

    pub fn ssl_ms(&self) -> Option<f64> {
        elapsed_ms(self.tcp_connected, self.tls_done)
    }

    pub fn send_ms(&self) -> Option<f64> {
        elapsed_ms(self.tls_done.or(self.tcp_connected), self.request_sent)
    }

    pub fn wait_ms(&self) -> Option<f64> {
        elapsed_ms(
            self.request_sent.or(self.tls_done).or(self.tcp_connected),
            self.first_byte,
        )
    }

    pub fn receive_ms(&self) -> Option<f64> {
        elapsed_ms(self.first_byte, self.response_ended)
    }
}

impl Default for TimingRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nTime breakdown:")?;

        let rows = [
            ("Blocked", self.blocked_ms()),
            ("DNS lookup", self.dns_ms()),
            ("TCP connect", self.connect_ms()),
            ("TLS handshake", self.ssl_ms()),
            ("Send", self.send_ms()),
            ("Wait", self.wait_ms()),
            ("Receive", self.receive_ms()),
            ("Total time", self.total_ms()),
        ];
        for (label, value) in rows {
            if let Some(ms) = value {
                writeln!(f, "  {:<15} {:>10.3} ms", label, ms)?;
            } else {
                writeln!(f, "  {:<15} N/A", label)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn elapsed_ms_requires_both_endpoints() {
        let now = Instant::now();
        assert!(elapsed_ms(None, Some(now)).is_none());
        assert!(elapsed_ms(Some(now), None).is_none());
        assert!(elapsed_ms(None, None).is_none());
    }

    #[test]
    fn elapsed_ms_never_negative() {
        let a = Instant::now();
        let b = a + Duration::from_millis(5);
        // Reversed endpoints saturate to zero rather than going negative.
        assert_eq!(elapsed_ms(Some(b), Some(a)), Some(0.0));
        let forward = elapsed_ms(Some(a), Some(b)).unwrap();
        assert!((forward - 5.0).abs() < 0.5);
    }

    #[test]
    fn slots_are_set_once() {
        let mut t = TimingRecord::new();
        t.mark_dns_resolved();
        let first = t.dns_resolved;
        std::thread::sleep(Duration::from_millis(2));
        t.mark_dns_resolved();
        assert_eq!(t.dns_resolved, first);
    }

    #[test]
    fn connect_clears_earlier_request_sent() {
        let mut t = TimingRecord::new();
        t.mark_request_sent();
        std::thread::sleep(Duration::from_millis(1));
        t.mark_tcp_connected();
        assert!(t.request_sent.is_none());
        assert!(t.send_ms().is_none());
    }

    #[test]
    fn connect_keeps_later_request_sent() {
        let mut t = TimingRecord::new();
        t.mark_tcp_connected();
        std::thread::sleep(Duration::from_millis(1));
        t.mark_request_sent();
        let send = t.send_ms().unwrap();
        assert!(send >= 0.0);
    }

    #[test]
    fn connect_falls_back_to_socket_when_dns_skipped() {
        let mut t = TimingRecord::new();
        t.mark_socket_acquired();
        std::thread::sleep(Duration::from_millis(2));
        t.mark_tcp_connected();
        assert!(t.dns_ms().is_none());
        assert!(t.connect_ms().unwrap() >= 1.0);
    }

    #[test]
    fn total_prefers_error_time() {
        let mut t = TimingRecord::new();
        t.mark_errored();
        assert!(t.total_ms().is_some());
        assert!(t.receive_ms().is_none());
    }
}
