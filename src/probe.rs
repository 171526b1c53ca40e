use crate::config::Config;
use crate::options::RequestOptions;
use crate::report::{MetricsCallback, MetricsRecord};
use crate::timing::TimingRecord;
use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Response header carrying the server-side correlation identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const TIMEOUT_MESSAGE: &str = "connection timed out";
const TIMEOUT_CODE: &str = "ETIMEDOUT";

/// Per-request metrics state machine.
///
/// One probe is created per outgoing request. Lifecycle notifications are
/// fed in through the `on_*` operations as they happen; whichever terminal
/// signal arrives first (response end, error, timeout, or the safety-net
/// timer) seals the probe and delivers the finished [`MetricsRecord`] to the
/// callback. The seal is a single-use latch: racing or late signals after it
/// are ignored, so the callback fires exactly once.
///
/// Handles are cheap clones over shared state and may be passed to the
/// tasks that drive the connection, the body wrappers, and the timer.
#[derive(Clone)]
pub struct RequestProbe {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<ProbeState>,
    callback: MetricsCallback,
    config: Config,
}

struct ProbeState {
    options: RequestOptions,
    timings: TimingRecord,
    request_body_bytes: u64,
    response_body_bytes: u64,
    /// Once seeded from content-length, chunk accumulation is disabled.
    size_from_header: bool,
    response_code: Option<u16>,
    response_status: Option<String>,
    content_type: Option<String>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    server_request_id: Option<String>,
    error: Option<(String, String)>,
    reported: bool,
    safety_net: Option<JoinHandle<()>>,
}

impl RequestProbe {
    pub fn new(options: RequestOptions, callback: MetricsCallback, config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ProbeState {
                    options,
                    timings: TimingRecord::new(),
                    request_body_bytes: 0,
                    response_body_bytes: 0,
                    size_from_header: false,
                    response_code: None,
                    response_status: None,
                    content_type: None,
                    local_addr: None,
                    remote_addr: None,
                    server_request_id: None,
                    error: None,
                    reported: false,
                    safety_net: None,
                }),
                callback,
                config,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ProbeState> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn is_reported(&self) -> bool {
        self.state().reported
    }

    pub fn on_socket_acquired(&self) {
        let mut st = self.state();
        if st.reported {
            return;
        }
        st.timings.mark_socket_acquired();
    }

    pub fn on_dns_resolved(&self) {
        let mut st = self.state();
        if st.reported {
            return;
        }
        st.timings.mark_dns_resolved();
    }

    /// Stamps TCP connect and captures the socket addresses, once. Repeat
    /// firings (socket reuse) leave the first capture intact.
    pub fn on_tcp_connected(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>) {
        let mut st = self.state();
        if st.reported {
            return;
        }
        st.timings.mark_tcp_connected();
        if st.local_addr.is_none() {
            st.local_addr = local;
        }
        if st.remote_addr.is_none() {
            st.remote_addr = remote;
        }
    }

    pub fn on_tls_done(&self) {
        let mut st = self.state();
        if st.reported {
            return;
        }
        st.timings.mark_tls_done();
    }

    pub fn on_request_body_chunk(&self, len: usize) {
        let mut st = self.state();
        if st.reported {
            return;
        }
        st.request_body_bytes += len as u64;
    }

    pub fn on_request_finished(&self) {
        let mut st = self.state();
        if st.reported {
            return;
        }
        st.timings.mark_request_sent();
    }

    /// Response headers arrived: the first response bytes are on the wire,
    /// so `first_byte` is stamped here. Seeds the response byte counter from
    /// content-length when it parses, captures content-type and the
    /// correlation id, and arms the safety-net timer: from this point the
    /// probe must eventually report even if the caller abandons the body.
    pub fn on_response_headers(&self, status: StatusCode, headers: &HeaderMap) {
        let mut st = self.state();
        if st.reported {
            return;
        }
        st.timings.mark_first_byte();
        st.response_code = Some(status.as_u16());
        st.response_status = status.canonical_reason().map(String::from);

        if let Some(value) = headers.get(CONTENT_TYPE) {
            st.content_type = value.to_str().ok().map(String::from);
        }
        if let Some(value) = headers.get(REQUEST_ID_HEADER) {
            st.server_request_id = value.to_str().ok().map(String::from);
        }
        if let Some(raw) = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
        {
            match raw.parse::<u64>() {
                Ok(n) => {
                    st.response_body_bytes = n;
                    st.size_from_header = true;
                }
                Err(_) => debug!("unparseable content-length {:?}, counting chunks", raw),
            }
        }

        self.arm_safety_net(&mut st);
    }

    pub fn on_response_chunk(&self, len: usize) {
        let mut st = self.state();
        if st.reported {
            return;
        }
        st.timings.mark_first_byte();
        if !st.size_from_header {
            st.response_body_bytes += len as u64;
        }
    }

    pub fn on_response_ended(&self) {
        let record = {
            let mut st = self.state();
            if st.reported {
                return;
            }
            st.timings.mark_response_ended();
            self.seal(&mut st)
        };
        (self.shared.callback)(record);
    }

    pub fn on_error(&self, message: impl Into<String>, code: impl Into<String>) {
        let record = {
            let mut st = self.state();
            if st.reported {
                return;
            }
            st.timings.mark_errored();
            st.error = Some((message.into(), code.into()));
            self.seal(&mut st)
        };
        (self.shared.callback)(record);
    }

    pub fn on_io_error(&self, err: &io::Error) {
        self.on_error(err.to_string(), classify_io_error(err));
    }

    pub fn on_timeout(&self) {
        self.on_error(TIMEOUT_MESSAGE, TIMEOUT_CODE);
    }

    /// Deadline fallback for requests whose stream is never drained: report
    /// whatever partial data exists. A recovered condition, not a failure.
    fn safety_net_fire(&self) {
        let record = {
            let mut st = self.state();
            if st.reported {
                return;
            }
            warn!(
                url = %st.options.href(),
                "safety-net deadline hit before a terminal event, reporting partial metrics"
            );
            self.seal(&mut st)
        };
        (self.shared.callback)(record);
    }

    fn arm_safety_net(&self, st: &mut ProbeState) {
        if st.safety_net.is_some() {
            return;
        }
        let window = self.shared.config.safety_net_window();
        let probe = self.clone();
        st.safety_net = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            probe.safety_net_fire();
        }));
    }

    /// Flips the report latch, cancels the safety net, and freezes the
    /// record. Caller still holds the lock; the callback runs after release.
    fn seal(&self, st: &mut ProbeState) -> MetricsRecord {
        st.reported = true;
        if let Some(timer) = st.safety_net.take() {
            timer.abort();
        }

        let t = &st.timings;
        let (error_message, error_code) = match &st.error {
            Some((message, code)) => (Some(message.clone()), Some(code.clone())),
            None => (None, None),
        };
        MetricsRecord {
            protocol: st.options.protocol.clone(),
            host: st.options.host(),
            port: st.options.effective_port(),
            path: st.options.path.clone(),
            url: st.options.href(),
            method: st.options.method.clone(),
            domain: st.options.hostname.clone(),
            response_code: st.response_code,
            response_status: st.response_status.clone(),
            content_type: st.content_type.clone(),
            local_ip_address: st.local_addr.map(|a| a.ip().to_string()),
            server_ip_address: st.remote_addr.map(|a| a.ip().to_string()),
            duration: t.total_ms(),
            duration_blocked: t.blocked_ms(),
            duration_dns: t.dns_ms(),
            duration_connect: t.connect_ms(),
            duration_ssl: t.ssl_ms(),
            duration_send: t.send_ms(),
            duration_wait: t.wait_ms(),
            duration_receive: t.receive_ms(),
            request_body_size: st.request_body_bytes,
            response_body_size: st.response_body_bytes,
            server_request_id: st.server_request_id.clone(),
            error: st.error.is_some(),
            error_message,
            error_code,
        }
    }
}

/// Classification for arbitrary body/transport errors: walks the source
/// chain looking for an underlying `io::Error`, else a protocol error.
pub fn classify_error(err: &(dyn std::error::Error + 'static)) -> &'static str {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return classify_io_error(io_err);
        }
        current = e.source();
    }
    "EPROTO"
}

/// Conventional errno-style name for a transport error.
pub fn classify_io_error(err: &io::Error) -> &'static str {
    use io::ErrorKind::*;
    match err.kind() {
        ConnectionRefused => "ECONNREFUSED",
        ConnectionReset => "ECONNRESET",
        ConnectionAborted => "ECONNABORTED",
        NotConnected => "ENOTCONN",
        AddrInUse => "EADDRINUSE",
        AddrNotAvailable => "EADDRNOTAVAIL",
        BrokenPipe => "EPIPE",
        TimedOut => TIMEOUT_CODE,
        NotFound => "ENOTFOUND",
        _ => "EUNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{normalize, Target};
    use std::time::Duration;

    fn probe_for(url: &str) -> (RequestProbe, Arc<Mutex<Vec<MetricsRecord>>>) {
        probe_with_config(url, Config::default())
    }

    fn probe_with_config(
        url: &str,
        config: Config,
    ) -> (RequestProbe, Arc<Mutex<Vec<MetricsRecord>>>) {
        let records: Arc<Mutex<Vec<MetricsRecord>>> = Arc::default();
        let sink = records.clone();
        let callback: MetricsCallback = Arc::new(move |record| {
            sink.lock().unwrap().push(record);
        });
        let options = normalize(Target::from(url), None).unwrap();
        (RequestProbe::new(options, callback, config), records)
    }

    #[tokio::test]
    async fn reports_exactly_once_under_racing_terminals() {
        let (probe, records) = probe_for("https://example.com/api");
        probe.on_socket_acquired();
        probe.on_response_headers(StatusCode::OK, &HeaderMap::new());
        probe.on_response_ended();
        // Late error and timeout after a clean end must be swallowed.
        probe.on_error("reset", "ECONNRESET");
        probe.on_timeout();
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].error);
    }

    #[tokio::test]
    async fn full_lifecycle_record() {
        let (probe, records) = probe_for("https://example.com/api");
        probe.on_socket_acquired();
        probe.on_dns_resolved();
        probe.on_tcp_connected(
            Some("10.0.0.5:49152".parse().unwrap()),
            Some("93.184.216.34:443".parse().unwrap()),
        );
        probe.on_tls_done();
        probe.on_request_body_chunk(10);
        probe.on_request_body_chunk(7);
        probe.on_request_finished();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "42".parse().unwrap());
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        headers.insert(REQUEST_ID_HEADER, "abc-123".parse().unwrap());
        probe.on_response_headers(StatusCode::OK, &headers);
        probe.on_response_chunk(42);
        probe.on_response_ended();

        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.protocol, "https:");
        assert_eq!(r.port, 443);
        assert_eq!(r.url, "https://example.com/api");
        assert_eq!(r.response_code, Some(200));
        assert_eq!(r.content_type.as_deref(), Some("application/json"));
        assert_eq!(r.local_ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(r.server_ip_address.as_deref(), Some("93.184.216.34"));
        assert_eq!(r.request_body_size, 17);
        assert_eq!(r.response_body_size, 42);
        assert_eq!(r.server_request_id.as_deref(), Some("abc-123"));
        for d in [
            r.duration,
            r.duration_blocked,
            r.duration_dns,
            r.duration_connect,
            r.duration_ssl,
            r.duration_send,
            r.duration_wait,
            r.duration_receive,
        ] {
            assert!(d.unwrap() >= 0.0);
        }
    }

    #[tokio::test]
    async fn content_length_header_wins_over_chunks() {
        let (probe, records) = probe_for("http://example.com/big");
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "1024".parse().unwrap());
        probe.on_response_headers(StatusCode::OK, &headers);
        probe.on_response_chunk(5000);
        probe.on_response_chunk(5000);
        probe.on_response_ended();
        assert_eq!(records.lock().unwrap()[0].response_body_size, 1024);
    }

    #[tokio::test]
    async fn chunks_accumulate_without_header() {
        let (probe, records) = probe_for("http://example.com/stream");
        probe.on_response_headers(StatusCode::OK, &HeaderMap::new());
        probe.on_response_chunk(300);
        probe.on_response_chunk(212);
        probe.on_response_ended();
        assert_eq!(records.lock().unwrap()[0].response_body_size, 512);
    }

    #[tokio::test]
    async fn malformed_content_length_falls_back_to_chunks() {
        let (probe, records) = probe_for("http://example.com/odd");
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, "not-a-number".parse().unwrap());
        probe.on_response_headers(StatusCode::OK, &headers);
        probe.on_response_chunk(9);
        probe.on_response_ended();
        let records = records.lock().unwrap();
        assert!(!records[0].error);
        assert_eq!(records[0].response_body_size, 9);
    }

    #[tokio::test]
    async fn error_before_any_socket_event() {
        let (probe, records) = probe_for("http://example.com/refused");
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        probe.on_io_error(&err);
        let records = records.lock().unwrap();
        let r = &records[0];
        assert!(r.error);
        assert_eq!(r.error_code.as_deref(), Some("ECONNREFUSED"));
        assert!(r.duration_blocked.is_none());
        assert!(r.duration_receive.is_none());
        assert!(r.duration.is_some());
    }

    #[tokio::test]
    async fn timeout_uses_fixed_classification() {
        let (probe, records) = probe_for("http://example.com/slow");
        probe.on_timeout();
        let records = records.lock().unwrap();
        assert_eq!(records[0].error_code.as_deref(), Some("ETIMEDOUT"));
        assert_eq!(records[0].error_message.as_deref(), Some("connection timed out"));
    }

    #[tokio::test]
    async fn connect_after_finish_leaves_send_unknown() {
        let (probe, records) = probe_for("http://example.com/anomaly");
        probe.on_request_finished();
        std::thread::sleep(Duration::from_millis(1));
        probe.on_tcp_connected(None, None);
        probe.on_response_ended();
        assert!(records.lock().unwrap()[0].duration_send.is_none());
    }

    #[tokio::test]
    async fn socket_addresses_captured_once() {
        let (probe, records) = probe_for("http://example.com/reuse");
        probe.on_tcp_connected(None, Some("1.1.1.1:80".parse().unwrap()));
        probe.on_tcp_connected(None, Some("2.2.2.2:80".parse().unwrap()));
        probe.on_response_ended();
        assert_eq!(
            records.lock().unwrap()[0].server_ip_address.as_deref(),
            Some("1.1.1.1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn safety_net_reports_partial_metrics() {
        let config = Config {
            fallback_window: Duration::from_millis(200),
            ..Default::default()
        };
        let (probe, records) = probe_with_config("http://example.com/abandoned", config);
        probe.on_response_headers(StatusCode::OK, &HeaderMap::new());
        // Caller never drains the body and no terminal event arrives.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert!(r.duration_receive.is_none());
        assert_eq!(r.response_code, Some(200));
        assert!(!r.error);
    }

    #[tokio::test(start_paused = true)]
    async fn safety_net_cancelled_by_clean_end() {
        let config = Config {
            fallback_window: Duration::from_millis(200),
            ..Default::default()
        };
        let (probe, records) = probe_with_config("http://example.com/clean", config);
        probe.on_response_headers(StatusCode::OK, &HeaderMap::new());
        probe.on_response_ended();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(records.lock().unwrap().len(), 1);
    }
}
