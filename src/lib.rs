//! Per-request performance telemetry for outbound HTTP/HTTPS requests.
//!
//! Each instrumented request gets a [`RequestProbe`]: a small state machine
//! fed by lifecycle events (socket acquired, DNS resolved, TCP connected,
//! TLS done, body frames, response headers, termination). From those partial
//! and sometimes-missing signals it derives phase durations (blocked, DNS,
//! connect, SSL, send, wait, receive), byte counts, and socket addresses,
//! and delivers one [`MetricsRecord`] to the installed callback exactly
//! once, even when terminal signals race or never arrive (a safety-net
//! deadline covers abandoned response streams).
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), reqprobe::ClientError> {
//! let handle = reqprobe::start(
//!     Arc::new(|record| println!("{}", serde_json::to_string(&record).unwrap())),
//!     reqprobe::Config::from_env(),
//! );
//!
//! let client = reqprobe::InstrumentedClient::new()?;
//! let req = http::Request::builder()
//!     .uri("https://example.com/api")
//!     .body(http_body_util::Full::new(bytes::Bytes::new()))
//!     .unwrap();
//! let _response = client.request(req).await?;
//!
//! reqprobe::stop(handle);
//! # Ok(())
//! # }
//! ```

pub mod body;
pub mod client;
pub mod config;
pub mod install;
pub mod options;
pub mod probe;
pub mod report;
pub mod timing;

pub use client::{ClientError, InstrumentedClient};
pub use config::Config;
pub use install::{start, stop, InstrumentHandle, Recorder};
pub use options::{normalize, OptionsError, RequestOptions, Target, TargetOverrides};
pub use probe::RequestProbe;
pub use report::{MetricsCallback, MetricsRecord};
pub use timing::{elapsed_ms, TimingRecord};
