use serde::Serialize;
use std::sync::Arc;

/// The record delivered to the metrics callback, exactly once per request.
///
/// Field names follow the collector's wire convention; durations are
/// fractional milliseconds, absent when the underlying milestone was never
/// observed.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MetricsRecord {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub url: String,
    pub method: String,
    pub domain: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(rename = "localIPAddress", skip_serializing_if = "Option::is_none")]
    pub local_ip_address: Option<String>,
    #[serde(rename = "serverIPAddress", skip_serializing_if = "Option::is_none")]
    pub server_ip_address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_blocked: Option<f64>,
    #[serde(rename = "durationDNS", skip_serializing_if = "Option::is_none")]
    pub duration_dns: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_connect: Option<f64>,
    #[serde(rename = "durationSSL", skip_serializing_if = "Option::is_none")]
    pub duration_ssl: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_send: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_wait: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_receive: Option<f64>,

    pub request_body_size: u64,
    pub response_body_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_request_id: Option<String>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

/// Sink for finished records. Shared across requests, called from whichever
/// task reaches the terminal condition first.
pub type MetricsCallback = Arc<dyn Fn(MetricsRecord) + Send + Sync>;
