use crate::body::{CountingBody, MeteredBody};
use crate::config::Config;
use crate::install;
use crate::options::{normalize, RequestOptions, Target};
use crate::probe::{classify_error, classify_io_error, RequestProbe};
use bytes::Bytes;
use http::header::{HeaderValue, HOST};
use http::{Request, Response};
use http_body::Body;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use pki_types::ServerName;
use rustls::crypto::ring::{default_provider, DEFAULT_CIPHER_SUITES};
use rustls::{ClientConfig as TlsClientConfig, RootCertStore};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Options(#[from] crate::options::OptionsError),
    #[error("dns lookup failed for {host}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no addresses found for {0}")]
    NoAddresses(String),
    #[error("connect failed")]
    Connect(#[source] io::Error),
    #[error("invalid server name {0:?}")]
    ServerName(String),
    #[error("tls handshake failed")]
    Tls(#[source] io::Error),
    #[error("tls configuration error")]
    TlsConfig(#[from] rustls::Error),
    #[error("http exchange failed")]
    Exchange(#[from] hyper::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("background task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// HTTP/1.1 client that emits lifecycle events into a per-request
/// [`RequestProbe`] as they happen: DNS resolution, TCP connect (with
/// address capture), TLS handshake, request body frames, response headers,
/// response body frames, and termination.
///
/// When instrumentation is not installed, or the request carries the sink
/// marker header, the request is performed identically but unobserved.
pub struct InstrumentedClient {
    tls: Arc<TlsClientConfig>,
}

impl InstrumentedClient {
    pub fn new() -> Result<Self, ClientError> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let provider = Arc::new(rustls::crypto::CryptoProvider {
            cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(),
            ..default_provider()
        });
        let tls = TlsClientConfig::builder_with_provider(provider)
            .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Self { tls: Arc::new(tls) })
    }

    /// Sends `req`, returning the real response with only its body wrapped
    /// in a transparent counting proxy. Instrumentation never alters the
    /// exchange; a request failure is reported to the probe and returned to
    /// the caller unchanged.
    ///
    /// The request URI must be absolute; it is the target the metrics
    /// record is derived from.
    pub async fn request<B>(
        &self,
        mut req: Request<B>,
    ) -> Result<Response<MeteredBody<Incoming>>, ClientError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let recorder = install::current();

        let mut options = normalize(Target::Url(req.uri().to_string()), None)?;
        options.method = req.method().to_string();

        let probe = match &recorder {
            Some(recorder) => {
                if is_sink_request(req.headers(), &recorder.config.sink_marker) {
                    debug!(url = %options.href(), "sink-generated request, not instrumenting");
                    None
                } else {
                    Some(RequestProbe::new(
                        options.clone(),
                        recorder.callback.clone(),
                        recorder.config.clone(),
                    ))
                }
            }
            None => None,
        };

        if !req.headers().contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&options.host()) {
                req.headers_mut().insert(HOST, value);
            }
        }
        // http/1.1 origin-form request target; the absolute URL lives on in
        // the options record.
        if let Ok(origin) = options.path.parse::<http::Uri>() {
            *req.uri_mut() = origin;
        }

        let request_timeout = recorder
            .as_ref()
            .map(|r| r.config.request_timeout)
            .unwrap_or_else(|| Config::default().request_timeout);

        let fut = self.perform(req, &options, probe.clone());
        match timeout(request_timeout, fut).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => {
                if let Some(probe) = &probe {
                    report_failure(probe, &err);
                }
                Err(err)
            }
            Err(_) => {
                if let Some(probe) = &probe {
                    probe.on_timeout();
                }
                Err(ClientError::Timeout(request_timeout))
            }
        }
    }

    async fn perform<B>(
        &self,
        req: Request<B>,
        options: &RequestOptions,
        probe: Option<RequestProbe>,
    ) -> Result<Response<MeteredBody<Incoming>>, ClientError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if let Some(probe) = &probe {
            probe.on_socket_acquired();
        }

        let port = options.effective_port();
        let addr = match options.hostname.parse::<IpAddr>() {
            // IP literal: nothing to resolve, the DNS milestone stays unset.
            Ok(ip) => SocketAddr::new(ip, port),
            Err(_) => {
                let host = options.hostname.clone();
                let lookup = format!("{}:{}", host, port);
                let addrs = tokio::task::spawn_blocking(move || lookup.to_socket_addrs())
                    .await?
                    .map_err(|source| ClientError::Dns {
                        host: options.hostname.clone(),
                        source,
                    })?
                    .collect::<Vec<_>>();
                trace!("resolved {}: {:?}", options.hostname, addrs);
                let Some(first) = addrs.into_iter().next() else {
                    return Err(ClientError::NoAddresses(options.hostname.clone()));
                };
                if let Some(probe) = &probe {
                    probe.on_dns_resolved();
                }
                first
            }
        };

        let stream = TcpStream::connect(addr).await.map_err(ClientError::Connect)?;
        if let Some(probe) = &probe {
            probe.on_tcp_connected(stream.local_addr().ok(), stream.peer_addr().ok());
        }

        let req = req.map(|body| CountingBody::new(body, probe.clone()));

        if options.is_https() {
            let connector = tokio_rustls::TlsConnector::from(self.tls.clone());
            let server_name = ServerName::try_from(options.hostname.clone())
                .map_err(|_| ClientError::ServerName(options.hostname.clone()))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(ClientError::Tls)?;
            if let Some(probe) = &probe {
                probe.on_tls_done();
            }
            exchange(TokioIo::new(tls_stream), req, probe).await
        } else {
            exchange(TokioIo::new(stream), req, probe).await
        }
    }
}

async fn exchange<T, B>(
    io: T,
    req: Request<B>,
    probe: Option<RequestProbe>,
) -> Result<Response<MeteredBody<Incoming>>, ClientError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("connection task ended: {err}");
        }
    });

    let response = sender.send_request(req).await?;
    if let Some(probe) = &probe {
        probe.on_response_headers(response.status(), response.headers());
    }
    Ok(response.map(|incoming| MeteredBody::new(incoming, probe)))
}

fn is_sink_request(headers: &http::HeaderMap, marker: &str) -> bool {
    headers.contains_key(marker)
}

fn report_failure(probe: &RequestProbe, err: &ClientError) {
    match err {
        ClientError::Dns { source, .. }
        | ClientError::Connect(source)
        | ClientError::Tls(source) => {
            probe.on_error(err.to_string(), classify_io_error(source));
        }
        ClientError::NoAddresses(_) => {
            probe.on_error(err.to_string(), "ENOTFOUND");
        }
        ClientError::Exchange(source) => {
            probe.on_error(source.to_string(), classify_error(source));
        }
        ClientError::Timeout(_) => probe.on_timeout(),
        ClientError::Options(_)
        | ClientError::ServerName(_)
        | ClientError::TlsConfig(_)
        | ClientError::Join(_) => {
            probe.on_error(err.to_string(), "EUNKNOWN");
        }
    }
}
