use crate::probe::RequestProbe;
use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// Transparent counting proxy around an outgoing request body.
    ///
    /// Frames pass through untouched; data-frame lengths feed the probe's
    /// request byte counter, and end-of-stream stamps the request-sent
    /// milestone. With no probe attached it is pure passthrough.
    pub struct CountingBody<B> {
        #[pin]
        inner: B,
        probe: Option<RequestProbe>,
        finished: bool,
    }
}

impl<B> CountingBody<B> {
    pub fn new(inner: B, probe: Option<RequestProbe>) -> Self {
        Self {
            inner,
            probe,
            finished: false,
        }
    }
}

impl<B> Body for CountingBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        if let Some(probe) = this.probe {
            match &polled {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Some(data) = frame.data_ref() {
                        probe.on_request_body_chunk(data.len());
                    }
                }
                Poll::Ready(None) => {
                    if !*this.finished {
                        *this.finished = true;
                        probe.on_request_finished();
                    }
                }
                _ => {}
            }
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Transparent counting proxy around the incoming response body.
    ///
    /// Reports chunk lengths, end-of-stream, and mid-stream errors to the
    /// probe while handing every frame to the caller unchanged.
    pub struct MeteredBody<B> {
        #[pin]
        inner: B,
        probe: Option<RequestProbe>,
        ended: bool,
    }
}

impl<B> std::fmt::Debug for MeteredBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteredBody")
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}

impl<B> MeteredBody<B> {
    pub fn new(inner: B, probe: Option<RequestProbe>) -> Self {
        Self {
            inner,
            probe,
            ended: false,
        }
    }
}

impl<B> Body for MeteredBody<B>
where
    B: Body<Data = Bytes>,
    B::Error: std::error::Error + 'static,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let polled = this.inner.poll_frame(cx);
        if let Some(probe) = this.probe {
            match &polled {
                Poll::Ready(Some(Ok(frame))) => {
                    if let Some(data) = frame.data_ref() {
                        probe.on_response_chunk(data.len());
                    }
                }
                Poll::Ready(Some(Err(err))) => {
                    probe.on_error(err.to_string(), crate::probe::classify_error(err));
                }
                Poll::Ready(None) => {
                    if !*this.ended {
                        *this.ended = true;
                        probe.on_response_ended();
                    }
                }
                Poll::Pending => {}
            }
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::options::{normalize, Target};
    use crate::report::{MetricsCallback, MetricsRecord};
    use http_body_util::{BodyExt, Full};
    use std::sync::{Arc, Mutex};

    fn probe_and_records() -> (RequestProbe, Arc<Mutex<Vec<MetricsRecord>>>) {
        let records: Arc<Mutex<Vec<MetricsRecord>>> = Arc::default();
        let sink = records.clone();
        let callback: MetricsCallback = Arc::new(move |record| {
            sink.lock().unwrap().push(record);
        });
        let options = normalize(Target::from("http://example.com/"), None).unwrap();
        (
            RequestProbe::new(options, callback, Config::default()),
            records,
        )
    }

    #[tokio::test]
    async fn request_body_counted_and_finish_stamped() {
        let (probe, records) = probe_and_records();
        probe.on_tcp_connected(None, None);

        let body = CountingBody::new(Full::new(Bytes::from_static(b"hello")), Some(probe.clone()));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");

        probe.on_response_ended();
        let records = records.lock().unwrap();
        assert_eq!(records[0].request_body_size, 5);
        assert!(records[0].duration_send.is_some());
    }

    #[tokio::test]
    async fn response_body_end_seals_probe() {
        let (probe, records) = probe_and_records();
        probe.on_response_headers(http::StatusCode::OK, &http::HeaderMap::new());

        let body = MeteredBody::new(Full::new(Bytes::from_static(b"abcdef")), Some(probe.clone()));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.len(), 6);

        assert!(probe.is_reported());
        let records = records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response_body_size, 6);
        assert!(records[0].duration_receive.is_some());
    }

    #[tokio::test]
    async fn passthrough_without_probe() {
        let body = CountingBody::new(Full::new(Bytes::from_static(b"data")), None);
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"data");
    }
}
