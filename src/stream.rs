//! HTTP stream reader.
//!
//! One GET per station. The body is pulled by a background task and
//! forwarded to the session in chunks of at most `read_chunk_size` bytes.
//! Suspending simply stops pulling from the body, so the connection (and
//! our place in the live stream) survives a pause.

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::{BoxStream, StreamExt};
use futures_util::FutureExt;
use log::{debug, info, warn};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{PlayerError, Result};
use crate::events::{Epoch, EventSender, SessionEvent, StreamEvent};

pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes>>,
}

/// Something that can issue a streaming GET.
pub trait Transport: Send + Sync {
    fn get(&self, url: &Url) -> BoxFuture<'static, Result<HttpResponse>>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self> {
        // no overall timeout: a radio stream never finishes
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn get(&self, url: &Url) -> BoxFuture<'static, Result<HttpResponse>> {
        let request = self.client.get(url.clone());
        async move {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(PlayerError::from))
                .boxed();
            Ok(HttpResponse {
                status,
                content_type,
                body,
            })
        }
        .boxed()
    }
}

/// Control handle for one streaming GET. Dropping it cancels the transfer.
pub struct StreamReader {
    gate: watch::Sender<Option<Epoch>>,
    cancel: CancellationToken,
}

impl StreamReader {
    /// Start the request in the background. Events are tagged with the
    /// epoch that was open when the bytes were delivered.
    pub fn open(
        transport: Arc<dyn Transport>,
        url: Url,
        read_chunk_size: usize,
        epoch: Epoch,
        events: EventSender,
    ) -> Self {
        let (gate, gate_rx) = watch::channel(Some(epoch));
        let cancel = CancellationToken::new();

        let task = ReaderTask {
            transport,
            url,
            read_chunk_size: read_chunk_size.max(1),
            gate: gate_rx,
            cancel: cancel.clone(),
            events,
        };
        tokio::spawn(task.run());

        Self { gate, cancel }
    }

    pub fn suspend(&self) {
        self.gate.send_replace(None);
    }

    pub fn resume(&self, epoch: Epoch) {
        self.gate.send_replace(Some(epoch));
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub fn is_suspended(&self) -> bool {
        self.gate.borrow().is_none()
    }
}

impl Drop for StreamReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct ReaderTask {
    transport: Arc<dyn Transport>,
    url: Url,
    read_chunk_size: usize,
    gate: watch::Receiver<Option<Epoch>>,
    cancel: CancellationToken,
    events: EventSender,
}

impl ReaderTask {
    async fn run(mut self) {
        info!("Connecting to {}", self.url);
        let response = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("Stream cancelled while connecting");
                return;
            }
            response = self.transport.get(&self.url) => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                warn!("Connection to {} failed: {}", self.url, err);
                self.send(StreamEvent::Failed(err));
                return;
            }
        };

        if !(200..300).contains(&response.status) {
            warn!("{} answered HTTP {}", self.url, response.status);
            self.send(StreamEvent::Failed(PlayerError::ConnectionFailure(format!(
                "HTTP status {}",
                response.status
            ))));
            return;
        }

        debug!(
            "Response {} with content type {:?}",
            response.status, response.content_type
        );
        self.send(StreamEvent::Opened {
            status: response.status,
            content_type: response.content_type,
        });

        let mut body = response.body;
        let mut pending: Option<Bytes> = None;
        let mut total_bytes = 0usize;

        loop {
            let Some(epoch) = self.wait_until_open().await else {
                debug!("Stream cancelled after {} KB", total_bytes / 1024);
                return;
            };

            if let Some(bytes) = pending.take() {
                total_bytes += bytes.len();
                self.deliver(epoch, bytes);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                changed = self.gate.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                item = body.next() => match item {
                    Some(Ok(bytes)) => pending = Some(bytes),
                    Some(Err(err)) => {
                        warn!("Stream read failed: {}", err);
                        self.send(StreamEvent::Failed(err));
                        return;
                    }
                    None => {
                        info!("Server closed the stream after {} KB", total_bytes / 1024);
                        self.send(StreamEvent::Finished);
                        return;
                    }
                },
            }
        }
    }

    /// Block while suspended. `None` once cancelled.
    async fn wait_until_open(&mut self) -> Option<Epoch> {
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Some(epoch) = *self.gate.borrow_and_update() {
                return Some(epoch);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = self.gate.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    fn deliver(&self, epoch: Epoch, mut bytes: Bytes) {
        while !bytes.is_empty() {
            let n = bytes.len().min(self.read_chunk_size);
            let chunk = bytes.split_to(n);
            self.send_tagged(epoch, StreamEvent::Chunk(chunk));
        }
    }

    fn send(&self, event: StreamEvent) {
        let epoch = (*self.gate.borrow()).unwrap_or(Epoch::FIRST);
        self.send_tagged(epoch, event);
    }

    fn send_tagged(&self, epoch: Epoch, event: StreamEvent) {
        if self.events.send(SessionEvent::Stream { epoch, event }).is_err() {
            self.cancel.cancel();
        }
    }
}
