use crate::{
    error::{Error, RemoteStream, Transport},
    vx::Pod,
    Endpoint, LogOptions,
};
use async_trait::async_trait;
use futures::{stream::BoxStream, AsyncBufRead, AsyncBufReadExt, StreamExt};
use hyper::body::Bytes;
use kube::api::{Api, LogParams};
use snafu::ResultExt;
use std::{
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A bidirectional byte stream to an instance's port.
pub trait Upstream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Upstream for T {}

/// A boxed `Upstream`.
pub type BoxUpstream = Box<dyn Upstream>;

/// A stream of output chunks from an instance.
pub type LogStream = BoxStream<'static, Result<Bytes, Error>>;

/// Capability to reach a resolved instance: its ports and its output.
#[async_trait]
pub trait InstanceAccess: Send + Sync {
    /// Opens a byte stream to the endpoint's remote port.
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxUpstream, Error>;
    /// Opens the output stream of the endpoint's container.
    async fn logs(&self, endpoint: &Endpoint, options: &LogOptions) -> Result<LogStream, Error>;
}

/// `InstanceAccess` through the kube-apiserver port forwarding and log subresources.
#[derive(Clone)]
pub struct KubeAccess {
    client: kube::Client,
}

impl KubeAccess {
    /// Returns a new `Self` using the provided `kube::Client`.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
    fn pod_api(&self, endpoint: &Endpoint) -> Api<Pod> {
        Api::namespaced(self.client.clone(), endpoint.namespace())
    }
}

#[async_trait]
impl InstanceAccess for KubeAccess {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxUpstream, Error> {
        let pod_port = endpoint.port();
        let mut forwarder = self
            .pod_api(endpoint)
            .portforward(endpoint.pod(), &[pod_port])
            .await
            .context(RemoteStream {
                action: format!("port-forward to {endpoint}"),
            })?;

        let stream = forwarder.take_stream(pod_port).ok_or_else(|| {
            Error::not_found(format!("port {pod_port} not found in the forwarder of {endpoint}"))
        })?;

        tracing::debug!(pod_port, pod_name = endpoint.pod(), "upstream connected");
        Ok(Box::new(Forwarded {
            stream,
            forwarder: Some(forwarder),
            endpoint: endpoint.to_string(),
        }))
    }

    async fn logs(&self, endpoint: &Endpoint, options: &LogOptions) -> Result<LogStream, Error> {
        let params = LogParams {
            container: endpoint.container().map(ToOwned::to_owned),
            follow: options.follow,
            tail_lines: options.tail_lines,
            timestamps: options.timestamps,
            ..Default::default()
        };
        let reader = self
            .pod_api(endpoint)
            .log_stream(endpoint.pod(), &params)
            .await
            .context(Transport {
                action: format!("stream the logs of {endpoint}"),
            })?;

        Ok(read_chunks(reader, format!("read the logs of {endpoint}")))
    }
}

/// Turns a buffered reader into a `LogStream` of whatever chunks it buffers.
/// The stream ends on EOF, or right after yielding the first read error.
pub(crate) fn read_chunks<R>(reader: R, action: String) -> LogStream
where
    R: AsyncBufRead + Send + 'static,
{
    futures::stream::unfold(Some(Box::pin(reader)), move |reader| {
        let action = action.clone();
        async move {
            let mut reader = reader?;
            let chunk = match reader.fill_buf().await {
                Ok(chunk) => Bytes::copy_from_slice(chunk),
                Err(source) => return Some((Err(Error::Stream { action, source }), None)),
            };
            if chunk.is_empty() {
                return None;
            }
            reader.consume_unpin(chunk.len());
            Some((Ok(chunk), Some(reader)))
        }
    })
    .boxed()
}

/// A port-forwarded stream which keeps its forwarder alive for as long as the stream.
struct Forwarded<S> {
    stream: S,
    forwarder: Option<kube::api::Portforwarder>,
    endpoint: String,
}

impl<S> Drop for Forwarded<S> {
    fn drop(&mut self) {
        let Some(forwarder) = self.forwarder.take() else {
            return;
        };
        let endpoint = std::mem::take(&mut self.endpoint);
        // the forwarder task only completes once our side of the stream has been dropped
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(error) = forwarder.join().await {
                    tracing::trace!(%endpoint, %error, "port forwarder error");
                }
            });
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Forwarded<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Forwarded<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }
    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
