use crate::{
    error::{Error, Stream},
    Endpoint, InstanceAccess,
};
use futures::StreamExt;
use shutdown::StopSignal;
use snafu::ResultExt;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Options for the output stream of an instance.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogOptions {
    /// Keep streaming new output until cancelled.
    pub follow: bool,
    /// Prefix each line with its source pod and container.
    pub prefix: bool,
    /// Only show this many lines of existing output.
    pub tail_lines: Option<i64>,
    /// Ask the server to timestamp every line.
    pub timestamps: bool,
}
impl LogOptions {
    /// Options used alongside a tunnel: follow new output only.
    pub fn follow() -> Self {
        Self {
            follow: true,
            prefix: false,
            tail_lines: None,
            timestamps: false,
        }
    }
    /// Options used for a one-off dump: the whole existing output, as kubectl shows it.
    pub fn dump() -> Self {
        Self {
            follow: false,
            prefix: false,
            tail_lines: None,
            timestamps: false,
        }
    }
}

/// Inserts the source prefix at the start of every line, across chunk boundaries.
struct LinePrefixer {
    prefix: Vec<u8>,
    line_start: bool,
}
impl LinePrefixer {
    fn new(prefix: String) -> Self {
        Self {
            prefix: prefix.into_bytes(),
            line_start: true,
        }
    }
    fn apply(&mut self, chunk: &[u8]) -> Vec<u8> {
        let mut output = Vec::with_capacity(chunk.len() + self.prefix.len());
        for byte in chunk {
            if self.line_start {
                output.extend_from_slice(&self.prefix);
            }
            output.push(*byte);
            self.line_start = *byte == b'\n';
        }
        output
    }
}

/// Streams the output of an endpoint.
#[derive(Clone)]
pub struct LogFollower {
    access: Arc<dyn InstanceAccess>,
    options: LogOptions,
}

impl LogFollower {
    /// Returns a new `Self` from the given parameters.
    pub fn new(access: Arc<dyn InstanceAccess>, options: LogOptions) -> Self {
        Self { access, options }
    }

    /// Copies the endpoint's output into `writer` until the stream ends or `stop` fires.
    pub async fn follow<W: AsyncWrite + Unpin + Send>(
        &self,
        endpoint: &Endpoint,
        writer: &mut W,
        stop: &StopSignal,
    ) -> Result<(), Error> {
        let mut stream = self.access.logs(endpoint, &self.options).await?;
        let mut prefixer = self
            .options
            .prefix
            .then(|| LinePrefixer::new(endpoint.log_prefix()));
        let stopped = stop.wait();
        tokio::pin!(stopped);

        loop {
            let chunk = tokio::select! {
                _ = &mut stopped => break,
                chunk = stream.next() => match chunk {
                    Some(chunk) => chunk?,
                    None => break,
                },
            };
            let chunk = match prefixer.as_mut() {
                Some(prefixer) => prefixer.apply(&chunk),
                None => chunk.to_vec(),
            };
            writer.write_all(&chunk).await.context(Stream {
                action: "write the logs",
            })?;
            writer.flush().await.context(Stream {
                action: "flush the logs",
            })?;
        }
        tracing::debug!(%endpoint, "log stream finished");
        Ok(())
    }

    /// Like `follow` but a failure is only logged: it never ends the session.
    pub async fn run<W: AsyncWrite + Unpin + Send>(
        self,
        endpoint: Endpoint,
        mut writer: W,
        stop: StopSignal,
    ) {
        if let Err(error) = self.follow(&endpoint, &mut writer, &stop).await {
            tracing::warn!(%endpoint, %error, "stopped following the logs");
        }
    }
}
