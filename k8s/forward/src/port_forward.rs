use crate::{
    error::{Error, Stream},
    Endpoint, InstanceAccess,
};
use futures::StreamExt;
use shutdown::StopSignal;
use snafu::ResultExt;
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_stream::wrappers::TcpListenerStream;

/// A bare local port specifier.
/// Port 0 is special as it tells the kernel to give us the next free port.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct LocalPort(u16);

impl LocalPort {
    /// Let the kernel pick a free port.
    pub fn ephemeral() -> Self {
        Self(0)
    }
    /// The port number, 0 meaning ephemeral.
    pub fn number(&self) -> u16 {
        self.0
    }
    /// The loopback address to bind to.
    pub(crate) fn addr(&self) -> SocketAddr {
        SocketAddr::from((utils::LOCALHOST, self.0))
    }
    /// Bind a listener to this port.
    pub(crate) async fn bind(&self) -> Result<TcpListener, Error> {
        let addr = self.addr();
        TcpListener::bind(addr).await.context(Stream {
            action: format!("bind to local address {addr}"),
        })
    }
}

impl From<u16> for LocalPort {
    fn from(port: u16) -> Self {
        Self(port)
    }
}

impl FromStr for LocalPort {
    type Err = Error;

    /// An empty specifier is an ephemeral port; host or remote parts are rejected.
    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        if spec.contains(':') {
            return Err(Error::validation(
                "local port should not contain ':' character",
            ));
        }
        if spec.is_empty() {
            return Ok(Self::ephemeral());
        }
        spec.parse::<u16>().map(Self).map_err(|_| {
            Error::validation(format!("local port '{spec}' is not a valid port number"))
        })
    }
}

/// Forwards connections accepted on a local port to an endpoint.
/// Exactly one local listener is bound for the lifetime of `Self`.
pub struct PortForward {
    listener: TcpListener,
    endpoint: Endpoint,
    access: Arc<dyn InstanceAccess>,
}

impl PortForward {
    /// Bind the local port, without forwarding anything yet.
    /// # Arguments
    /// * `local_port` - the local port to listen on
    /// * `endpoint` - the endpoint we'll forward to
    /// * `access` - used to open the upstream streams
    pub async fn bind(
        local_port: LocalPort,
        endpoint: Endpoint,
        access: Arc<dyn InstanceAccess>,
    ) -> Result<Self, Error> {
        let listener = local_port.bind().await?;
        tracing::trace!(port = local_port.number(), "Bound to local port");
        Ok(Self {
            listener,
            endpoint,
            access,
        })
    }

    /// Parses the local port, binds it and forwards until `stop` fires.
    /// A malformed local port is rejected before any network activity.
    pub async fn open(
        local_port: &str,
        endpoint: Endpoint,
        access: Arc<dyn InstanceAccess>,
        stop: StopSignal,
    ) -> Result<(), Error> {
        let local_port = local_port.parse::<LocalPort>()?;
        Self::bind(local_port, endpoint, access).await?.run(stop).await
    }

    /// The bound local port, which is the actual port when an ephemeral one was requested.
    pub fn local_port(&self) -> Result<u16, Error> {
        let addr = self.listener.local_addr().context(Stream {
            action: "get the local listener address",
        })?;
        Ok(addr.port())
    }

    /// The endpoint we forward to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Runs the port forwarding until `stop` fires or a fatal stream error occurs.
    /// Failing to accept or to reach the endpoint is fatal, whereas a failure while
    /// copying the bytes of an established connection only ends that connection.
    /// The listener is released on return.
    pub async fn run(self, stop: StopSignal) -> Result<(), Error> {
        let (fatal_sender, mut fatal) = mpsc::unbounded_channel();
        let server = TcpListenerStream::new(self.listener).take_until(stop.wait());
        tokio::pin!(server);

        loop {
            let client_conn = tokio::select! {
                client_conn = server.next() => match client_conn {
                    Some(client_conn) => client_conn.context(Stream {
                        action: "accept a local connection",
                    })?,
                    None => break,
                },
                Some(error) = fatal.recv() => return Err(error),
            };
            if let Ok(peer_addr) = client_conn.peer_addr() {
                tracing::trace!(%peer_addr, "new connection");
            }

            let access = self.access.clone();
            let endpoint = self.endpoint.clone();
            let stop = stop.clone();
            let fatal_sender = fatal_sender.clone();
            tokio::spawn(async move {
                if let Err(error) = forward_connection(access, &endpoint, client_conn, stop).await
                {
                    tracing::error!(%endpoint, %error, "failed to forward connection");
                    // the receiver is gone once the session is over
                    fatal_sender.send(error).ok();
                }
            });
        }
        tracing::debug!(endpoint = %self.endpoint, "port forwarding stopped");
        Ok(())
    }
}

/// Forwards one local connection to the endpoint until either side closes or `stop` fires.
/// Only failing to establish the upstream stream is reported as an error.
pub(crate) async fn forward_connection(
    access: Arc<dyn InstanceAccess>,
    endpoint: &Endpoint,
    mut client_conn: tokio::net::TcpStream,
    stop: StopSignal,
) -> Result<(), Error> {
    let mut upstream_conn = access.connect(endpoint).await?;
    let pod_port = endpoint.port();
    let pod_name = endpoint.pod();

    tracing::debug!(pod_port, pod_name, "forwarding connection");

    tokio::select! {
        result = tokio::io::copy_bidirectional(&mut client_conn, &mut upstream_conn) => {
            if let Err(error) = result {
                tracing::trace!(pod_port, pod_name, ?error, "connection error");
            }
        }
        _ = stop.wait() => {
            tracing::trace!(pod_port, pod_name, "connection closed by the stop signal");
        }
    }

    drop(upstream_conn);
    tracing::debug!(pod_port, pod_name, "connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn local_port_parsing() {
        assert_eq!("8081".parse::<LocalPort>().unwrap().number(), 8081);
        assert_eq!(" ".parse::<LocalPort>().unwrap(), LocalPort::ephemeral());

        for malformed in ["8081:80", ":8081", "localhost:8081", "http", "70000", "-1"] {
            let error = malformed.parse::<LocalPort>().unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Validation, "{malformed}");
        }
        let error = "127.0.0.1:8081".parse::<LocalPort>().unwrap_err();
        assert!(error.to_string().contains("':'"));
    }
}
