use crate::{
    error::{Admin, Error, Stream},
    port_forward::forward_connection,
    Endpoint, InstanceAccess, Instance, LocalPort, Resolver, SelectionQuery,
};
use arc_swap::ArcSwapOption;
use futures::StreamExt;
use hyper::{
    header::CONTENT_TYPE,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, StatusCode,
};
use shutdown::StopSignal;
use snafu::ResultExt;
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;

/// The backend currently selected by the proxy, swapped atomically as a whole.
type Backend = Arc<ArcSwapOption<Endpoint>>;

/// Shortest period between two backend re-evaluations.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(1);

/// Configuration of the `AdaptiveProxy`.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    query: SelectionQuery,
    remote_port: u16,
    refresh_interval: Duration,
}
impl ProxyConfig {
    /// Returns a new `Self` from the given parameters.
    /// # Arguments
    /// * `query` - re-evaluated on every refresh
    /// * `remote_port` - the port to reach within the selected pod
    /// * `refresh_interval` - how often the backend is re-evaluated
    pub fn new(query: SelectionQuery, remote_port: u16, refresh_interval: Duration) -> Self {
        Self {
            query,
            remote_port,
            refresh_interval,
        }
    }
}

/// A reverse proxy which keeps re-resolving its backend.
///
/// Every new connection is forwarded to whichever pod is selected when it is accepted;
/// established connections keep their pod when the selection changes.
/// # Example
/// ```ignore
/// let proxy = kube_forward::AdaptiveProxy::new(resolver, access, config);
/// let handle = proxy.start(LocalPort::from(8081), LocalPort::ephemeral(), stop).await?;
/// tracing::info!(admin_port = handle.admin_port(), "proxy started");
/// handle.join().await?;
/// ```
pub struct AdaptiveProxy {
    resolver: Resolver,
    access: Arc<dyn InstanceAccess>,
    config: ProxyConfig,
    backend: Backend,
}

/// Handle over a started `AdaptiveProxy`.
pub struct ProxyHandle {
    local_port: u16,
    admin_port: u16,
    backend: Backend,
    task: JoinHandle<Result<(), Error>>,
}

impl ProxyHandle {
    /// The bound forwarding port.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }
    /// The bound administrative port.
    pub fn admin_port(&self) -> u16 {
        self.admin_port
    }
    /// The currently selected backend, if any.
    pub fn backend(&self) -> Option<Arc<Endpoint>> {
        self.backend.load_full()
    }
    /// Wait for the proxy to stop, which happens once the stop signal has fired.
    pub async fn join(self) -> Result<(), Error> {
        self.task.await.map_err(|source| Error::Task { source })?
    }
}

impl AdaptiveProxy {
    /// Return a new `Self` with no backend selected yet.
    pub fn new(resolver: Resolver, access: Arc<dyn InstanceAccess>, config: ProxyConfig) -> Self {
        Self {
            resolver,
            access,
            config,
            backend: Backend::default(),
        }
    }

    /// Binds the forwarding and administrative ports and launches the proxy in the
    /// background, returning without waiting for a backend to be selected.
    pub async fn start(
        self,
        local_port: LocalPort,
        admin_port: LocalPort,
        stop: StopSignal,
    ) -> Result<ProxyHandle, Error> {
        let listener = local_port.bind().await?;
        let admin = admin_port.bind().await?;
        let local_port = Self::port_of(&listener)?;
        let admin_port = Self::port_of(&admin)?;
        tracing::info!(local_port, admin_port, "adaptive proxy bound");

        let backend = self.backend.clone();
        let task = tokio::spawn(Arc::new(self).run(listener, admin, stop));
        Ok(ProxyHandle {
            local_port,
            admin_port,
            backend,
            task,
        })
    }

    fn port_of(listener: &TcpListener) -> Result<u16, Error> {
        let addr = listener.local_addr().context(Stream {
            action: "get the local listener address",
        })?;
        Ok(addr.port())
    }

    async fn run(
        self: Arc<Self>,
        listener: TcpListener,
        admin: TcpListener,
        stop: StopSignal,
    ) -> Result<(), Error> {
        let (accepted, served, ()) = tokio::join!(
            self.clone().accept(listener, stop.clone()),
            serve_admin(admin, self.backend.clone(), stop.clone()),
            self.clone().refresh_until(stop.clone()),
        );
        tracing::debug!("adaptive proxy stopped");
        accepted.and(served)
    }

    /// Re-evaluates the backend every refresh interval until `stop` fires.
    async fn refresh_until(self: Arc<Self>, stop: StopSignal) {
        let period = self.config.refresh_interval.max(MIN_REFRESH_INTERVAL);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let stopped = stop.wait();
        tokio::pin!(stopped);
        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = interval.tick() => {
                    self.refresh().await;
                }
            }
        }
    }

    /// Re-evaluates the query and swaps the backend when the selection changes.
    /// Resolution failures are logged and leave the current backend in place.
    pub(crate) async fn refresh(&self) -> Option<Arc<Endpoint>> {
        let current = self.backend.load_full();
        let instances = match self.attachable().await {
            Ok(instances) => instances,
            Err(error) => {
                tracing::warn!(%error, "failed to re-evaluate the backend");
                return current;
            }
        };

        match select_backend(current.as_deref(), instances) {
            Selection::Switch(instance) => {
                let endpoint = Arc::new(Endpoint::new(instance, self.config.remote_port));
                tracing::info!(%endpoint, previous = ?current.as_deref().map(ToString::to_string), "backend selected");
                self.backend.store(Some(endpoint.clone()));
                Some(endpoint)
            }
            Selection::Keep => current,
            Selection::Unavailable => {
                tracing::warn!(
                    current = ?current.as_deref().map(ToString::to_string),
                    "no attachable pod to select as backend"
                );
                current
            }
        }
    }

    async fn attachable(&self) -> Result<Vec<Instance>, Error> {
        let candidate = self.resolver.candidate(&self.config.query).await?;
        self.resolver.source().attachable_instances(&candidate).await
    }

    /// Accepts connections until `stop` fires, each one using the backend of the moment.
    async fn accept(self: Arc<Self>, listener: TcpListener, stop: StopSignal) -> Result<(), Error> {
        let server = TcpListenerStream::new(listener).take_until(stop.wait());
        tokio::pin!(server);
        while let Some(client_conn) = server.next().await {
            let client_conn = client_conn.context(Stream {
                action: "accept a proxy connection",
            })?;
            let Some(endpoint) = self.backend.load_full() else {
                tracing::warn!("no backend selected yet, closing connection");
                continue;
            };

            let access = self.access.clone();
            let stop = stop.clone();
            tokio::spawn(async move {
                if let Err(error) = forward_connection(access, &endpoint, client_conn, stop).await {
                    tracing::warn!(%endpoint, %error, "failed to proxy connection");
                }
            });
        }
        Ok(())
    }
}

/// Outcome of a backend re-evaluation.
#[derive(Debug, PartialEq)]
enum Selection {
    /// The current backend is still attachable.
    Keep,
    /// A different pod should become the backend.
    Switch(Instance),
    /// No pod is attachable; the current backend, if any, stays in place.
    Unavailable,
}

/// Keeps the current backend while it is still attachable, otherwise picks the best one.
fn select_backend(current: Option<&Endpoint>, instances: Vec<Instance>) -> Selection {
    if let Some(current) = current {
        if instances.iter().any(|instance| current.is_instance(instance)) {
            return Selection::Keep;
        }
    }
    match instances.into_iter().next() {
        Some(instance) => Selection::Switch(instance),
        None => Selection::Unavailable,
    }
}

/// Serves the health and introspection endpoints until `stop` fires.
async fn serve_admin(listener: TcpListener, backend: Backend, stop: StopSignal) -> Result<(), Error> {
    let listener = listener.into_std().context(Stream {
        action: "configure the admin listener",
    })?;
    let make_service = make_service_fn(move |_conn| {
        let backend = backend.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |request: Request<Body>| {
                let backend = backend.load_full();
                async move { Ok::<_, Infallible>(admin_response(&request, backend.as_deref())) }
            }))
        }
    });

    hyper::Server::from_tcp(listener)
        .context(Admin)?
        .serve(make_service)
        .with_graceful_shutdown(stop.wait())
        .await
        .context(Admin)
}

fn admin_response(request: &Request<Body>, backend: Option<&Endpoint>) -> Response<Body> {
    match (request.method(), request.uri().path(), backend) {
        (&Method::GET, "/healthz", Some(_)) => respond(StatusCode::OK, "ok"),
        (&Method::GET, "/healthz", None) => {
            respond(StatusCode::SERVICE_UNAVAILABLE, "no backend selected")
        }
        (&Method::GET, "/backend", Some(endpoint)) => match serde_json::to_string(endpoint) {
            Ok(json) => {
                let mut response = respond(StatusCode::OK, json);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
                response
            }
            Err(error) => respond(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        },
        (&Method::GET, "/backend", None) => respond(StatusCode::NOT_FOUND, "no backend selected"),
        _ => respond(StatusCode::NOT_FOUND, "not found"),
    }
}

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str) -> Instance {
        Instance::new("default", name, None)
    }

    #[test]
    fn sticky_backend() {
        let current = Endpoint::new(instance("b"), 80);
        assert_eq!(
            select_backend(Some(&current), vec![instance("a"), instance("b")]),
            Selection::Keep
        );
        assert_eq!(
            select_backend(Some(&current), vec![instance("a"), instance("c")]),
            Selection::Switch(instance("a"))
        );
        assert_eq!(
            select_backend(None, vec![instance("c")]),
            Selection::Switch(instance("c"))
        );
    }

    #[test]
    fn no_attachable_pod() {
        let current = Endpoint::new(instance("b"), 80);
        assert_eq!(select_backend(Some(&current), vec![]), Selection::Unavailable);
        assert_eq!(select_backend(None, vec![]), Selection::Unavailable);
    }

    #[tokio::test]
    async fn admin_routes() {
        let get = |path: &str| {
            Request::builder()
                .method(Method::GET)
                .uri(path)
                .body(Body::empty())
                .unwrap()
        };
        let endpoint = Endpoint::new(instance("demo-1"), 80);

        let response = admin_response(&get("/healthz"), None);
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = admin_response(&get("/healthz"), Some(&endpoint));
        assert_eq!(response.status(), StatusCode::OK);

        let response = admin_response(&get("/backend"), Some(&endpoint));
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "namespace": "default", "pod": "demo-1", "port": 80 })
        );

        let response = admin_response(&get("/metrics"), Some(&endpoint));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
