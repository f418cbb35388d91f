use crate::{
    AdaptiveProxy, AmbiguityPolicy, Error, InstanceAccess, KubeAccess, KubeWorkloads, Lifecycle,
    LocalPort, LogFollower, LogOptions, PortForward, ProxyConfig, Resolver, SelectionQuery,
    Stopped, WorkloadKind, WorkloadSource,
};
use shutdown::{ShutdownEvent, StopSignal};
use std::{io::Write, sync::Arc, time::Duration};
use tokio::io::AsyncWrite;

/// The capabilities a session runs with.
#[derive(Clone)]
pub struct SessionContext {
    workloads: Arc<dyn WorkloadSource>,
    access: Arc<dyn InstanceAccess>,
    policy: AmbiguityPolicy,
}

impl SessionContext {
    /// Returns a new `Self` from the given capabilities.
    pub fn new(workloads: Arc<dyn WorkloadSource>, access: Arc<dyn InstanceAccess>) -> Self {
        Self {
            workloads,
            access,
            policy: AmbiguityPolicy::default(),
        }
    }
    /// Returns a new `Self` backed by the kubernetes cluster of the given client.
    pub fn kube(client: kube::Client, kind: WorkloadKind, namespace: &str) -> Self {
        Self::new(
            Arc::new(KubeWorkloads::new(client.clone(), kind, namespace)),
            Arc::new(KubeAccess::new(client)),
        )
    }
    /// Modify and return `Self` with the given ambiguity policy.
    pub fn with_policy(mut self, policy: AmbiguityPolicy) -> Self {
        self.policy = policy;
        self
    }
    /// A resolver over this context's workloads.
    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.workloads.clone()).with_policy(self.policy)
    }
    /// The instance access capability.
    pub fn access(&self) -> &Arc<dyn InstanceAccess> {
        &self.access
    }
}

/// Options of the adaptive proxy variant of a session.
#[derive(Debug, Clone)]
pub struct AdaptiveOptions {
    /// The administrative port, empty for an ephemeral one.
    pub admin_port: String,
    /// How often the backend is re-evaluated.
    pub refresh_interval: Duration,
}

/// Options of a connect session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Selects the workload to connect to.
    pub query: SelectionQuery,
    /// The local port, empty for an ephemeral one.
    pub local_port: String,
    /// The port to reach within the pod.
    pub remote_port: u16,
    /// How long to wait for an attachable pod.
    pub resolution_timeout: Duration,
    /// How the pod's output is followed.
    pub logs: LogOptions,
    /// Run the adaptive proxy instead of pinning one pod.
    pub adaptive: Option<AdaptiveOptions>,
}

/// Runs a connect session until it is stopped.
///
/// The target is resolved first; the tunnel and the log follower are then launched and
/// supervised by the `lifecycle`. Nothing is launched if resolution or binding fails, or
/// if an interrupt arrives while resolving.
pub async fn connect<E: ShutdownEvent, W: Write>(
    ctx: &SessionContext,
    options: ConnectOptions,
    mut lifecycle: Lifecycle<E, W>,
) -> Result<Stopped, Error> {
    let local_port = options.local_port.parse::<LocalPort>()?;
    if let Some(adaptive) = &options.adaptive {
        return connect_adaptive(ctx, &options, adaptive, local_port, lifecycle).await;
    }

    let resolver = ctx.resolver();
    let resolving = resolver.resolve(
        &options.query,
        options.remote_port,
        options.resolution_timeout,
    );
    let Some(resolved) = lifecycle.starting(resolving).await else {
        tracing::info!("interrupted while resolving the target");
        return Ok(Stopped::Interrupted);
    };
    let endpoint = resolved?;
    println!("connecting to pod {}/{}", endpoint.namespace(), endpoint.pod());

    let tunnel = PortForward::bind(local_port, endpoint.clone(), ctx.access.clone()).await?;
    println!(
        "Forwarding from 127.0.0.1:{} -> {}",
        tunnel.local_port()?,
        endpoint.port()
    );

    let stop = lifecycle.stop_signal();
    lifecycle.launch("tunnel", tunnel.run(stop.clone()));

    let follower = LogFollower::new(ctx.access.clone(), options.logs);
    lifecycle.launch("logs", async move {
        follower.run(endpoint, tokio::io::stdout(), stop).await;
        Ok(())
    });

    lifecycle.supervise().await
}

async fn connect_adaptive<E: ShutdownEvent, W: Write>(
    ctx: &SessionContext,
    options: &ConnectOptions,
    adaptive: &AdaptiveOptions,
    local_port: LocalPort,
    mut lifecycle: Lifecycle<E, W>,
) -> Result<Stopped, Error> {
    let admin_port = adaptive.admin_port.parse::<LocalPort>()?;
    let config = ProxyConfig::new(
        options.query.clone(),
        options.remote_port,
        adaptive.refresh_interval,
    );
    let proxy = AdaptiveProxy::new(ctx.resolver(), ctx.access.clone(), config);

    let handle = proxy
        .start(local_port, admin_port, lifecycle.stop_signal())
        .await?;
    println!(
        "Forwarding from 127.0.0.1:{} -> {}",
        handle.local_port(),
        options.remote_port
    );
    println!("Admin server listening on 127.0.0.1:{}", handle.admin_port());

    lifecycle.launch("proxy", handle.join());
    lifecycle.supervise().await
}

/// Resolves the query and copies the selected pod's output into `writer`.
/// Without `follow` this returns once the existing output is written.
/// Returns early, without error, if `stop` fires while resolving.
pub async fn follow_logs<W: AsyncWrite + Unpin + Send>(
    ctx: &SessionContext,
    query: &SelectionQuery,
    timeout: Duration,
    options: LogOptions,
    writer: &mut W,
    stop: &StopSignal,
) -> Result<(), Error> {
    let resolver = ctx.resolver();
    let endpoint = tokio::select! {
        biased;
        _ = stop.wait() => {
            tracing::info!("stopped while resolving the target");
            return Ok(());
        }
        resolved = resolver.resolve(query, 0, timeout) => resolved?,
    };
    LogFollower::new(ctx.access.clone(), options)
        .follow(&endpoint, writer, stop)
        .await
}
