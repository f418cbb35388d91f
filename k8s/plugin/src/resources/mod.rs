use anyhow::Context;
use kube_forward::{
    client_from_kubeconfig, connect, follow_logs, AdaptiveOptions, AmbiguityPolicy,
    ConnectOptions, Lifecycle, LogOptions, SelectionQuery, SessionContext, Stopped, WorkloadKind,
};
use shutdown::{IntTermEvent, ShutdownEvent, StopSignal};
use std::path::PathBuf;

/// The types of operations that are supported.
#[derive(clap::Subcommand, Debug)]
pub(crate) enum Operations {
    /// Forward a local port to a pod of the workload and follow its logs, until interrupted.
    Connect(ConnectArgs),
    /// Print the logs of a pod of the workload.
    Logs(LogsArgs),
}

/// Selects the workload, and one of its pods.
#[derive(clap::Args, Debug)]
pub(crate) struct SelectionArgs {
    /// Name of the workload.
    name: Option<String>,

    /// Label selector of the workloads, eg: app=demo.
    #[clap(long, short = 'l')]
    selector: Option<String>,

    /// Field selector of the workloads, eg: metadata.name=demo.
    #[clap(long)]
    field_selector: Option<String>,

    /// Kind of the workload, viz deployment, statefulset, daemonset, pod.
    #[clap(long, default_value = WorkloadKind::Deployment.as_ref())]
    kind: WorkloadKind,

    /// How long to wait for a pod of the workload to be running.
    #[clap(long, default_value = utils::DEFAULT_POD_RUNNING_TIMEOUT)]
    pod_running_timeout: humantime::Duration,
}
impl SelectionArgs {
    fn query(&self) -> Result<SelectionQuery, kube_forward::Error> {
        SelectionQuery::new(
            self.name.clone(),
            self.selector.clone(),
            self.field_selector.clone(),
        )
    }
}

/// Arguments of the connect operation.
#[derive(clap::Args, Debug)]
pub(crate) struct ConnectArgs {
    #[clap(flatten)]
    selection: SelectionArgs,

    /// Local port to listen on, a free one is picked when not specified.
    #[clap(long, short = 'p', default_value = "")]
    local_port: String,

    /// Port of the pod to forward to.
    #[clap(long, default_value_t = utils::DEFAULT_REMOTE_PORT)]
    remote_port: u16,

    /// Keep re-selecting the pod new connections are forwarded to.
    #[clap(long)]
    adaptive: bool,

    /// Local port of the adaptive proxy's admin server, a free one is picked when not specified.
    #[clap(long, requires = "adaptive")]
    admin_port: Option<String>,

    /// How often the adaptive proxy re-selects its pod.
    #[clap(long, default_value = utils::DEFAULT_REFRESH_INTERVAL)]
    refresh_interval: humantime::Duration,

    /// How long the session may take to wind down after being interrupted.
    #[clap(long, default_value = utils::DEFAULT_GRACE_PERIOD)]
    grace_period: humantime::Duration,

    /// Fail rather than use the first workload when the selectors match more than one.
    #[clap(long)]
    reject_ambiguous: bool,
}

/// Arguments of the logs operation.
#[derive(clap::Args, Debug)]
pub(crate) struct LogsArgs {
    #[clap(flatten)]
    selection: SelectionArgs,

    /// Keep streaming new logs until interrupted.
    #[clap(long, short = 'f')]
    follow: bool,

    /// Number of recent lines to print, all of them when negative.
    #[clap(long, default_value_t = -1, allow_negative_numbers = true)]
    tail: i64,

    /// Timestamp every line.
    #[clap(long)]
    timestamps: bool,

    /// Prefix every line with its pod and container.
    #[clap(long)]
    prefix: bool,
}

impl ConnectArgs {
    fn options(&self) -> anyhow::Result<ConnectOptions> {
        let adaptive = self.adaptive.then(|| AdaptiveOptions {
            admin_port: self.admin_port.clone().unwrap_or_default(),
            refresh_interval: *self.refresh_interval,
        });
        Ok(ConnectOptions {
            query: self.selection.query()?,
            local_port: self.local_port.clone(),
            remote_port: self.remote_port,
            resolution_timeout: *self.selection.pod_running_timeout,
            logs: LogOptions::follow(),
            adaptive,
        })
    }
    fn policy(&self) -> AmbiguityPolicy {
        match self.reject_ambiguous {
            true => AmbiguityPolicy::Reject,
            false => AmbiguityPolicy::FirstMatch,
        }
    }
}

impl LogsArgs {
    fn options(&self) -> LogOptions {
        LogOptions {
            follow: self.follow,
            prefix: self.prefix,
            tail_lines: (self.tail >= 0).then_some(self.tail),
            timestamps: self.timestamps,
        }
    }
}

impl Operations {
    /// Execute the operation against the cluster of the given kubeconfig.
    pub(crate) async fn execute(
        self,
        kube_config_path: Option<PathBuf>,
        namespace: &str,
    ) -> anyhow::Result<()> {
        match self {
            Operations::Connect(args) => {
                // malformed arguments are rejected before touching the cluster
                let options = args.options()?;
                let client = client_from_kubeconfig(kube_config_path).await?;
                let ctx = SessionContext::kube(client, args.selection.kind, namespace)
                    .with_policy(args.policy());

                let interrupts =
                    IntTermEvent::new().context("Failed to register the signal handlers")?;
                let lifecycle = Lifecycle::new(interrupts, *args.grace_period);
                match connect(&ctx, options, lifecycle).await? {
                    // tasks may still be running, don't wait for them
                    Stopped::Forced => std::process::exit(0),
                    stopped => tracing::debug!(?stopped, "session stopped"),
                }
            }
            Operations::Logs(args) => {
                let query = args.selection.query()?;
                let client = client_from_kubeconfig(kube_config_path).await?;
                let ctx = SessionContext::kube(client, args.selection.kind, namespace);

                let stop = StopSignal::new();
                let mut interrupts =
                    IntTermEvent::new().context("Failed to register the signal handlers")?;
                let interrupted = stop.clone();
                tokio::spawn(async move {
                    if interrupts.wait().await.is_some() {
                        interrupted.stop();
                    }
                });

                let mut stdout = tokio::io::stdout();
                follow_logs(
                    &ctx,
                    &query,
                    *args.selection.pod_running_timeout,
                    args.options(),
                    &mut stdout,
                    &stop,
                )
                .await?;
            }
        }
        Ok(())
    }
}
