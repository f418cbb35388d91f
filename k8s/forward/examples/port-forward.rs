use kube_forward::{KubeAccess, KubeWorkloads, LocalPort, PortForward, Resolver, SelectionQuery};
use shutdown::StopSignal;
use std::{sync::Arc, time::Duration};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt().init();

    let client = kube_forward::client_from_kubeconfig(None).await?;
    let workloads = KubeWorkloads::new(client.clone(), Default::default(), "default");
    let query = SelectionQuery::by_label("app", "demo")?;
    let endpoint = Resolver::new(Arc::new(workloads))
        .resolve(&query, 80, Duration::from_secs(30))
        .await?;

    let access = Arc::new(KubeAccess::new(client));
    let pf = PortForward::bind(LocalPort::from(8081), endpoint, access).await?;
    tracing::info!(port = pf.local_port()?, endpoint = %pf.endpoint(), "forwarding");

    let stop = StopSignal::new();
    let interrupted = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        interrupted.stop();
    });
    pf.run(stop).await?;

    Ok(())
}
