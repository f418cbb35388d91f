use crate::error::{Error, InferConfig, KubeConfig, Transport};
use snafu::ResultExt;
use std::path::PathBuf;

/// Get a `kube::Client` from the given kubeconfig file, or the inferred default.
/// The default honours `KUBECONFIG`, then `~/.kube/config`, then the in-cluster environment.
pub async fn client_from_kubeconfig(
    kube_config_path: Option<PathBuf>,
) -> Result<kube::Client, Error> {
    let config = match kube_config_path {
        Some(config_path) => {
            let path = config_path.display().to_string();
            let kube_config =
                kube::config::Kubeconfig::read_from(&config_path).context(KubeConfig {
                    path: path.clone(),
                })?;
            // NOTE: Kubeconfig file may hold multiple contexts to communicate
            //       with different kubernetes clusters. We only use the current-context.
            kube::Config::from_custom_kubeconfig(kube_config, &Default::default())
                .await
                .context(KubeConfig { path })?
        }
        None => kube::Config::infer().await.context(InferConfig)?,
    };
    tracing::debug!(cluster = %config.cluster_url, "loaded cluster configuration");

    kube::Client::try_from(config).context(Transport {
        action: "create the kubernetes client",
    })
}
