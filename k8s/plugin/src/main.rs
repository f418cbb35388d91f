use clap::Parser;
use std::{io::IsTerminal, path::PathBuf};
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

mod resources;
use resources::Operations;

#[derive(clap::Parser, Debug)]
#[clap(name = "kubectl-connect", about = utils::package_description!(), version)]
struct CliArgs {
    /// Path to kubeconfig file.
    #[clap(global = true, long, short = 'k')]
    kube_config_path: Option<PathBuf>,

    /// Kubernetes namespace of the workload.
    #[clap(global = true, long, short = 'n', default_value = utils::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Format of the diagnostic traces, viz compact, pretty, json.
    /// Filter the traces with the RUST_LOG environment variable.
    #[clap(global = true, long, default_value = FmtStyle::Compact.as_ref())]
    log_format: FmtStyle,

    /// The operation to be performed.
    #[clap(subcommand)]
    operations: Operations,
}
impl CliArgs {
    fn args() -> Self {
        CliArgs::parse()
    }
}

#[tokio::main]
async fn main() {
    let cli_args = CliArgs::args();
    TracingTelemetry::builder()
        .with_writer(FmtLayer::Stderr)
        .with_style(cli_args.log_format)
        .with_colours(std::io::stderr().is_terminal())
        .init();

    let result = cli_args
        .operations
        .execute(cli_args.kube_config_path, &cli_args.namespace)
        .await;
    if let Err(error) = result {
        eprintln!("Error: {error:#}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn global_args() {
        let args = CliArgs::try_parse_from(["kubectl-connect", "connect", "demo"]).unwrap();
        assert_eq!(args.namespace, "default");
        assert_eq!(args.log_format, FmtStyle::Compact);
        assert!(args.kube_config_path.is_none());

        let args = CliArgs::try_parse_from([
            "kubectl-connect",
            "logs",
            "demo",
            "-n",
            "apps",
            "--log-format",
            "json",
            "-k",
            "/tmp/kubeconfig",
        ])
        .unwrap();
        assert_eq!(args.namespace, "apps");
        assert_eq!(args.log_format, FmtStyle::Json);
        assert_eq!(args.kube_config_path, Some(PathBuf::from("/tmp/kubeconfig")));
    }
}
