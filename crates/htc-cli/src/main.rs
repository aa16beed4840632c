//! HAProxy Template Controller entry point
//!
//! Subcommands: `run` (the controller), `validate` (offline phases 1–3
//! over a config file), `version`. Exit codes: 0 ok, 1 fatal init error,
//! 2 validation failure.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use htc_crd::ResourceDirs;
use htc_observability::{init_logging, LoggingConfig};
use htc_operator::{Controller, ControllerSettings};
use htc_validate::Validator;
use tracing::error;

#[derive(Parser)]
#[command(
    name = "haproxy-template-controller",
    version,
    about = "Kubernetes controller that renders HAProxy configuration from templates and converges pods over the Dataplane API"
)]
struct Cli {
    /// Path to a kubeconfig file (in-cluster config when unset)
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Namespace the controller operates in
    #[arg(long, env = "HTC_NAMESPACE", default_value = "default", global = true)]
    namespace: String,

    /// Name of the HAProxyTemplateConfig to drive
    #[arg(long, env = "HTC_CONFIG_NAME", default_value = "haproxy-template-config", global = true)]
    config_name: String,

    /// Prometheus metrics port
    #[arg(long, env = "HTC_METRICS_PORT", default_value_t = 9090, global = true)]
    metrics_port: u16,

    /// Health and readiness port
    #[arg(long, env = "HTC_HEALTHZ_PORT", default_value_t = 8080, global = true)]
    healthz_port: u16,

    /// Debug endpoints port (disabled when unset)
    #[arg(long, env = "HTC_DEBUG_PORT", global = true)]
    debug_port: Option<u16>,

    /// Enable lease-based leader election
    #[arg(long, env = "HTC_LEADER_ELECT", default_value_t = true, global = true)]
    leader_elect: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HTC_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit JSON-formatted logs
    #[arg(long, env = "HTC_LOG_JSON", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller
    Run,
    /// Validate a configuration file offline (syntax, schema, semantic)
    Validate {
        /// Path to the HAProxy configuration file
        file: PathBuf,
    },
    /// Print the CRD manifests for cluster installation
    Crds,
    /// Print the version
    Version,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&LoggingConfig { level: cli.log_level.clone(), json_format: cli.log_json });

    if let Some(kubeconfig) = &cli.kubeconfig {
        std::env::set_var("KUBECONFIG", kubeconfig);
    }

    match cli.command {
        Command::Run => {
            let settings = ControllerSettings {
                namespace: cli.namespace,
                config_name: cli.config_name,
                metrics_port: cli.metrics_port,
                healthz_port: cli.healthz_port,
                debug_port: cli.debug_port,
                debug_token: std::env::var("HTC_DEBUG_TOKEN").ok(),
                leader_elect: cli.leader_elect,
                ..ControllerSettings::default()
            };
            match Controller::new(settings).run().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("controller failed: {e}");
                    ExitCode::from(1)
                }
            }
        }
        Command::Validate { file } => validate_file(&file).await,
        Command::Crds => print_crds(),
        Command::Version => {
            println!("haproxy-template-controller {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}

fn print_crds() -> ExitCode {
    use htc_crd::{HAProxyCfg, HAProxyMapFile, HAProxyTemplateConfig};
    use kube::CustomResourceExt;

    let crds =
        [HAProxyTemplateConfig::crd(), HAProxyCfg::crd(), HAProxyMapFile::crd()];
    for crd in crds {
        match serde_yaml::to_string(&crd) {
            Ok(yaml) => {
                println!("---");
                print!("{yaml}");
            }
            Err(e) => {
                eprintln!("cannot serialize CRD: {e}");
                return ExitCode::from(1);
            }
        }
    }
    ExitCode::SUCCESS
}

async fn validate_file(file: &PathBuf) -> ExitCode {
    let content = match tokio::fs::read_to_string(file).await {
        Ok(content) => content,
        Err(e) => {
            eprintln!("cannot read {}: {e}", file.display());
            return ExitCode::from(1);
        }
    };
    let validator = Validator {
        haproxy_bin: "haproxy".to_string(),
        sandbox_root: std::env::temp_dir().join("haproxy-template-controller-validate"),
    };
    match validator.validate_offline(content, &ResourceDirs::default()).await {
        Ok(_) => {
            println!("{}: configuration is valid", file.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}: {e}", file.display());
            ExitCode::from(2)
        }
    }
}
