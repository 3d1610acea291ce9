pub mod commands;

use crate::metrics::TOP_PATHS_INTERVAL;
use crate::parser::LogFormat;
use crate::rotate::DEFAULT_MAX_SIZE_MB;
use crate::source::kubernetes::SYNC_INTERVAL;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "traefik-officer")]
#[command(author = "mithucste30")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Per-Ingress latency and error metrics from Traefik access logs", long_about = None)]
pub struct Cli {
    #[arg(long, global = true, help = "Enable debug logging")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Process access logs and serve metrics")]
    Run(Box<RunArgs>),
    #[command(about = "Print the UrlPerformance CustomResourceDefinition as YAML")]
    Crd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SourceKind {
    File,
    Kubernetes,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[arg(long, value_enum, default_value_t = SourceKind::File, help = "Where to read access logs from")]
    pub log_source: SourceKind,

    #[arg(long, default_value = "./accessLog.txt", help = "Traefik access log file (file source)")]
    pub log_file: PathBuf,

    #[arg(
        long,
        default_value_t = DEFAULT_MAX_SIZE_MB,
        allow_negative_numbers = true,
        help = "Megabytes the access log may grow to before rotating (file source)"
    )]
    pub max_accesslog_size: i64,

    #[arg(long, default_value = "ingress-controller", help = "Namespace of the Traefik pods")]
    pub namespace: String,

    #[arg(long, default_value = "traefik", help = "Traefik container name")]
    pub container_name: String,

    #[arg(long, default_value = "app.kubernetes.io/name=traefik", help = "Label selector of the Traefik pods")]
    pub pod_label_selector: String,

    #[arg(long, help = "Path to a kubeconfig file; in-cluster config is used when unset")]
    pub kubeconfig: Option<PathBuf>,

    #[arg(long, help = "Kubeconfig context to use")]
    pub kube_context: Option<String>,

    #[arg(long, help = "Parse Traefik JSON access logs instead of the common log format")]
    pub json_logs: bool,

    #[arg(long, default_value_t = 8080, help = "Port for /metrics and /health")]
    pub listen_port: u16,

    #[arg(long, help = "Take per-target rules from UrlPerformance resources")]
    pub operator_mode: bool,

    #[arg(long, help = "Only the Lease holder writes UrlPerformance status")]
    pub leader_elect: bool,

    #[arg(long, help = "Namespace of the leader election Lease; defaults to POD_NAMESPACE or the client namespace")]
    pub lease_namespace: Option<String>,

    #[arg(long, help = "Legacy JSON or YAML rules file, used without --operator-mode")]
    pub config_file: Option<PathBuf>,

    #[arg(long, default_value_t = SYNC_INTERVAL.as_secs(), help = "Seconds between Traefik pod discoveries")]
    pub pod_sync_interval: u64,

    #[arg(long, default_value_t = TOP_PATHS_INTERVAL.as_secs(), help = "Seconds between top-N recomputations")]
    pub top_paths_interval: u64,
}

impl RunArgs {
    pub fn log_format(&self) -> LogFormat {
        if self.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Common
        }
    }

    /// A Kubernetes client is needed for pod logs or for the operator
    pub fn needs_kubernetes(&self) -> bool {
        self.log_source == SourceKind::Kubernetes || self.operator_mode
    }
}
