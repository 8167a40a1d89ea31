use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "inferportd", version, about = "Local/offload image classification daemon")]
pub struct Cli {
    /// Log filter (RUST_LOG syntax)
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags that take precedence over the configuration file.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Directory holding the model files
    #[arg(long, global = true)]
    pub model_dir: Option<PathBuf>,

    /// Label list, one label per line
    #[arg(long, global = true)]
    pub labels: Option<PathBuf>,

    /// Initial model (mv3 or eff0)
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Default strategy (cpu, gpu, nnapi)
    #[arg(long, global = true)]
    pub delegate: Option<String>,

    /// MQTT broker host
    #[arg(long, global = true)]
    pub broker_host: Option<String>,

    /// MQTT broker port
    #[arg(long, global = true)]
    pub broker_port: Option<u16>,

    /// Offload timeout in milliseconds (capped at 60000)
    #[arg(long, global = true)]
    pub timeout_ms: Option<u64>,

    /// Serve offload requests in-process instead of over MQTT
    #[arg(long, global = true)]
    pub loopback: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the HTTP control surface
    Serve {
        /// Bind address for HTTP
        #[arg(long)]
        http_addr: Option<String>,
    },

    /// Run a fixed schedule of tasks and exit
    Run {
        /// Task as mode[:model], e.g. cpu:mv3 or offload:eff0; repeatable
        #[arg(long = "task", required = true)]
        tasks: Vec<String>,

        /// Image used for every task
        #[arg(long, conflicts_with = "image_dir")]
        image: Option<PathBuf>,

        /// Directory with test<n>.jpg for task n
        #[arg(long, default_value = "images")]
        image_dir: PathBuf,

        /// Results per task
        #[arg(long)]
        top_k: Option<usize>,

        /// Submit all tasks at once instead of one after another
        #[arg(long)]
        concurrent: bool,
    },
}
