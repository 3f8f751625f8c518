use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Sandbox launcher for agent runtimes.
#[derive(Parser, Debug)]
#[command(name = "vibebox", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the project sandbox (downloads the VM image).
    Init(InitArgs),
    /// Start an interactive sandbox shell.
    Up(UpArgs),
    /// Probe backend availability and provider selection.
    Probe(ProbeArgs),
    /// Execute one command non-interactively.
    Exec(ExecArgs),
    /// Manage official VM images.
    Images(ImagesArgs),
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Project root (defaults to the current directory).
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Official image id (defaults to the first image for the host arch).
    #[arg(long)]
    pub image_id: Option<String>,
    /// Provider: off|apple-vm|docker|auto.
    #[arg(long, default_value = "auto")]
    pub provider: String,
    /// VM CPU count.
    #[arg(long, default_value_t = 2)]
    pub cpus: u32,
    /// VM memory in MiB.
    #[arg(long, default_value_t = 2048)]
    pub ram_mb: u64,
    /// VM disk in GiB.
    #[arg(long, default_value_t = 20)]
    pub disk_gb: u32,
    /// Host script executed once when creating the instance disk.
    #[arg(long)]
    pub provision_script: Option<String>,
}

#[derive(Args, Debug)]
pub struct UpArgs {
    /// Project root (defaults to the current directory).
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Override provider: off|apple-vm|docker|auto.
    #[arg(long)]
    pub provider: Option<String>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Provider: off|apple-vm|docker|auto.
    #[arg(long, default_value = "auto")]
    pub provider: String,
    /// Project root path (optional).
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Output machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Provider: off|apple-vm|docker|auto.
    #[arg(long, default_value = "auto")]
    pub provider: String,
    /// Project root path (optional).
    #[arg(long)]
    pub project_root: Option<PathBuf>,
    /// Command to execute (required).
    #[arg(long)]
    pub command: String,
    /// Working directory inside the sandbox.
    #[arg(long, default_value = "")]
    pub cwd: String,
    /// Timeout in seconds (0 = backend default).
    #[arg(long, default_value_t = 0)]
    pub timeout_seconds: u64,
    /// Environment variable KEY=VALUE (repeatable).
    #[arg(long = "env")]
    pub env: Vec<String>,
    /// Output machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ImagesArgs {
    #[command(subcommand)]
    pub command: ImagesCommands,
}

#[derive(Subcommand, Debug)]
pub enum ImagesCommands {
    /// List official VM images for the host architecture.
    List,
    /// Refresh/download an image into the cache.
    Upgrade {
        /// Image id to refresh (defaults to the first for the host arch).
        #[arg(long)]
        image_id: Option<String>,
    },
}
