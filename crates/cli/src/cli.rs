use std::path::PathBuf;

use clap::{Parser, Subcommand};

fn default_parallel() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Parser)]
#[command(name = "renderfarm", version, about = "Distributed render-farm job coordinator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a worker pool against jobs loaded from (and saved to) a queue file.
    Local(LocalArgs),
    /// Run the HTTP control plane that slaves register with and poll for work.
    Master(MasterArgs),
    /// Run a worker pool that leases jobs from a master over HTTP.
    Slave(SlaveArgs),
}

#[derive(Debug, Parser)]
pub struct LocalArgs {
    /// Path to the external render tool binary.
    #[arg(long, env = "RENDERFARM_RENDER_TOOL")]
    pub render_tool: PathBuf,

    /// Number of jobs to render concurrently.
    #[arg(
        short = 'p',
        long,
        env = "RENDERFARM_PARALLEL",
        default_value_t = default_parallel()
    )]
    pub parallel: usize,

    /// Queue document to load on startup and save to on exit.
    #[arg(long, env = "RENDERFARM_QUEUE_FILE")]
    pub queue_file: Option<PathBuf>,

    /// Project files to enqueue on startup. If another `local` instance
    /// is already running, these are forwarded to it over the
    /// single-instance IPC channel instead, and this process exits.
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Parser)]
pub struct MasterArgs {
    /// Port the HTTP control plane listens on.
    #[arg(long, env = "RENDERFARM_PORT", default_value_t = 5580)]
    pub port: u16,
}

#[derive(Debug, Parser)]
pub struct SlaveArgs {
    /// Path to the external render tool binary.
    #[arg(long, env = "RENDERFARM_RENDER_TOOL")]
    pub render_tool: PathBuf,

    /// Hostname or IP of the master to register with.
    #[arg(long, env = "RENDERFARM_MASTER_HOST", default_value = "localhost")]
    pub master_host: String,

    /// Port the master's HTTP control plane listens on.
    #[arg(long, env = "RENDERFARM_MASTER_PORT", default_value_t = 5580)]
    pub master_port: u16,

    /// Port this slave registers itself under (a registry key only;
    /// this process does not listen on it).
    #[arg(long, env = "RENDERFARM_SLAVE_PORT")]
    pub slave_port: u16,

    /// Number of jobs to render concurrently.
    #[arg(
        short = 'p',
        long,
        env = "RENDERFARM_PARALLEL",
        default_value_t = default_parallel()
    )]
    pub parallel: usize,
}
