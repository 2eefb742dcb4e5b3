use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use prexd::config::Config;
use prexd::master::Master;
use prexd::shutdown::install_shutdown_handler;
use prexd::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "prexd")]
#[command(about = "Distributed script execution: master scheduler and sandboxed workers")]
struct Cli {
    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand, Debug)]
enum Role {
    /// Run the master: job admission, scheduling and dispatch
    Master(NodeArgs),
    /// Run a worker: sandboxed script execution
    Worker(NodeArgs),
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Thread pool size
    #[arg(long = "num_thread", default_value_t = 8)]
    num_thread: usize,

    /// Executable working directory (config file, driver scripts)
    #[arg(long = "exe_dir", default_value = ".")]
    exe_dir: PathBuf,

    /// Run as a daemon
    #[arg(short = 'd')]
    daemon: bool,

    /// Start as a specific non-root user
    #[arg(short = 'u', value_name = "UID")]
    uid: Option<u32>,

    /// Create process for each request
    #[arg(short = 'f')]
    fork_per_request: bool,
}

impl Role {
    fn args(&self) -> &NodeArgs {
        match self {
            Role::Master(args) | Role::Worker(args) => args,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let args = cli.role.args();

    if args.daemon {
        if let Err(error) = nix::unistd::daemon(true, false) {
            tracing::error!(%error, "daemonize failed");
            return ExitCode::FAILURE;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.num_thread.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "runtime init failed");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> prexd::error::Result<()> {
    let shutdown = install_shutdown_handler();

    match cli.role {
        Role::Master(args) => {
            let config = Config::load(&args.exe_dir)?;
            let master = Master::new(config, args.exe_dir)?;
            if let Some(uid) = args.uid {
                prexd::shutdown::impersonate(uid)?;
            }
            master.run(shutdown).await
        }
        Role::Worker(args) => {
            let config = Config::load(&args.exe_dir)?;
            let worker = Worker::new(
                config,
                args.exe_dir,
                args.num_thread,
                args.uid,
                args.fork_per_request,
            );
            worker.run(shutdown).await
        }
    }
}
