// MYCOFLOW -- REFLEXIVE QOS DAEMON
// SENSES THE EGRESS LINK, INFERS A TRAFFIC PERSONA, AND KEEPS THE CAKE
// QDISC'S BANDWIDTH AND AQM TARGET MATCHED TO IT.
//
// THIS BINARY OWNS: CLI, SIGNAL FLAGS, CONFIG BOOTSTRAP.
// EVERYTHING ELSE LIVES IN THE LIBRARY CRATE.

mod check;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use mycoflow::{config, daemon};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);

#[derive(Parser)]
#[command(name = "mycoflow")]
#[command(about = "mycoflow -- reflexive QoS controller for a single egress link")]
struct Cli {
    #[command(subcommand)]
    command: Option<SubCmd>,
}

#[derive(Subcommand)]
enum SubCmd {
    /// Run the control loop (default)
    Run(RunArgs),

    /// Check required tools and kernel support
    Check,
}

#[derive(Parser, Default)]
struct RunArgs {
    /// Config file path (default /etc/mycoflow/mycoflow.toml)
    #[arg(long)]
    config: Option<PathBuf>,
}

extern "C" fn handle_sighup(_signo: libc::c_int) {
    RELOAD.store(true, Ordering::Relaxed);
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(SubCmd::Check) => check::run_check(),
        Some(SubCmd::Run(args)) => run_daemon(args),
        None => run_daemon(RunArgs::default()),
    }
}

fn run_daemon(args: RunArgs) -> Result<()> {
    let cfg = config::load(args.config.as_deref()).context("config load failed")?;

    env_logger::Builder::new()
        .filter_level(config::level_filter(cfg.log_level))
        .init();

    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
    })
    .context("install shutdown handler")?;
    unsafe {
        // SA_RESTART: A RELOAD MUST NOT EINTR UNRELATED SYSCALLS
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handle_sighup as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(libc::SIGHUP, &sa, std::ptr::null_mut());
    }

    daemon::run(cfg, args.config, &SHUTDOWN, &RELOAD)
}
