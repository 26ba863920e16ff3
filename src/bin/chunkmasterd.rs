//! Daemon entry point and control CLI for the chunk master.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::error;

use chunkmaster::config::Config;
use chunkmaster::runtime::{self, Runtime};

#[derive(Parser, Debug)]
#[command(
    name = "chunkmasterd",
    version,
    about = "Chunk file system master server",
    disable_help_subcommand = true
)]
struct Cli {
    /// Configuration file (TOML); defaults apply when absent
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory from the configuration
    #[arg(short = 'd', long, global = true)]
    data_path: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the master in the foreground
    Run,
    /// Stop a running master (SIGTERM, wait for the lock to clear)
    Stop,
    /// Stop, then run again
    Restart,
    /// Ask a running master to reload its configuration (SIGHUP)
    Reload,
    /// Ask a running master to dump extended state (SIGUSR1)
    Info,
    /// Check whether a master is running
    Test,
    /// Stop a running master immediately (SIGKILL)
    Kill,
}

fn load_config(cli: &Cli) -> Result<Config, chunkmaster::MasterError> {
    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut cfg = Config::default();
            cfg.normalize();
            cfg
        }
    };
    if let Some(dir) = &cli.data_path {
        cfg.data_path = dir.clone();
    }
    Ok(cfg)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    chunkmaster::logging::init(&cli.log_level);
    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let ok = match cli.command {
        Command::Run => run(cfg, cli.config.clone()),
        Command::Stop => stop(&cfg, false),
        Command::Restart => stop(&cfg, false) && run(cfg, cli.config.clone()),
        Command::Reload => send_signal(&cfg, Sig::Hup),
        Command::Info => send_signal(&cfg, Sig::Usr1),
        Command::Test => test(&cfg),
        Command::Kill => stop(&cfg, true),
    };
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn run(cfg: Config, config_path: Option<PathBuf>) -> bool {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("can't start runtime: {}", e);
            return false;
        }
    };
    let result = rt.block_on(async {
        let daemon = Runtime::start(cfg, config_path).await?;
        daemon.serve().await
    });
    match result {
        Ok(()) => true,
        Err(e) => {
            error!("{}", e);
            false
        }
    }
}

enum Sig {
    Term,
    Kill,
    Hup,
    Usr1,
}

#[cfg(unix)]
fn deliver(pid: i32, sig: Sig) -> bool {
    let signum = match sig {
        Sig::Term => libc::SIGTERM,
        Sig::Kill => libc::SIGKILL,
        Sig::Hup => libc::SIGHUP,
        Sig::Usr1 => libc::SIGUSR1,
    };
    unsafe { libc::kill(pid, signum) == 0 }
}

#[cfg(not(unix))]
fn deliver(_pid: i32, _sig: Sig) -> bool {
    eprintln!("signal delivery is not supported on this platform");
    false
}

fn send_signal(cfg: &Config, sig: Sig) -> bool {
    if !runtime::lock_is_held(&cfg.data_path) {
        eprintln!("master is not running");
        return false;
    }
    let Some(pid) = runtime::read_daemon_pid(&cfg.data_path) else {
        eprintln!("can't read master pid");
        return false;
    };
    if deliver(pid, sig) {
        true
    } else {
        eprintln!("can't signal master (pid {})", pid);
        false
    }
}

fn stop(cfg: &Config, force: bool) -> bool {
    if !runtime::lock_is_held(&cfg.data_path) {
        eprintln!("master is not running");
        return true;
    }
    if !send_signal(cfg, if force { Sig::Kill } else { Sig::Term }) {
        return false;
    }
    // wait for the lock holder to go away
    let deadline = Instant::now() + Duration::from_secs(60);
    while runtime::lock_is_held(&cfg.data_path) {
        if Instant::now() > deadline {
            eprintln!("master did not stop in time");
            return false;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    println!("master stopped");
    true
}

fn test(cfg: &Config) -> bool {
    if runtime::lock_is_held(&cfg.data_path) {
        match runtime::read_daemon_pid(&cfg.data_path) {
            Some(pid) => println!("master is running (pid {})", pid),
            None => println!("master is running"),
        }
        true
    } else {
        println!("master is not running");
        false
    }
}
