use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use datapool_core::{DataPool, PoolConfig};
use ndarray::Array2;
use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BLOCK_NAME: &str = "m";

#[derive(Parser)]
#[command(name = "datapool_demo")]
#[command(about = "Two processes sharing one array through the data pool")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct PoolArgs {
    /// Config file (TOML or YAML); searched in the default locations if omitted
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Directory holding the shared segments
    #[arg(short = 'd', long = "base-dir")]
    base_dir: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(short = 't', long = "timeout", default_value = "30")]
    timeout_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and publish "m" (2x2 int32 zeros), then wait until m[0,0] changes
    Owner(PoolArgs),

    /// Discover "m" through the registry and write 1 at (0,0)
    Watcher(PoolArgs),

    /// Spawn an owner and a watcher as child processes
    Run(PoolArgs),
}

impl PoolArgs {
    fn load_config(&self) -> Result<PoolConfig> {
        let mut config = match &self.config {
            Some(path) => PoolConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => PoolConfig::find_and_load()?,
        };
        if let Some(dir) = &self.base_dir {
            config.base_dir = Some(dir.clone());
        }
        Ok(config)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["--timeout".to_string(), self.timeout_secs.to_string()];
        if let Some(path) = &self.config {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        if let Some(dir) = &self.base_dir {
            args.push("--base-dir".to_string());
            args.push(dir.display().to_string());
        }
        args
    }
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Owner(args) => run_owner(&args, install_ctrlc()?),
        Commands::Watcher(args) => run_watcher(&args, install_ctrlc()?),
        Commands::Run(args) => run_both(&args),
    }
}

fn install_ctrlc() -> Result<Arc<AtomicBool>> {
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Ctrl+C received, shutting down");
        flag.store(false, Ordering::SeqCst);
    })
    .context("installing Ctrl+C handler")?;
    Ok(running)
}

fn run_owner(args: &PoolArgs, running: Arc<AtomicBool>) -> Result<()> {
    let config = args.load_config()?;
    let poll = config.poll_interval();
    let pool = DataPool::open(config)?;

    let block = pool
        .create_array(BLOCK_NAME, &Array2::<i32>::zeros((2, 2)), false)
        .with_context(|| format!("creating '{}' (stale segment from an earlier run?)", BLOCK_NAME))?;
    pool.publish(&block)?;
    tracing::info!("Published {}", block.encode());

    let deadline = Instant::now() + args.timeout();
    let mut observed = 0;
    while running.load(Ordering::SeqCst) && Instant::now() < deadline {
        observed = block.get::<i32>(&[0, 0])?;
        tracing::info!("m[0,0] = {}", observed);
        if observed != 0 {
            break;
        }
        thread::sleep(poll);
    }

    pool.shutdown()?;
    if observed == 0 {
        bail!("m[0,0] was never written");
    }
    Ok(())
}

fn run_watcher(args: &PoolArgs, running: Arc<AtomicBool>) -> Result<()> {
    let config = args.load_config()?;
    let poll = config.poll_interval();
    let pool = DataPool::open(config)?;
    pool.start_subscriber()?;

    let deadline = Instant::now() + args.timeout();
    let block = loop {
        if !running.load(Ordering::SeqCst) || Instant::now() >= deadline {
            pool.shutdown()?;
            bail!("'{}' was not published in time", BLOCK_NAME);
        }
        if let Ok(block) = pool.get_block(BLOCK_NAME) {
            break block;
        }
        thread::sleep(poll / 4);
    };

    tracing::info!(
        "Found '{}' ({}, owner pid {}), writing m[0,0] = 1",
        block.name(),
        block.element_type(),
        block.owner_pid()
    );
    block.set::<i32>(&[0, 0], 1)?;

    drop(block);
    pool.shutdown()?;
    Ok(())
}

fn run_both(args: &PoolArgs) -> Result<()> {
    let exe = std::env::current_exe().context("locating own executable")?;
    let extra = args.to_cli_args();

    let mut owner = Command::new(&exe)
        .arg("owner")
        .args(&extra)
        .spawn()
        .context("spawning owner")?;
    // let the owner publish before the watcher looks
    thread::sleep(Duration::from_millis(500));
    let mut watcher = Command::new(&exe)
        .arg("watcher")
        .args(&extra)
        .spawn()
        .context("spawning watcher")?;

    let watcher_status = watcher.wait()?;
    let owner_status = owner.wait()?;
    tracing::info!("watcher: {}, owner: {}", watcher_status, owner_status);

    if !watcher_status.success() || !owner_status.success() {
        bail!("demo failed");
    }
    Ok(())
}
