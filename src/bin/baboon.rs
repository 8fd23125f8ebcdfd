//! The `baboon` watcher executable: `start` runs the steady-state sync
//! loop, `init` performs first-time project setup.
//!
//! Grounded on the teacher's `main.rs` for CLI shape (derive `Parser` +
//! `Subcommand`, `setup_logging` from a level string, `std::process::exit`
//! on fatal error) and on section 6's command surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use baboon::config::{self, DEFAULT_STREAMER_PORT, DEFAULT_XMPP_PORT};
use baboon::index::Index;
use baboon::transport::WatcherTransport;
use baboon::watcher::WatcherEngine;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "baboon", about = "Distributed pre-merge conflict detector (watcher)", version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file (default ~/.baboonrc)
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Log level: TRACE, DEBUG, INFO, WARNING, ERROR
    #[arg(long, global = true, default_value = "INFO")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Begin the watcher loop against every enabled project
    Start,
    /// First-time initialisation of a project: clone into the daemon's
    /// mirror and create the local index
    Init {
        /// Project name, matching a section already present in the config
        project: String,
        /// VCS URL the daemon should clone
        vcs_url: String,
    },
}

fn setup_logging(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let level = match log_level.to_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    };

    let filter = EnvFilter::try_new(format!("baboon={level}")).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn load_config(explicit: Option<&PathBuf>) -> config::Configuration {
    let path = match config::find_config_path(explicit.map(|p| p.as_path())) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    match config::load_config(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    }
}

fn connect_transport(cfg: &config::Configuration) -> WatcherTransport {
    match WatcherTransport::connect(
        &cfg.server.master,
        DEFAULT_XMPP_PORT,
        &cfg.user.jid,
        &cfg.user.password,
        &cfg.server.streamer,
        DEFAULT_STREAMER_PORT,
    ) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("Error: failed to connect: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_start(cfg: config::Configuration) {
    let transport = Arc::new(connect_transport(&cfg));
    if !transport.wait_connected(std::time::Duration::from_secs(10)) {
        eprintln!("Error: authentication failed");
        std::process::exit(1);
    }

    let mut engine = match WatcherEngine::new(cfg, transport) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.start() {
        tracing::error!(error = %e, "watcher stopped with an error");
        std::process::exit(1);
    }
}

fn cmd_init(cfg: config::Configuration, project: &str, vcs_url: &str) {
    let Some(project_cfg) = cfg.project(project) else {
        eprintln!("Error: project '{project}' is not present in the config file");
        std::process::exit(1);
    };
    let local_path = project_cfg.local_path.clone();

    let transport = connect_transport(&cfg);
    if !transport.wait_connected(std::time::Duration::from_secs(10)) {
        eprintln!("Error: authentication failed");
        std::process::exit(1);
    }

    if let Err(e) = transport.send_git_init(project, vcs_url) {
        eprintln!("Error: failed to send git-init: {e}");
        std::process::exit(1);
    }

    if let Err(e) = Index::init(&local_path) {
        eprintln!("Error: failed to create local index: {e}");
        std::process::exit(1);
    }

    println!("Requested git-init for '{project}'; local index created at {}", local_path.display());
    transport.close();
}

fn main() {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);
    let cfg = load_config(cli.config.as_ref());

    match cli.command {
        Commands::Start => cmd_start(cfg),
        Commands::Init { project, vcs_url } => cmd_init(cfg, &project, &vcs_url),
    }
}
