//! The `baboond` daemon executable: a long-running service, not an
//! interactive tool — no subcommands beyond `run`/`--config`.
//!
//! Grounded on the teacher's `main.rs` for CLI/logging shape and on
//! `daemon::DaemonEngine` for the actual service loop.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use baboon::config::{self, DEFAULT_STREAMER_PORT, DEFAULT_XMPP_PORT};
use baboon::daemon::DaemonEngine;
use baboon::transport::DaemonTransport;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "baboond", about = "Distributed pre-merge conflict detector (daemon)", version = VERSION)]
struct Cli {
    /// Path to config file (default ~/.baboonrc)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Log level: TRACE, DEBUG, INFO, WARNING, ERROR
    #[arg(long, default_value = "INFO")]
    log_level: String,
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

fn main() {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let path = match config::find_config_path(cli.config.as_deref()) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    let cfg = match config::load_config(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // The daemon's own JID/sid is distinct from any watcher's; it connects
    // under the service account named in `[user]`.
    let sid = format!("sid-{}", cfg.user.jid);
    let transport = match DaemonTransport::connect(
        &cfg.server.master,
        DEFAULT_XMPP_PORT,
        &cfg.user.jid,
        &cfg.user.password,
        &cfg.server.streamer,
        DEFAULT_STREAMER_PORT,
        &sid,
    ) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            eprintln!("Error: failed to connect: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = std::fs::create_dir_all(&cfg.server.working_dir) {
        eprintln!("Error: failed to create working directory {}: {e}", cfg.server.working_dir.display());
        std::process::exit(1);
    }

    let engine = Arc::new(DaemonEngine::new(&cfg, transport));

    let stanza_engine = engine.clone();
    let stanza_thread = std::thread::Builder::new()
        .name("baboond-stanza".into())
        .spawn(move || stanza_engine.run_stanza_loop())
        .expect("failed to spawn stanza thread");

    let bytestream_engine = engine.clone();
    let bytestream_thread = std::thread::Builder::new()
        .name("baboond-bytestream".into())
        .spawn(move || bytestream_engine.run_bytestream_loop())
        .expect("failed to spawn bytestream thread");

    let signal_engine = engine.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("received shutdown signal");
        signal_engine.stop();
    }) {
        eprintln!("Error: failed to install signal handler: {e}");
        std::process::exit(1);
    }

    tracing::info!("baboond started");

    let stanza_failed = stanza_thread.join().is_err();
    let bytestream_failed = bytestream_thread.join().is_err();

    if stanza_failed || bytestream_failed {
        std::process::exit(1);
    }
}
