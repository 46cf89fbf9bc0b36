//! tracklet - command-line client for the tracklet dispatch engine
//!
//! Tracks events against a collection endpoint, caching them on disk while
//! offline and flushing them later.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Settings: $XDG_DATA_HOME/tracklet/settings.db (~/.local/share/tracklet/settings.db)
//! - Offline cache: $XDG_CACHE_HOME/tracklet/events/ (~/.cache/tracklet/events/)
//! - Logs: $XDG_STATE_HOME/tracklet/tracklet.log (~/.local/state/tracklet/tracklet.log)
//! - Config: $XDG_CONFIG_HOME/tracklet/config.toml (~/.config/tracklet/config.toml)

use std::io::BufRead;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracklet_core::crash::install_panic_hook;
use tracklet_core::dispatch::{DryRunTarget, ManualConnectivity};
use tracklet_core::{Config, DispatchMode, TrackMe, Tracker, TrackerBuilder};

#[derive(Parser)]
#[command(name = "tracklet")]
#[command(about = "Track events to an analytics endpoint, caching them while offline")]
#[command(version)]
struct Args {
    /// Verbose output (-v prints tracked queries and dispatch activity, -vv traces it)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Treat the network as unreachable: events go to the offline cache
    #[arg(long, global = true)]
    offline: bool,

    /// Build packets and print them instead of sending
    #[arg(long, global = true)]
    dry_run: bool,

    /// Collection endpoint (overrides tracker.api_url)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Site id (overrides tracker.site_id)
    #[arg(long, global = true)]
    site_id: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track one event and dispatch it
    Track {
        /// Query parameter as key=value (repeatable)
        #[arg(short = 'p', long = "param", value_parser = parse_param, required = true)]
        params: Vec<(String, String)>,
    },
    /// Track one event per JSON object read from stdin
    Pipe,
    /// Send everything queued or cached
    Flush,
    /// Show configuration and offline cache state
    Status,
    /// Drop all queued and cached events
    Clear,
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {:?}", raw)),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Ensure XDG environment variables are set before using core library
    Config::ensure_xdg_env();

    let mut config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        tracklet_core::logging::init(&config.logging, args.verbose).context("failed to initialize logging")?;

    tracing::info!("tracklet starting");

    if let Some(api_url) = args.api_url.clone() {
        config.tracker.api_url = Some(api_url);
    }
    if let Some(site_id) = args.site_id {
        config.tracker.site_id = site_id;
    }
    // Only `pipe` keeps a background worker; one-shot commands flush explicitly
    if !matches!(args.command, Command::Pipe) {
        config.dispatch.interval_ms = -1;
    }

    let connectivity = Arc::new(if args.offline {
        ManualConnectivity::offline()
    } else {
        ManualConnectivity::online()
    });

    let tracker = TrackerBuilder::from_config(&config)
        .context("no collection endpoint, pass --api-url or set tracker.api_url")?
        .connectivity(connectivity)
        .build()
        .context("failed to create tracker")?;
    let tracker = Arc::new(tracker);
    install_panic_hook(tracker.clone());

    let dry_run: Option<DryRunTarget> = if args.dry_run {
        let target: DryRunTarget = Arc::new(Mutex::new(Vec::new()));
        tracker.set_dry_run_target(Some(target.clone()));
        Some(target)
    } else {
        None
    };

    match &args.command {
        Command::Track { params } => {
            let track_me: TrackMe = params.iter().cloned().collect();
            track_event(&tracker, track_me, &args);
            tracker.dispatch_blocking();
        }
        Command::Pipe => run_pipe(&tracker, &args)?,
        Command::Flush => tracker.dispatch_blocking(),
        Command::Status => print_status(&tracker),
        Command::Clear => {
            tracker.dispatcher().clear();
            println!("Cleared queued and cached events");
        }
    }

    if let Some(target) = dry_run {
        let packets = target.lock().map(|p| p.clone()).unwrap_or_default();
        for packet in packets {
            println!("{}", packet);
        }
    }

    report_pending(&tracker, &args);
    tracing::info!("tracklet finished");
    Ok(())
}

fn track_event(tracker: &Tracker, track_me: TrackMe, args: &Args) {
    tracker.track(track_me);
    if args.verbose > 0 {
        if let Some(event) = tracker.last_event() {
            eprintln!("tracked {}", event);
        }
    }
}

/// Track newline-delimited JSON objects until EOF or Ctrl+C.
fn run_pipe(tracker: &Arc<Tracker>, args: &Args) -> Result<()> {
    let handler_tracker = tracker.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, caching pending events...");
        if let Err(e) = handler_tracker.set_dispatch_mode(DispatchMode::ForceOffline) {
            tracing::warn!(error = %e, "Failed to force offline mode");
        }
        handler_tracker.dispatch_blocking();
        std::process::exit(130);
    })
    .context("failed to set Ctrl+C handler")?;

    let stdin = std::io::stdin();
    let mut tracked = 0usize;
    for (number, line) in stdin.lock().lines().enumerate() {
        let line = line.context("failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(&line) {
            Ok(track_me) => {
                track_event(tracker, track_me, args);
                tracked += 1;
            }
            Err(e) => {
                eprintln!("line {}: {}", number + 1, e);
                tracing::warn!(line = number + 1, error = %e, "Skipping invalid input line");
            }
        }
    }

    tracker.dispatch_blocking();
    println!("Tracked {} event(s)", tracked);
    Ok(())
}

/// One JSON object of scalar values into a parameter set.
fn parse_line(line: &str) -> Result<TrackMe> {
    let value: serde_json::Value = serde_json::from_str(line).context("invalid JSON")?;
    let Some(object) = value.as_object() else {
        bail!("expected a JSON object");
    };

    let mut track_me = TrackMe::new();
    for (key, value) in object {
        match value {
            serde_json::Value::String(s) => track_me.set(key.clone(), s),
            serde_json::Value::Number(n) => track_me.set(key.clone(), n),
            serde_json::Value::Bool(b) => track_me.set(key.clone(), u8::from(*b)),
            serde_json::Value::Null => continue,
            _ => bail!("value of {:?} must be a string, number or boolean", key),
        };
    }
    Ok(track_me)
}

fn print_status(tracker: &Tracker) {
    let disk = tracker.dispatcher().queue().disk();
    println!("Config: {}", Config::config_path().display());
    println!("Settings: {}", Config::settings_path().display());
    println!("Log: {}", tracklet_core::logging::log_file_path().display());
    println!("Tracker: {}", tracker.name());
    println!("API URL: {}", tracker.api_url());
    println!("Site ID: {}", tracker.site_id());
    println!(
        "Visitor ID: {}",
        tracker.visitor_id().unwrap_or_else(|| "-".to_string())
    );
    println!("Dispatch mode: {}", tracker.dispatch_mode());
    println!("Opted out: {}", if tracker.is_opt_out() { "yes" } else { "no" });
    println!(
        "Cache limits: age {}ms, size {} bytes",
        tracker.offline_cache_age_ms(),
        tracker.offline_cache_size_bytes()
    );
    println!(
        "Offline cache: {} container(s), {} bytes",
        disk.container_count(),
        disk.total_size()
    );
}

fn report_pending(tracker: &Tracker, args: &Args) {
    let disk = tracker.dispatcher().queue().disk();
    let cached = disk.container_count();
    if args.verbose > 0 && cached > 0 {
        eprintln!(
            "{} container(s) cached for later ({} bytes)",
            cached,
            disk.total_size()
        );
    }
}
