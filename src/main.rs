//! Binary entrypoint for the smsfleet CLI.
//!
//! Commands:
//! - `init` - write a default `config.toml`
//! - `scan [--release-busy]` - detect modems and check their health
//! - `select <paths..> | --clear` - persist the modem selection
//! - `activate [paths..]` / `release [paths..]` - AT activation, free busy ports
//! - `send` - import recipients, dispatch, retry failures
//! - `resend` - resend from history
//! - `history` - list, export or summarize history
//! - `serve` - run the read-only history API
//! - `watch` - keep rescan/keepalive tickers running until Ctrl-C
//! - `status` - configuration and pool summary
//!
//! See the library crate docs for module-level details: `smsfleet::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use smsfleet::config::Config;
use smsfleet::dispatch::{CancelToken, RunReport};
use smsfleet::history::{export_csv, parse_since, report_by_modem, HistoryRecord};
use smsfleet::import::{parse_csv, parse_pasted, Recipient};
use smsfleet::logutil::EVENTS_TARGET;
use smsfleet::pool::Modem;
use smsfleet::session::Session;

#[derive(Parser)]
#[command(name = "smsfleet")]
#[command(about = "Round-robin SMS dispatch across a pool of USB modems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Detect modems and check their health
    Scan {
        /// Terminate processes holding busy ports and retry
        #[arg(long)]
        release_busy: bool,
    },
    /// Persist the modem selection used by send/resend
    Select {
        /// Device paths (e.g. /dev/ttyUSB0)
        paths: Vec<String>,
        /// Clear the selection (all healthy modems are used)
        #[arg(long, conflicts_with = "paths")]
        clear: bool,
    },
    /// Send the activation AT commands
    Activate {
        /// Device paths (default: selected modems)
        paths: Vec<String>,
    },
    /// Terminate processes holding the serial ports
    Release {
        /// Device paths (default: selected modems)
        paths: Vec<String>,
    },
    /// Import recipients and dispatch a message
    Send {
        /// Recipient CSV (phone and name columns by header, else column 1 phone, column 2 name)
        #[arg(long, conflicts_with = "numbers")]
        csv: Option<String>,
        /// Free-text list of numbers
        #[arg(long)]
        numbers: Option<String>,
        /// Message template; <NAME> is replaced per recipient
        #[arg(short, long, conflicts_with = "message_file")]
        message: Option<String>,
        /// Read the message template from a file
        #[arg(long)]
        message_file: Option<String>,
        /// Send as flash SMS
        #[arg(long, conflicts_with = "no_flash")]
        flash: bool,
        /// Send as normal SMS even if flash is the default
        #[arg(long)]
        no_flash: bool,
        /// Automatic resend rounds for failed messages
        #[arg(long, default_value_t = 0)]
        retries: u32,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Resend messages from history
    Resend {
        /// Only records at or after this time (RFC 3339 or YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,
        /// Only the most recent N records
        #[arg(long)]
        limit: Option<usize>,
        /// Only recipients whose latest attempt failed
        #[arg(long)]
        failed_only: bool,
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },
    /// Show, export or summarize send history
    History {
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Write the records as `;`-separated CSV
        #[arg(long)]
        export: Option<String>,
        /// Per-modem sent/failed counts
        #[arg(long)]
        report: bool,
    },
    /// Run the read-only history API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Keep rescanning (and keepalive, if enabled) until Ctrl-C
    Watch,
    /// Show configuration and modem status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let mut config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);
    config.validate()?;

    match cli.command {
        // handled before the config was loaded
        Commands::Init => {}
        Commands::Scan { release_busy } => {
            if release_busy {
                config.modems.release_busy_ports = true;
            }
            let mut session = Session::with_gammu(Arc::new(config));
            let modems = session.start(false).await;
            print_modems(&modems);
            session.shutdown().await;
        }
        Commands::Select { paths, clear } => {
            config.state.selected = if clear { Vec::new() } else { paths };
            config.save(&cli.config).await?;
            if config.state.selected.is_empty() {
                println!("Selection cleared: all healthy modems will be used.");
            } else {
                println!("Selected: {}", config.state.selected.join(", "));
            }
        }
        Commands::Activate { paths } => {
            let mut session = Session::with_gammu(Arc::new(config));
            session.start(false).await;
            let targets = if paths.is_empty() { session.selected_modems() } else { paths };
            for (path, result) in session.pool().activate_selected(&targets).await {
                match result {
                    Ok(()) => println!("{path}: activated"),
                    Err(e) => println!("{path}: {e}"),
                }
            }
            session.shutdown().await;
        }
        Commands::Release { paths } => {
            let targets = if paths.is_empty() { config.state.selected.clone() } else { paths };
            if targets.is_empty() {
                return Err(anyhow!("No device paths given and no modem selected"));
            }
            let session = Session::with_gammu(Arc::new(config));
            let n = session.pool().release_conflicts(&targets).await?;
            println!("Terminated {n} process(es)");
        }
        Commands::Send {
            csv,
            numbers,
            message,
            message_file,
            flash,
            no_flash,
            retries,
            yes,
        } => {
            let template = match (message, message_file) {
                (Some(m), _) => m,
                (None, Some(path)) => tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| anyhow!("Failed to read message file {}: {}", path, e))?,
                (None, None) => return Err(anyhow!("--message or --message-file is required")),
            };
            if template.trim().is_empty() {
                return Err(anyhow!("Message is empty"));
            }
            let flash = if flash {
                true
            } else if no_flash {
                false
            } else {
                config.sms.flash
            };

            let prefix = config.sms.country_prefix.clone();
            let recipients: Vec<Recipient> = match numbers {
                Some(text) => parse_pasted(&text, &prefix),
                None => {
                    let path = csv.unwrap_or_else(|| config.state.last_csv_path.clone());
                    if path.is_empty() {
                        return Err(anyhow!("--csv or --numbers is required"));
                    }
                    let report = parse_csv(Path::new(&path), &prefix)?;
                    for err in &report.errors {
                        warn!("Row {}: {}", err.row, err.reason);
                    }
                    println!(
                        "{} recipient(s), {} invalid row(s), {} duplicate(s)",
                        report.recipients.len(),
                        report.invalid_rows,
                        report.duplicates
                    );
                    if config.state.last_csv_path != path {
                        config.state.last_csv_path = path;
                        if let Err(e) = config.save(&cli.config).await {
                            warn!("Could not remember CSV path: {}", e);
                        }
                    }
                    report.recipients
                }
            };
            if recipients.is_empty() {
                return Err(anyhow!("No valid recipients"));
            }

            let mut session = Session::with_gammu(Arc::new(config));
            session.start(false).await;
            let selected = session.selected_modems();
            let modems = session.dispatcher().usable_modems(&selected)?;
            if !yes
                && !confirm(&format!(
                    "Send to {} recipient(s) via {} modem(s)?",
                    recipients.len(),
                    modems.len()
                ))?
            {
                println!("Aborted.");
                return Ok(());
            }

            let cancel = ctrl_c_cancel();
            let mut report = session
                .dispatcher()
                .send_batch(&recipients, &modems, &template, flash, &cancel)
                .await?;
            print_report(&report);
            let mut seen: Vec<HistoryRecord> = report.records.clone();
            for round in 1..=retries {
                if report.failed == 0 || report.cancelled {
                    break;
                }
                println!("Retry round {round}");
                session.prepare_dispatch().await;
                let selected = session.selected_modems();
                report = session
                    .dispatcher()
                    .resend_failed(&seen, &selected, &cancel)
                    .await?;
                print_report(&report);
                seen.extend(report.records.iter().cloned());
            }
            session.shutdown().await;
        }
        Commands::Resend {
            since,
            limit,
            failed_only,
            yes,
        } => {
            let since = match since {
                Some(s) => Some(parse_since(&s).ok_or_else(|| anyhow!("Unrecognized time {s}"))?),
                None => None,
            };
            let mut session = Session::with_gammu(Arc::new(config));
            let records = session.history().query(since, limit).await?;
            if records.is_empty() {
                println!("No history records match.");
                return Ok(());
            }
            session.start(false).await;
            if !yes && !confirm(&format!("Resend from {} history record(s)?", records.len()))? {
                println!("Aborted.");
                return Ok(());
            }
            let selected = session.selected_modems();
            let cancel = ctrl_c_cancel();
            let report = if failed_only {
                session
                    .dispatcher()
                    .resend_failed(&records, &selected, &cancel)
                    .await?
            } else {
                session
                    .dispatcher()
                    .resend_from_history(&records, &selected, &cancel)
                    .await?
            };
            print_report(&report);
            session.shutdown().await;
        }
        Commands::History {
            since,
            limit,
            export,
            report,
        } => {
            let since = match since {
                Some(s) => Some(parse_since(&s).ok_or_else(|| anyhow!("Unrecognized time {s}"))?),
                None => None,
            };
            let session = Session::with_gammu(Arc::new(config));
            let records = session.history().query(since, limit).await?;
            if let Some(path) = export {
                tokio::fs::write(&path, export_csv(&records)?)
                    .await
                    .map_err(|e| anyhow!("Failed to write {}: {}", path, e))?;
                println!("Exported {} record(s) to {}", records.len(), path);
            } else if report {
                print_tallies(&records);
            } else {
                for r in &records {
                    println!(
                        "{} {:<6} {} {} via {} {}",
                        r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        r.status.to_string(),
                        r.phone_number,
                        r.name,
                        r.modem,
                        if r.flash { "(flash)" } else { "" }
                    );
                }
            }
        }
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.api.host.clone());
            let port = port.unwrap_or(config.api.port);
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .map_err(|e| anyhow!("Invalid bind address {}:{}: {}", host, port, e))?;
            let session = Session::with_gammu(Arc::new(config));
            smsfleet::api::serve(session.history().clone(), addr, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        }
        Commands::Watch => {
            let mut session = Session::with_gammu(Arc::new(config));
            let modems = session.start(true).await;
            print_modems(&modems);
            info!("Watching modems, Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            session.shutdown().await;
        }
        Commands::Status => {
            println!("smsfleet v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", cli.config);
            println!(
                "Country prefix: {}",
                if config.sms.country_prefix.is_empty() {
                    "(none)"
                } else {
                    config.sms.country_prefix.as_str()
                }
            );
            println!("Flash default: {}", config.sms.flash);
            let jitter = match config.dispatch.jitter_range() {
                Some((lo, hi)) => format!("{}-{}s", lo.as_secs(), hi.as_secs()),
                None => "off".to_string(),
            };
            println!(
                "Pacing: {:.1}s + jitter {}",
                config.dispatch.send_delay_seconds, jitter
            );
            println!(
                "Keepalive: {}",
                if config.keepalive.enabled {
                    format!("'{}' every {}s", config.keepalive.command, config.keepalive.interval_seconds)
                } else {
                    "off".to_string()
                }
            );
            println!("History: {}", config.storage.history_path().display());

            let mut session = Session::with_gammu(Arc::new(config));
            let modems = session.start(false).await;
            print_modems(&modems);
            let selected = session.selected_modems();
            println!("Selected: {}", if selected.is_empty() { "(none)".to_string() } else { selected.join(", ") });
            let records = session.history().query(None, None).await?;
            print_tallies(&records);
            session.shutdown().await;
        }
    }

    Ok(())
}

fn print_modems(modems: &[Modem]) {
    if modems.is_empty() {
        println!("No modems detected.");
        return;
    }
    for m in modems {
        let detail = m
            .identity
            .as_ref()
            .map(|id| {
                [id.manufacturer.as_deref(), id.model.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        println!(
            "{:<20} {:<5} {:<16} {}{}",
            m.device_path,
            m.health.to_string(),
            m.chip_number.as_deref().unwrap_or("-"),
            detail,
            m.last_error
                .as_deref()
                .map(|e| format!(" ({e})"))
                .unwrap_or_default()
        );
    }
}

fn print_report(report: &RunReport) {
    println!(
        "Run {}: {} sent, {} failed{}",
        report.run_id,
        report.sent,
        report.failed,
        if report.cancelled { ", cancelled" } else { "" }
    );
    for (idx, reason) in &report.reasons {
        if let Some(r) = report.records.get(*idx) {
            println!("  FAIL {} via {}: {}", r.phone_number, r.modem, reason);
        }
    }
}

fn print_tallies(records: &[HistoryRecord]) {
    let tallies = report_by_modem(records);
    if tallies.is_empty() {
        println!("No history in the retention window.");
    }
    for (modem, t) in tallies {
        println!("{:<20} sent {:>5}  failed {:>5}", modem, t.sent, t.failed);
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "sim"))
}

/// Token cancelled by the first Ctrl-C.
fn ctrl_c_cancel() -> CancelToken {
    let cancel = CancelToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current message");
            trigger.cancel();
        }
    });
    cancel
}

/// Timestamped env_logger output, teed to `[logging].file` (and the console when it is
/// a TTY). Records with target `sms_events` also go to `[logging].events_file`.
fn init_logging(config: &Option<Config>, verbosity: u8) {
    let mut builder = env_logger::Builder::new();
    // CLI verbosity wins over the configured level
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let open = |path: &Option<String>| {
        path.as_ref().and_then(|p| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .ok()
                .map(|f| std::sync::Arc::new(std::sync::Mutex::new(f)))
        })
    };
    let log_file = config.as_ref().and_then(|c| open(&c.logging.file));
    let events_file = config.as_ref().and_then(|c| open(&c.logging.events_file));
    // Background mode (stdout redirected): the log file is enough
    let to_console = log_file.is_none() || atty::is(atty::Stream::Stdout);

    builder.format(move |fmt, record| {
        let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("{} [{}] {}", ts, record.level(), record.args());

        if let Some(ref file) = log_file {
            if let Ok(mut guard) = file.lock() {
                let _ = writeln!(guard, "{}", line);
            }
        }
        if record.target() == EVENTS_TARGET {
            if let Some(ref file) = events_file {
                if let Ok(mut guard) = file.lock() {
                    let _ = writeln!(guard, "{} {}", ts, record.args());
                }
            }
        }
        if to_console {
            writeln!(fmt, "{}", line)
        } else {
            Ok(())
        }
    });
    let _ = builder.try_init();
}
