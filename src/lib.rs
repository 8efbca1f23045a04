//! # smsfleet - SMS dispatch over a pool of USB modems
//!
//! smsfleet sends text messages through a set of USB GSM modems, spreading recipients
//! round-robin over the healthy devices and keeping a rolling 7-day history of every
//! attempt.
//!
//! ## Features
//!
//! - **Modem pool**: device discovery by glob, identity/health checks through Gammu, AT
//!   activation and keepalive, release of ports held by other processes.
//! - **Dispatch**: deduplicated recipients, `<NAME>` substitution, jittered pacing,
//!   partial-failure handling with selective resend, cancellation.
//! - **History**: append-only JSON-lines log with lazy expiry, CSV export and per-modem
//!   reports.
//! - **Query API**: read-only `GET /history` over HTTP.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use smsfleet::config::Config;
//! use smsfleet::dispatch::CancelToken;
//! use smsfleet::import::parse_csv;
//! use smsfleet::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::load("config.toml").await?);
//!     let mut session = Session::with_gammu(config.clone());
//!     session.start(false).await;
//!
//!     let batch = parse_csv("contacts.csv".as_ref(), &config.sms.country_prefix)?;
//!     let report = session
//!         .dispatcher()
//!         .send_batch(
//!             &batch.recipients,
//!             &session.selected_modems(),
//!             "Hello <NAME>",
//!             false,
//!             &CancelToken::new(),
//!         )
//!         .await?;
//!     println!("{} sent, {} failed", report.sent, report.failed);
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`gateway`] - device access (Gammu, raw AT, mock)
//! - [`pool`] - modem discovery, health, activation, keepalive
//! - [`dispatch`] - planning, pacing, sending, resending
//! - [`history`] - persistent send history
//! - [`api`] - read-only HTTP query surface
//! - [`import`] - CSV / pasted recipient parsing
//! - [`session`] - lifecycle object tying the above together
//! - [`config`] - TOML configuration
//!
//! ```text
//! import ──► dispatch ◄── pool ◄── gateway
//!               │
//!               ▼
//!            history ──► api
//! ```

pub mod api;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod gateway;
pub mod history;
pub mod import;
pub mod logutil;
pub mod pool;
pub mod session;
