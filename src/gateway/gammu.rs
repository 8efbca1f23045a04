//! Gateway backed by the `gammu` command line tool, `fuser` for port release and raw AT
//! commands over the serial line for activation.
//!
//! Each device gets its own rc file (`<work_dir>/gammurc-<section>-<hash>`, the hash
//! taken over the full device path) holding a single `[gammu]` section, so concurrent calls against different modems never share state.

use async_trait::async_trait;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::{at, section_name_for_device, DeviceGateway, Identity};
use crate::config::GatewayConfig;
use crate::errors::GatewayError;
use crate::logutil::escape_log;

/// Captured result of one external tool invocation.
#[derive(Debug, Clone)]
struct ToolOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl ToolOutput {
    /// stderr if present, stdout otherwise; single line for logs and history reasons.
    fn reason(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.is_empty() {
            format!("exit code {}", self.code.unwrap_or(-1))
        } else {
            escape_log(text)
        }
    }

    fn mentions_busy(&self) -> bool {
        let all = format!("{} {}", self.stdout, self.stderr).to_lowercase();
        all.contains("busy") || all.contains("already opened")
    }
}

pub struct GammuGateway {
    config: GatewayConfig,
}

impl GammuGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    fn rc_path(&self, device_path: &str) -> PathBuf {
        PathBuf::from(&self.config.work_dir).join(rc_file_name(device_path))
    }

    /// Write the per-device rc file and return its path.
    async fn write_rc(&self, device_path: &str) -> Result<PathBuf, GatewayError> {
        let path = self.rc_path(device_path);
        let content = format!(
            "[gammu]\ndevice = {}\nconnection = {}\n",
            device_path, self.config.connection
        );
        let io_err = |e: std::io::Error| GatewayError::Spawn {
            program: self.config.gammu_binary.clone(),
            reason: format!("cannot write {}: {}", path.display(), e),
        };
        tokio::fs::create_dir_all(&self.config.work_dir)
            .await
            .map_err(io_err)?;
        tokio::fs::write(&path, content).await.map_err(io_err)?;
        Ok(path)
    }

    async fn run_tool(
        &self,
        program: &str,
        args: &[String],
        device_path: &str,
        op: &'static str,
        limit: Duration,
    ) -> Result<ToolOutput, GatewayError> {
        debug!("{} {} ({})", op, device_path, program);
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(limit, child).await {
            Err(_) => Err(GatewayError::Timeout {
                path: device_path.to_string(),
                op,
                seconds: limit.as_secs(),
            }),
            Ok(Err(e)) => Err(GatewayError::Spawn {
                program: program.to_string(),
                reason: e.to_string(),
            }),
            Ok(Ok(out)) => Ok(ToolOutput {
                success: out.status.success(),
                code: out.status.code(),
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
            }),
        }
    }

    async fn gammu(
        &self,
        device_path: &str,
        op: &'static str,
        args: &[&str],
        limit: Duration,
    ) -> Result<ToolOutput, GatewayError> {
        let rc = self.write_rc(device_path).await?;
        let mut full = vec!["-c".to_string(), rc.to_string_lossy().into_owned()];
        full.extend(args.iter().map(|a| a.to_string()));
        self.run_tool(&self.config.gammu_binary, &full, device_path, op, limit)
            .await
    }

    async fn own_number(&self, device_path: &str) -> Option<String> {
        let limit = Duration::from_secs(self.config.identify_timeout_seconds);
        match self
            .gammu(
                device_path,
                "getmemory",
                &["getmemory", "ON", "1", "20", "-nonempty"],
                limit,
            )
            .await
        {
            Ok(out) if out.success => parse_own_number(&out.stdout),
            Ok(out) => {
                debug!("No own number on {}: {}", device_path, out.reason());
                None
            }
            Err(e) => {
                debug!("Own number lookup on {} failed: {}", device_path, e);
                None
            }
        }
    }
}

#[async_trait]
impl DeviceGateway for GammuGateway {
    async fn identify(&self, device_path: &str) -> Result<Identity, GatewayError> {
        let limit = Duration::from_secs(self.config.identify_timeout_seconds);
        let out = self
            .gammu(device_path, "identify", &["identify"], limit)
            .await?;
        if !out.success {
            if out.mentions_busy() {
                return Err(GatewayError::PortBusy(device_path.to_string()));
            }
            return Err(GatewayError::Unreachable {
                path: device_path.to_string(),
                reason: out.reason(),
            });
        }
        let mut identity = parse_identify(&out.stdout);
        identity.chip_number = self.own_number(device_path).await;
        Ok(identity)
    }

    async fn activate(
        &self,
        device_path: &str,
        commands: &[String],
        baud_rate: u32,
    ) -> Result<(), GatewayError> {
        let per_command = Duration::from_secs(self.config.command_timeout_seconds);
        let limit = per_command * (commands.len().max(1) as u32) + Duration::from_secs(1);
        let path = device_path.to_string();
        let cmds = commands.to_vec();
        let job =
            tokio::task::spawn_blocking(move || at::run_commands(&path, baud_rate, &cmds, per_command));
        match tokio::time::timeout(limit, job).await {
            Err(_) => Err(GatewayError::Timeout {
                path: device_path.to_string(),
                op: "activate",
                seconds: limit.as_secs(),
            }),
            Ok(Err(join)) => Err(GatewayError::ActivationFailed {
                path: device_path.to_string(),
                reason: format!("serial worker failed: {join}"),
            }),
            Ok(Ok(result)) => result,
        }
    }

    async fn send_text(
        &self,
        device_path: &str,
        phone_number: &str,
        message: &str,
        flash: bool,
    ) -> Result<(), GatewayError> {
        let limit = Duration::from_secs(self.config.send_timeout_seconds);
        let mut args = vec!["sendsms", "TEXT", phone_number, "-textutf8", message];
        if flash {
            args.push("-flash");
        }
        let out = self
            .gammu(device_path, "sendsms", &args, limit)
            .await
            .map_err(|e| match e {
                GatewayError::Timeout { .. } => e,
                other => GatewayError::SendFailed(other.to_string()),
            })?;
        if out.success {
            Ok(())
        } else {
            Err(GatewayError::SendFailed(out.reason()))
        }
    }

    async fn release_port(&self, device_paths: &[String]) -> Result<usize, GatewayError> {
        let limit = Duration::from_secs(self.config.command_timeout_seconds);
        let mut terminated = 0;
        for device_path in device_paths {
            let args = vec!["-k".to_string(), device_path.clone()];
            let out = self
                .run_tool(&self.config.fuser_binary, &args, device_path, "release", limit)
                .await?;
            let killed = count_pids(&out.stdout);
            terminated += killed;
            if !out.success && killed == 0 && !stderr_is_only_path(&out.stderr, device_path) {
                warn!(
                    "Port release on {} failed: {}",
                    device_path,
                    out.reason()
                );
                return Err(GatewayError::PortBusy(device_path.clone()));
            }
            debug!("Released {}: {} process(es)", device_path, killed);
        }
        Ok(terminated)
    }
}

/// `Key : value` lines from `gammu identify`.
fn parse_identify(stdout: &str) -> Identity {
    let mut identity = Identity::default();
    for line in stdout.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        if value.is_empty() {
            continue;
        }
        match key.trim().to_lowercase().as_str() {
            "manufacturer" => identity.manufacturer = Some(value),
            "model" => identity.model = Some(value),
            "imei" => identity.imei = Some(value),
            _ => {}
        }
    }
    identity
}

/// First `Number` entry of the own-numbers phonebook, digits and `+` only.
fn parse_own_number(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter(|line| line.trim_start().to_lowercase().starts_with("number"))
        .filter_map(|line| line.split_once(':').map(|(_, v)| v))
        .map(|raw| {
            raw.chars()
                .filter(|c| c.is_ascii_digit() || *c == '+')
                .collect::<String>()
        })
        .find(|v| !v.trim_matches('+').is_empty())
}

/// `fuser` prints the PIDs on stdout (one token each, possibly with access suffixes).
fn count_pids(stdout: &str) -> usize {
    stdout
        .split_whitespace()
        .filter(|tok| {
            let digits: String = tok.chars().take_while(|c| c.is_ascii_digit()).collect();
            !digits.is_empty()
        })
        .count()
}

/// `fuser` exits 1 with just `<path>:` (or nothing) on stderr when no process holds it.
fn stderr_is_only_path(stderr: &str, device_path: &str) -> bool {
    let trimmed = stderr.trim();
    trimmed.is_empty() || trimmed == format!("{device_path}:")
}

/// Same basename in two directories must not share a file.
fn rc_file_name(device_path: &str) -> String {
    let digest = Sha256::digest(device_path.as_bytes());
    let short: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("gammurc-{}-{}", section_name_for_device(device_path), short)
}
