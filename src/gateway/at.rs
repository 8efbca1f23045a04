//! Raw AT command exchange over a serial line.
//!
//! Used for activation sequences and keepalives, which Gammu does not expose. Each command
//! is written with a trailing `\r`, then the port is read until a final result code
//! (`OK`, `ERROR`, `+CME ERROR: ..`, `+CMS ERROR: ..`) or the per-command deadline.

use crate::errors::GatewayError;
#[cfg(feature = "serial")]
use log::{debug, trace};
use std::time::Duration;

/// Final result of one AT command, as far as the response text shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtResponse {
    Ok,
    Error(String),
}

/// Look for a final result code in accumulated response text.
/// Returns `None` while the modem has not answered yet.
pub fn classify_response(text: &str) -> Option<AtResponse> {
    for line in text.lines().map(str::trim) {
        if line == "OK" {
            return Some(AtResponse::Ok);
        }
        if line == "ERROR"
            || line.starts_with("+CME ERROR")
            || line.starts_with("+CMS ERROR")
            || line == "NO CARRIER"
        {
            return Some(AtResponse::Error(line.to_string()));
        }
    }
    None
}

fn open_error(device_path: &str, reason: String) -> GatewayError {
    let lower = reason.to_lowercase();
    if lower.contains("busy") || lower.contains("locked") {
        GatewayError::PortBusy(device_path.to_string())
    } else {
        GatewayError::Unreachable {
            path: device_path.to_string(),
            reason,
        }
    }
}

/// Send `commands` in order and wait for each final result code. Blocking; run it on
/// `spawn_blocking`.
#[cfg(feature = "serial")]
pub fn run_commands(
    device_path: &str,
    baud_rate: u32,
    commands: &[String],
    per_command: Duration,
) -> Result<(), GatewayError> {
    use std::io::{Read, Write};
    use std::time::Instant;

    let mut builder = serialport::new(device_path, baud_rate).timeout(Duration::from_millis(200));
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| open_error(device_path, e.to_string()))?;
    let _ = port.write_data_terminal_ready(true);
    let _ = port.clear(serialport::ClearBuffer::All);

    for command in commands {
        let command = command.trim();
        if command.is_empty() {
            continue;
        }
        debug!("AT {} -> {}", device_path, command);
        port.write_all(format!("{command}\r").as_bytes())
            .and_then(|_| port.flush())
            .map_err(|e| GatewayError::ActivationFailed {
                path: device_path.to_string(),
                reason: format!("write {command}: {e}"),
            })?;

        let deadline = Instant::now() + per_command;
        let mut response = String::new();
        let mut buf = [0u8; 256];
        let outcome = loop {
            if let Some(outcome) = classify_response(&response) {
                break outcome;
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::Timeout {
                    path: device_path.to_string(),
                    op: "at-command",
                    seconds: per_command.as_secs().max(1),
                });
            }
            match port.read(&mut buf) {
                Ok(0) => continue,
                Ok(n) => response.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    return Err(GatewayError::Unreachable {
                        path: device_path.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        };
        trace!(
            "AT {} <- {}",
            device_path,
            crate::logutil::escape_log(&response)
        );
        if let AtResponse::Error(code) = outcome {
            return Err(GatewayError::ActivationFailed {
                path: device_path.to_string(),
                reason: format!("{command}: {code}"),
            });
        }
    }
    Ok(())
}

#[cfg(not(feature = "serial"))]
pub fn run_commands(
    device_path: &str,
    _baud_rate: u32,
    _commands: &[String],
    _per_command: Duration,
) -> Result<(), GatewayError> {
    log::warn!("Serial support not compiled in, cannot send AT commands");
    let _ = open_error;
    Err(GatewayError::ActivationFailed {
        path: device_path.to_string(),
        reason: "serial support not compiled in".to_string(),
    })
}
