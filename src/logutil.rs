//! Helpers that keep log lines single-line and avoid writing full phone numbers at debug
//! level. Device tool output and message bodies often contain newlines.

use std::fmt::Write;

/// Log target for one-line send outcomes, routed to `[logging].events_file`.
pub const EVENTS_TARGET: &str = "sms_events";

/// Longest preview of free text written into a log line.
const MAX_PREVIEW: usize = 160;

/// Escape a string for single-line logging (`\n`, `\r`, `\t`, backslash and other
/// control characters), truncating long text with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Keep the last four digits of a number, replacing the rest with `*`.
pub fn mask_number(number: &str) -> String {
    let visible = 4;
    let len = number.chars().count();
    if len <= visible {
        return number.to_string();
    }
    number
        .chars()
        .enumerate()
        .map(|(i, c)| if i < len - visible { '*' } else { c })
        .collect()
}
