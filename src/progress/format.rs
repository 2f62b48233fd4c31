//! Width-aware string handling and humanised units for the renderer.

use std::time::Duration;

use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

pub const ERASE_LINE: &str = "\x1b[2K";
pub const MOVE_UP: &str = "\x1b[1A";
pub const MOVE_TO_START: &str = "\r";

/// Humanise a byte count into SI units, returning the number and the
/// suffix separately so adjacent counts can share one suffix.
pub fn humanize_bytes(s: f64) -> (String, String) {
    const SIZES: [&str; 7] = [" B", " KB", " MB", " GB", " TB", " PB", " EB"];
    const BASE: f64 = 1000.0;

    if s < 10.0 {
        return (format!("{:2.0}", s), SIZES[0].to_string());
    }

    let e = (s.ln() / BASE.ln()).floor();
    let index = (e as usize).min(SIZES.len() - 1);
    let val = (s / BASE.powf(e) * 1000.0 + 0.5).floor() / 1000.0;

    let formatted = if index >= 3 {
        format!("{:.*}", index - 1, val)
    } else {
        format!("{:.1}", val)
    };

    (formatted, SIZES[index].to_string())
}

pub fn calculate_percent(current: i64, max: i64) -> i64 {
    if max <= 0 {
        return 0;
    }
    let percent = ((current as f64 / max as f64) * 100.0) as i64;
    percent.max(0)
}

/// Predicted time to completion, clamped at zero.
pub fn calculate_eta(rate: f64, max: f64, current: f64) -> Duration {
    let remaining = max - current;
    if remaining <= 0.0 {
        return Duration::ZERO;
    }
    let seconds = if rate == 0.0 {
        remaining
    } else {
        remaining / rate
    };
    if seconds <= 0.0 || !seconds.is_finite() {
        return Duration::ZERO;
    }
    Duration::from_secs(seconds as u64)
}

/// Compact `1h2m3s`-style rendering, second granularity.
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Visible width of a string as printed: ANSI escape sequences and
/// carriage returns take no columns.
pub fn string_width(s: &str) -> usize {
    strip_ansi(s).width()
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                for esc in chars.by_ref() {
                    if esc.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
            continue;
        }
        if c != '\r' {
            out.push(c);
        }
    }
    out
}

/// Keep the leading part of `s` up to `width` columns.
pub fn truncate_to_width(s: &str, width: usize) -> String {
    let mut out = String::new();
    let mut used = 0;
    for c in s.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > width {
            break;
        }
        used += w;
        out.push(c);
    }
    out
}

/// Drop a prefix of `s` spanning at least `width` columns.
pub fn trim_left_width(s: &str, width: usize) -> String {
    let mut dropped = 0;
    let mut iter = s.char_indices();
    for (i, c) in iter.by_ref() {
        if dropped >= width {
            return s[i..].to_string();
        }
        dropped += c.width().unwrap_or(0);
    }
    if dropped >= width {
        String::new()
    } else {
        s.to_string()
    }
}

/// Left-pad `s` with spaces up to `width` columns.
pub fn fill_left(s: &str, width: usize) -> String {
    let current = s.width();
    if current >= width {
        return s.to_string();
    }
    format!("{}{}", " ".repeat(width - current), s)
}

/// Shorten an over-wide line to fit the terminal, marking the cut.
pub fn truncate_with_ellipsis(s: &str, width: usize) -> String {
    if string_width(s) <= width {
        return s.to_string();
    }
    if width <= 3 {
        return truncate_to_width(s, width);
    }
    let mut out = truncate_to_width(s, width - 3);
    out.push_str("...");
    out
}

/// Align a bar description to `length` columns, middle-ellipsing names
/// that do not fit so the interesting head and tail both survive.
pub fn truncate_description(description: &str, length: usize, term_width: usize) -> String {
    const MAX_DESCRIPTION_LENGTH: usize = 59;

    let mut length = length.min(MAX_DESCRIPTION_LENGTH);
    if length > term_width / 2 {
        length = term_width / 2;
    }
    if length % 2 == 0 {
        length = length.saturating_sub(1);
    }

    let desc_width = description.width();
    if desc_width > length {
        let half = length.saturating_sub(3) / 2;
        format!(
            "{}...{}",
            truncate_to_width(description, half),
            trim_left_width(description, desc_width.saturating_sub(half))
        )
    } else {
        fill_left(description, length)
    }
}
