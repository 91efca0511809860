//! Human-readable sizes, fractions and durations for logs and the CLI.

use std::time::Duration;

use crate::model::Item;

const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];

/// Formats a byte count with binary units ("512 B", "1.50 MB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

/// Formats a fraction in `[0.0, 1.0]` as a whole percentage.
#[must_use]
pub fn format_percent(fraction: f64) -> String {
    format!("{:.0}%", fraction.clamp(0.0, 1.0) * 100.0)
}

/// Short progress label for an item: a percentage, or the byte count when
/// the total is unknown.
#[must_use]
pub fn format_progress(item: &Item) -> String {
    if item.indeterminate {
        format_bytes(item.bytes_written)
    } else {
        format_percent(item.progress_fraction)
    }
}

/// Formats elapsed time as "4.2s", "3m 07s" or "1h 02m 03s".
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        0..60 => format!("{secs}.{}s", d.subsec_millis() / 100),
        60..3600 => format!("{}m {:02}s", secs / 60, secs % 60),
        _ => format!(
            "{}h {:02}m {:02}s",
            secs / 3600,
            (secs % 3600) / 60,
            secs % 60
        ),
    }
}
