//! Display formatting for character list entries.
//!
//! Sizes and ages are rendered the same way everywhere a character or one
//! of its backups is shown.

/// Format a byte count with a binary-scaled unit.
///
/// - Values below 1 KiB are shown as whole bytes
/// - Larger values are shown with two decimals in KB or MB
///
/// # Examples
/// ```
/// use charguard_types::formatting::format_size;
/// assert_eq!(format_size(500), "500 B");
/// assert_eq!(format_size(1_536), "1.50 KB");
/// assert_eq!(format_size(3 * 1024 * 1024), "3.00 MB");
/// ```
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format elapsed seconds as a coarse "time ago" label.
///
/// # Examples
/// ```
/// use charguard_types::formatting::format_age;
/// assert_eq!(format_age(5), "just now");
/// assert_eq!(format_age(125), "2m ago");
/// assert_eq!(format_age(7_200), "2h ago");
/// assert_eq!(format_age(3 * 86_400), "3d ago");
/// ```
pub fn format_age(secs: u64) -> String {
    match secs {
        0..60 => "just now".to_string(),
        60..3_600 => format!("{}m ago", secs / 60),
        3_600..86_400 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
