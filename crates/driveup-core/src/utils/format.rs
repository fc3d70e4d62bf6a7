const KIB: u64 = 1024;
const MIB: u64 = KIB * 1024;
const GIB: u64 = MIB * 1024;

/// Format a byte count with binary units (B, KiB, MiB, GiB)
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format transfer progress as "42% (3.4 MiB / 8.0 MiB)"
pub fn format_progress(committed: u64, total: u64) -> String {
    let percent = if total == 0 {
        100
    } else {
        // u128 keeps the multiplication from overflowing on very large files
        ((committed as u128 * 100) / total as u128) as u64
    };
    format!(
        "{}% ({} / {})",
        percent,
        format_bytes(committed),
        format_bytes(total)
    )
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}
