//! Parsing of resource quantities (`500m`, `2`, `16Gi`, ...)

use std::sync::OnceLock;

use regex::Regex;

fn non_digits() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^0-9]").expect("valid pattern"))
}

fn digits(value: &str) -> i64 {
    non_digits().replace_all(value, "").parse().unwrap_or(0)
}

/// CPU quantity in millis. `"250m"` is 250, `"4"` is 4000.
pub fn cpu_millis(value: &str) -> i64 {
    let value = value.trim();
    if let Some(millis) = value.strip_suffix('m') {
        digits(millis)
    } else {
        digits(value) * 1000
    }
}

/// Memory quantity in bytes. Accepts binary (`Ki`..`Pi`) and decimal
/// (`k`..`P`) suffixes; a bare number is bytes.
pub fn memory_bytes(value: &str) -> i64 {
    let value = value.trim();
    const SUFFIXES: [(&str, i64); 10] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("Pi", 1 << 50),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
    ];

    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return digits(number).saturating_mul(multiplier);
        }
    }
    digits(value)
}

/// GPU count. Fractional (`m`) quantities round down.
pub fn gpu_count(value: &str) -> i64 {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => digits(millis) / 1000,
        None => digits(value),
    }
}

pub fn format_cpu(millis: i64) -> String {
    format!("{millis}m")
}

pub fn format_memory(bytes: i64) -> String {
    const MI: i64 = 1 << 20;
    if bytes % MI == 0 {
        format!("{}Mi", bytes / MI)
    } else {
        bytes.to_string()
    }
}
