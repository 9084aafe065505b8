//! Small helpers shared by the sender and receiver sides.

use crate::error::{Error, Result};
use std::path::{Component, Path};

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Parse a human size such as `16MB`, `1.5GB`, `512KB` or `100B`.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let (number, unit) = if let Some(n) = upper.strip_suffix("GB") {
        (n, GB)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, MB)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, KB)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1.0)
    } else {
        (upper.as_str(), 1.0)
    };

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid size: {:?}", s)))?;
    if !value.is_finite() || value < 0.0 {
        return Err(Error::Config(format!("invalid size: {:?}", s)));
    }
    Ok((value * unit) as u64)
}

/// Render a byte count with the largest unit that keeps it >= 1.
pub fn format_size(bytes: u64) -> String {
    let b = bytes as f64;
    if b < KB {
        format!("{}B", bytes)
    } else if b < MB {
        format!("{:.2}KB", b / KB)
    } else if b < GB {
        format!("{:.2}MB", b / MB)
    } else {
        format!("{:.2}GB", b / GB)
    }
}

/// Keep only the last `max` characters of a long path for log lines.
pub fn short_path(s: &str, max: usize) -> String {
    let count = s.chars().count();
    if count <= max {
        s.to_string()
    } else {
        let tail: String = s.chars().skip(count - max).collect();
        format!("...{}", tail)
    }
}

/// Relative path as sent on the wire: `/`-separated with a leading `/`,
/// or empty for the apex itself.
pub fn to_wire_path(rel: &Path) -> String {
    let mut out = String::new();
    for component in rel.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("16MB").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_size("1.5GB").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_size("512KB").unwrap(), 512 * 1024);
        assert_eq!(parse_size("100B").unwrap(), 100);
        assert_eq!(parse_size(" 7 ").unwrap(), 7);
        assert_eq!(parse_size("2mb").unwrap(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("lots").is_err());
        assert!(parse_size("-3MB").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(1536), "1.50KB");
        assert_eq!(format_size(16 * 1024 * 1024), "16.00MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00GB");
    }

    #[test]
    fn test_short_path() {
        assert_eq!(short_path("short", 50), "short");
        let long = "a".repeat(60) + "/tail.txt";
        let short = short_path(&long, 10);
        assert_eq!(short, "...a/tail.txt");
        assert_eq!(short.len(), 13);
    }

    #[test]
    fn test_to_wire_path() {
        assert_eq!(to_wire_path(Path::new("")), "");
        assert_eq!(to_wire_path(&PathBuf::from("a").join("b.txt")), "/a/b.txt");
        assert_eq!(to_wire_path(Path::new("file.bin")), "/file.bin");
    }
}
