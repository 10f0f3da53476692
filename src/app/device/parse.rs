use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;

/// `idevice_id -l` prints one identifier per line; the network variant may
/// append a transport label that is not part of the identifier.
pub fn parse_identifier_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(strip_transport_suffix)
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}

pub fn strip_transport_suffix(line: &str) -> &str {
    let trimmed = line.trim();
    trimmed
        .strip_suffix("(Network)")
        .or_else(|| trimmed.strip_suffix("(USB)"))
        .map(str::trim_end)
        .unwrap_or(trimmed)
}

/// Handles both `ideviceinfo -s` dumps and `-k ProductVersion`, which prints
/// only the bare value.
pub fn parse_product_version(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some((_, value)) = line.split_once("ProductVersion:") {
            let value = value.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    let candidate = text.trim();
    if candidate.starts_with(|c: char| c.is_ascii_digit()) {
        return Some(candidate.lines().next().unwrap_or(candidate).trim().to_string());
    }
    None
}

fn version_prefix() -> &'static Regex {
    static VERSION_PREFIX: OnceLock<Regex> = OnceLock::new();
    VERSION_PREFIX.get_or_init(|| Regex::new(r"^\s*(\d+(?:\.\d+)*)").unwrap())
}

fn version_components(value: &str) -> Vec<u64> {
    let Some(caps) = version_prefix().captures(value) else {
        return vec![0, 0];
    };
    caps[1]
        .split('.')
        .map(|part| part.parse::<u64>().unwrap_or(0))
        .collect()
}

pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let mut a = version_components(left);
    let mut b = version_components(right);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    a.cmp(&b)
}

pub fn is_supported_version(version: &str, minimum: &str) -> bool {
    compare_versions(version, minimum) != Ordering::Less
}
