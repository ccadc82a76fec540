//! Release version and compatibility rules

/// Version reported by agents and checked by the broker
pub const VERSION: &str = "0.1.1";

/// Two versions are compatible when both are `major.minor.patch` and share
/// major and minor.
pub fn is_compatible(a: &str, b: &str) -> bool {
    match (major_minor(a), major_minor(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn major_minor(version: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() != 3 {
        return None;
    }
    Some((parts[0], parts[1]))
}

/// Device string sent in the agent handshake, e.g. `linux/x86_64`
pub fn device() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}
