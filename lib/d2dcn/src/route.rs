//! Kernel route lookup: which source address would be used to reach a
//! destination. Descriptors publish this address so peers connect back over
//! the interface that actually faces them.

/// Returns the source IP the kernel would pick for `dest`, read from
/// `ip route get`. Falls back to `127.0.0.1` when the lookup yields nothing
/// and to the empty string on hosts without the facility.
#[cfg(target_os = "linux")]
pub fn source_ip_for(dest: &str) -> String {
    lookup(dest).unwrap_or_else(|| "127.0.0.1".to_string())
}

#[cfg(not(target_os = "linux"))]
pub fn source_ip_for(_dest: &str) -> String {
    String::new()
}

#[cfg(target_os = "linux")]
fn lookup(dest: &str) -> Option<String> {
    use std::process::Command;

    let output = Command::new("ip").args(&["route", "get", dest]).output().ok()?;
    if !output.status.success() {
        return None;
    }

    parse_route_output(&String::from_utf8_lossy(&output.stdout))
}

/// Pulls the address following the `src` token out of `ip route get` output.
#[allow(dead_code)]
fn parse_route_output(output: &str) -> Option<String> {
    let mut tokens = output.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "src" {
            return tokens.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_output_lan() {
        let output = "192.168.1.7 via 192.168.1.1 dev eth0 src 192.168.1.5 uid 1000\n    cache\n";
        assert_eq!(parse_route_output(output), Some("192.168.1.5".to_string()));
    }

    #[test]
    fn test_parse_route_output_loopback() {
        let output = "local 127.0.0.1 dev lo table local src 127.0.0.1 uid 1000\n    cache <local>\n";
        assert_eq!(parse_route_output(output), Some("127.0.0.1".to_string()));
    }

    #[test]
    fn test_parse_route_output_no_src() {
        assert_eq!(parse_route_output("unreachable 10.0.0.1\n"), None);
        assert_eq!(parse_route_output(""), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_loopback_lookup() {
        assert_eq!(source_ip_for("127.0.0.1"), "127.0.0.1");
    }
}
