//! Environment fixups applied before the agent starts: normalize
//! `/etc/hosts` loopback entries and relax path-MTU discovery for nested
//! container networks. Both are warn-only; neither blocks the boot.

use std::path::Path;

use crate::platform;

const HOSTS_PATH: &str = "/etc/hosts";

pub fn run() {
    if let Err(e) = fix_hosts(Path::new(HOSTS_PATH)) {
        tracing::warn!(error = %e, "failed to normalize /etc/hosts");
    }
    if let Err(e) = platform::write_sysctl("net.ipv4.ip_no_pmtu_disc", "1") {
        tracing::warn!(error = %e, "failed to disable path-MTU discovery");
    }
    if let Err(e) = platform::write_sysctl("net.ipv4.tcp_mtu_probing", "1") {
        tracing::warn!(error = %e, "failed to enable TCP MTU probing");
    }
}

fn fix_hosts(path: &Path) -> std::io::Result<()> {
    let original = std::fs::read_to_string(path)?;
    let normalized = normalize_hosts(&original);
    if normalized != original {
        std::fs::write(path, normalized)?;
    }
    Ok(())
}

/// Drop `localhost` from any `::1` line (dropping the line entirely if no
/// names remain), then ensure a `127.0.0.1 localhost` line exists.
fn normalize_hosts(contents: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut has_v4_localhost = false;

    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            lines.push(line.to_string());
            continue;
        }

        let mut fields = trimmed.split_whitespace();
        let Some(address) = fields.next() else {
            lines.push(line.to_string());
            continue;
        };
        let names: Vec<&str> = fields.collect();

        if address == "127.0.0.1" && names.contains(&"localhost") {
            has_v4_localhost = true;
        }

        if address == "::1" {
            let remaining: Vec<&str> = names.into_iter().filter(|n| *n != "localhost").collect();
            if remaining.is_empty() {
                continue;
            }
            lines.push(format!("{address}\t{}", remaining.join("\t")));
            continue;
        }

        lines.push(line.to_string());
    }

    if !has_v4_localhost {
        lines.insert(0, "127.0.0.1\tlocalhost".to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_localhost_from_v6_line_keeping_other_names() {
        let input = "::1\tlocalhost ip6-localhost ip6-loopback\n127.0.0.1\tlocalhost\n";
        let out = normalize_hosts(input);
        assert!(out.contains("::1\tip6-localhost\tip6-loopback"));
        assert!(!out.contains("::1\tlocalhost"));
    }

    #[test]
    fn drops_v6_line_entirely_when_only_localhost_named() {
        let input = "::1\tlocalhost\n127.0.0.1\tlocalhost\n";
        let out = normalize_hosts(input);
        assert!(!out.contains("::1"));
    }

    #[test]
    fn adds_v4_localhost_when_missing() {
        let input = "::1\tlocalhost ip6-localhost\n";
        let out = normalize_hosts(input);
        assert!(out.lines().next() == Some("127.0.0.1\tlocalhost"));
    }

    #[test]
    fn already_normalized_input_is_unchanged() {
        let input = "127.0.0.1\tlocalhost\n::1\tip6-localhost\tip6-loopback\n";
        assert_eq!(normalize_hosts(input), input);
    }
}
