// Static name resolution (/etc/hosts)
//
// The file is shared with the rest of the system: entries are only ever
// appended, never edited or removed.

use crate::error::{AppError, AppResult};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub const DEFAULT_HOSTS_FILE: &str = "/etc/hosts";

pub struct HostsFile {
    path: PathBuf,
}

impl HostsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        HostsFile { path: path.into() }
    }

    /// Make `hostname` resolve to `ip`, appending a line only when no
    /// existing entry already maps that pair. Returns whether a line
    /// was written.
    pub fn ensure_entry(&self, ip: Ipv4Addr, hostname: &str) -> AppResult<bool> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| AppError::io(format!("Failed to read {}", self.path.display()), e))?;

        if content.lines().any(|line| maps(line, ip, hostname)) {
            tracing::debug!(hostname, ip = %ip, "Hosts entry already present");
            return Ok(false);
        }

        let mut entry = String::new();
        if !content.is_empty() && !content.ends_with('\n') {
            entry.push('\n');
        }
        entry.push_str(&format!("{}\t{}\n", ip, hostname));

        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| AppError::io(format!("Failed to open {}", self.path.display()), e))?;
        file.write_all(entry.as_bytes()).map_err(|e| {
            AppError::io(
                format!("Failed to add {} to {}", hostname, self.path.display()),
                e,
            )
        })?;

        tracing::info!(hostname, ip = %ip, "Hosts file updated");
        Ok(true)
    }

    /// Active lines whose address is in 127.0.0.0/8
    pub fn loopback_entries(&self) -> AppResult<Vec<String>> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| AppError::io(format!("Failed to read {}", self.path.display()), e))?;

        Ok(content
            .lines()
            .filter(|line| {
                strip_comment(line)
                    .split_whitespace()
                    .next()
                    .and_then(|addr| addr.parse::<Ipv4Addr>().ok())
                    .is_some_and(|addr| addr.is_loopback())
            })
            .map(|line| line.trim().to_string())
            .collect())
    }
}

fn strip_comment(line: &str) -> &str {
    line.split('#').next().unwrap_or("")
}

/// Whether a hosts line maps `hostname` to `ip`
pub(crate) fn maps(line: &str, ip: Ipv4Addr, hostname: &str) -> bool {
    let mut fields = strip_comment(line).split_whitespace();
    match fields.next().and_then(|addr| addr.parse::<Ipv4Addr>().ok()) {
        Some(addr) if addr == ip => fields.any(|name| name == hostname),
        _ => false,
    }
}
