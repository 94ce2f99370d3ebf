// Loopback interface aliases
//
// The interface is machine-wide state shared with everything else on the
// host, so every mutation is preceded by a fresh read of what is bound.

use crate::error::{AppError, AppResult};
use crate::routes::is_virtual_ip;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::process::Command;

/// Raw access to the addresses bound on one interface
pub trait LoopbackControl {
    /// Every IPv4 address currently bound, including the real loopback
    fn addresses(&self) -> AppResult<Vec<Ipv4Addr>>;
    fn bind(&self, ip: Ipv4Addr) -> AppResult<()>;
    fn unbind(&self, ip: Ipv4Addr) -> AppResult<()>;
}

impl<T: LoopbackControl + ?Sized> LoopbackControl for &T {
    fn addresses(&self) -> AppResult<Vec<Ipv4Addr>> {
        (**self).addresses()
    }

    fn bind(&self, ip: Ipv4Addr) -> AppResult<()> {
        (**self).bind(ip)
    }

    fn unbind(&self, ip: Ipv4Addr) -> AppResult<()> {
        (**self).unbind(ip)
    }
}

/// Default loopback interface name for this platform
pub fn default_interface() -> &'static str {
    if cfg!(target_os = "linux") { "lo" } else { "lo0" }
}

/// Drives the interface through the platform's configuration tool:
/// `ip` on Linux, `ifconfig` elsewhere.
pub struct SystemLoopback {
    interface: String,
}

impl SystemLoopback {
    pub fn new(interface: impl Into<String>) -> Self {
        SystemLoopback {
            interface: interface.into(),
        }
    }
}

#[cfg(target_os = "linux")]
impl LoopbackControl for SystemLoopback {
    fn addresses(&self) -> AppResult<Vec<Ipv4Addr>> {
        let stdout = run("ip", &["-4", "addr", "show", "dev", self.interface.as_str()])?;
        Ok(parse_inet_addresses(&stdout))
    }

    fn bind(&self, ip: Ipv4Addr) -> AppResult<()> {
        let cidr = format!("{}/32", ip);
        run("ip", &["addr", "add", cidr.as_str(), "dev", self.interface.as_str()]).map(drop)
    }

    fn unbind(&self, ip: Ipv4Addr) -> AppResult<()> {
        let cidr = format!("{}/32", ip);
        run("ip", &["addr", "del", cidr.as_str(), "dev", self.interface.as_str()]).map(drop)
    }
}

#[cfg(not(target_os = "linux"))]
impl LoopbackControl for SystemLoopback {
    fn addresses(&self) -> AppResult<Vec<Ipv4Addr>> {
        let stdout = run("ifconfig", &[self.interface.as_str()])?;
        Ok(parse_inet_addresses(&stdout))
    }

    fn bind(&self, ip: Ipv4Addr) -> AppResult<()> {
        let ip = ip.to_string();
        run("ifconfig", &[self.interface.as_str(), "alias", ip.as_str()]).map(drop)
    }

    fn unbind(&self, ip: Ipv4Addr) -> AppResult<()> {
        let ip = ip.to_string();
        run("ifconfig", &[self.interface.as_str(), "-alias", ip.as_str()]).map(drop)
    }
}

fn run(program: &str, args: &[&str]) -> AppResult<String> {
    tracing::debug!("Running {} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|e| AppError::Interface(format!("failed to execute {}: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::Interface(format!(
            "`{} {}` failed ({}): {}",
            program,
            args.join(" "),
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Pull IPv4 addresses out of `ifconfig` or `ip addr` output.
///
/// Both tools print one `inet <addr>` line per address; `ip` appends the
/// prefix length (`inet 127.0.0.1/8 scope host lo`), `ifconfig` does not
/// (`inet 127.0.0.1 netmask 0xff000000`).
pub fn parse_inet_addresses(output: &str) -> Vec<Ipv4Addr> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            if parts.next() != Some("inet") {
                return None;
            }
            let addr = parts.next()?;
            addr.split('/').next()?.parse().ok()
        })
        .collect()
}

/// Keeps the interface's alias set in step with the route table
pub struct AliasManager<C> {
    control: C,
}

impl<C: LoopbackControl> AliasManager<C> {
    pub fn new(control: C) -> Self {
        AliasManager { control }
    }

    /// Bound addresses in 127.0.0.0/8, without 127.0.0.1
    pub fn list_aliases(&self) -> AppResult<BTreeSet<Ipv4Addr>> {
        Ok(self
            .control
            .addresses()?
            .into_iter()
            .filter(|ip| is_virtual_ip(*ip))
            .collect())
    }

    /// Bind `ip` unless it is already bound. Returns whether it was added.
    pub fn ensure_alias(&self, ip: Ipv4Addr) -> AppResult<bool> {
        if !is_virtual_ip(ip) {
            return Err(AppError::Interface(format!(
                "refusing to alias {}: not a 127.0.0.0/8 address other than 127.0.0.1",
                ip
            )));
        }

        if self.list_aliases()?.contains(&ip) {
            tracing::debug!(ip = %ip, "Alias already bound");
            return Ok(false);
        }

        self.control.bind(ip)?;
        tracing::info!(ip = %ip, "Alias added");
        Ok(true)
    }

    /// Unbind every alias. Each removal is attempted even when an earlier
    /// one failed; the failures are reported together afterwards.
    pub fn remove_all_aliases(&self) -> AppResult<Vec<Ipv4Addr>> {
        let mut removed = Vec::new();
        let mut failures = Vec::new();

        for ip in self.list_aliases()? {
            match self.control.unbind(ip) {
                Ok(()) => {
                    tracing::info!(ip = %ip, "Alias removed");
                    removed.push(ip);
                }
                Err(e) => {
                    tracing::warn!(ip = %ip, "Failed to remove alias: {}", e);
                    failures.push((ip, e.to_string()));
                }
            }
        }

        if failures.is_empty() {
            Ok(removed)
        } else {
            Err(AppError::unremovable_aliases(&failures))
        }
    }
}
