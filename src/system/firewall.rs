// NAT redirect rules (pf)
//
// The whole ruleset is rebuilt from the route table and loaded in one
// step, replacing whatever was active. Individual rules are never
// tracked or removed one by one.

use crate::error::{AppError, AppResult};
use crate::routes::{LOOPBACK, Route, VIRTUAL_PORT};
use std::io::Write;
use std::net::Ipv4Addr;
use std::process::{Command, Stdio};

/// Access to the firewall's active NAT ruleset
pub trait RedirectControl {
    /// Load `ruleset`, discarding the previously active one
    fn load(&self, ruleset: &str) -> AppResult<()>;
    /// The active NAT rules as printed by the firewall
    fn active_rules(&self) -> AppResult<String>;
}

impl<T: RedirectControl + ?Sized> RedirectControl for &T {
    fn load(&self, ruleset: &str) -> AppResult<()> {
        (**self).load(ruleset)
    }

    fn active_rules(&self) -> AppResult<String> {
        (**self).active_rules()
    }
}

pub struct Pfctl;

impl RedirectControl for Pfctl {
    fn load(&self, ruleset: &str) -> AppResult<()> {
        tracing::debug!("Running pfctl -ef -");

        let mut child = Command::new("pfctl")
            .args(["-ef", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::Firewall(format!("failed to execute pfctl: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(ruleset.as_bytes()).map_err(|e| {
                AppError::Firewall(format!("failed to pass ruleset to pfctl: {}", e))
            })?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| AppError::Firewall(format!("failed to wait for pfctl: {}", e)))?;

        // pfctl -e exits 1 when pf is already enabled, even though the
        // ruleset was loaded
        if !output.status.success() {
            tracing::warn!(
                "pfctl exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn active_rules(&self) -> AppResult<String> {
        let output = Command::new("pfctl")
            .args(["-s", "nat"])
            .output()
            .map_err(|e| AppError::Firewall(format!("failed to execute pfctl: {}", e)))?;

        if !output.status.success() {
            return Err(AppError::Firewall(format!(
                "`pfctl -s nat` failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// One redirect per route, in table order
pub fn build_ruleset<'a>(routes: impl IntoIterator<Item = &'a Route>) -> String {
    routes
        .into_iter()
        .map(|route| {
            format!(
                "rdr pass inet proto tcp from any to {} port {} -> {} port {}\n",
                route.virtual_ip, VIRTUAL_PORT, LOOPBACK, route.local_port
            )
        })
        .collect()
}

pub struct RedirectSync<C> {
    control: C,
}

impl<C: RedirectControl> RedirectSync<C> {
    pub fn new(control: C) -> Self {
        RedirectSync { control }
    }

    /// Replace the active ruleset with `ruleset`
    pub fn install(&self, ruleset: &str) -> AppResult<()> {
        self.control.load(ruleset)?;
        tracing::info!(rules = ruleset.lines().count(), "Port forwarding configured");
        Ok(())
    }

    /// Drop every redirect by loading an empty ruleset
    pub fn flush(&self) -> AppResult<()> {
        self.control.load("")?;
        tracing::info!("Port forwarding rules flushed");
        Ok(())
    }

    /// Active rules that mention a 127.0.0.0/8 address
    pub fn active_redirects(&self) -> AppResult<Vec<String>> {
        Ok(self
            .control
            .active_rules()?
            .lines()
            .filter(|line| {
                line.split_whitespace()
                    .any(|token| token.parse::<Ipv4Addr>().is_ok_and(|ip| ip.is_loopback()))
            })
            .map(|line| line.trim().to_string())
            .collect())
    }
}
