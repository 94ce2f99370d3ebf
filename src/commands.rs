// Subcommand implementations: add, up, status, reset
//
// Each command is one sequential pass over the route table. The system
// collaborators are injected so the flows run against in-memory fakes
// in tests.

use crate::error::AppResult;
use crate::routes::store::RouteStore;
use crate::routes::{LOOPBACK, Route, VIRTUAL_PORT};
use crate::system::hosts::{self, HostsFile};
use crate::system::{AliasManager, LoopbackControl, RedirectControl, RedirectSync, build_ruleset};
use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

/// The machine-wide state a route is activated in
pub struct SystemState<L, F> {
    pub aliases: AliasManager<L>,
    pub hosts: HostsFile,
    pub redirects: RedirectSync<F>,
}

impl<L: LoopbackControl, F: RedirectControl> SystemState<L, F> {
    pub fn new(loopback: L, hosts: HostsFile, firewall: F) -> Self {
        SystemState {
            aliases: AliasManager::new(loopback),
            hosts,
            redirects: RedirectSync::new(firewall),
        }
    }
}

/// Register (or update) a route; touches nothing but the route table
pub fn add(store: &RouteStore, hostname: &str, port: u16) -> AppResult<Route> {
    store.upsert(hostname, port)
}

/// Activate every route in the table.
///
/// Aliases and hosts entries are applied route by route and stop at the
/// first failure. The redirect ruleset is loaded once, after every route
/// went through, so a failure never leaves a partial ruleset installed.
pub fn up<L: LoopbackControl, F: RedirectControl>(
    store: &RouteStore,
    system: &SystemState<L, F>,
) -> AppResult<Vec<Route>> {
    let table = store.load()?;
    tracing::info!(routes = table.len(), "Activating dev-proxy");

    for route in &table {
        tracing::info!(
            hostname = %route.hostname,
            virtual_ip = %route.virtual_ip,
            "Setting up virtual ip"
        );
        system
            .aliases
            .ensure_alias(route.virtual_ip)
            .map_err(|e| e.for_host(&route.hostname))?;
        system
            .hosts
            .ensure_entry(route.virtual_ip, &route.hostname)
            .map_err(|e| e.for_host(&route.hostname))?;
    }

    let ruleset = build_ruleset(&table);
    system.redirects.install(&ruleset)?;

    Ok(table.iter().cloned().collect())
}

/// Deactivate every route: drop all aliases, then flush the redirects.
/// The route table is left as it is so `up` can bring the routes back.
pub fn reset<L: LoopbackControl, F: RedirectControl>(
    system: &SystemState<L, F>,
) -> AppResult<Vec<Ipv4Addr>> {
    let removed = system.aliases.remove_all_aliases();
    let flushed = system.redirects.flush();

    match (removed, flushed) {
        (Ok(removed), Ok(())) => Ok(removed),
        (Err(e), Ok(())) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(flush_err)) => {
            tracing::error!("Failed to flush redirect rules: {}", flush_err);
            Err(e)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStatus {
    #[serde(flatten)]
    pub route: Route,
    pub alias: bool,
    pub hosts_entry: bool,
    pub redirect: bool,
}

impl RouteStatus {
    pub fn is_active(&self) -> bool {
        self.alias && self.hosts_entry && self.redirect
    }
}

/// Read-only snapshot of the three system stores
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub hostname: String,
    pub timestamp: String,
    pub routes: Vec<RouteStatus>,
    pub hosts_entries: Vec<String>,
    pub aliases: Vec<Ipv4Addr>,
    pub redirects: Vec<String>,
}

pub fn status<L: LoopbackControl, F: RedirectControl>(
    store: &RouteStore,
    system: &SystemState<L, F>,
) -> AppResult<StatusReport> {
    let table = store.load()?;
    let hosts_entries = system.hosts.loopback_entries()?;
    let aliases: Vec<Ipv4Addr> = system.aliases.list_aliases()?.into_iter().collect();
    let redirects = system.redirects.active_redirects()?;

    let routes = table
        .iter()
        .map(|route| RouteStatus {
            alias: aliases.contains(&route.virtual_ip),
            hosts_entry: hosts_entries
                .iter()
                .any(|line| hosts::maps(line, route.virtual_ip, &route.hostname)),
            redirect: redirects.iter().any(|rule| redirects_route(rule, route)),
            route: route.clone(),
        })
        .collect();

    Ok(StatusReport {
        hostname: local_hostname(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        routes,
        hosts_entries,
        aliases,
        redirects,
    })
}

/// Whether an active pf rule sends `route`'s virtual address to its port.
/// pf prints rules back as `... to 127.0.0.2 port = 80 -> 127.0.0.1 port 3000`.
fn redirects_route(rule: &str, route: &Route) -> bool {
    let Some((from, to)) = rule.split_once("->") else {
        return false;
    };
    let virtual_ip = route.virtual_ip.to_string();
    let loopback = LOOPBACK.to_string();
    let port = route.local_port.to_string();
    let target: Vec<&str> = to.split_whitespace().collect();

    from.split_whitespace().any(|token| token == virtual_ip)
        && target.first() == Some(&loopback.as_str())
        && target.last() == Some(&port.as_str())
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "==> Routes:")?;
        for status in &self.routes {
            let route = &status.route;
            writeln!(
                f,
                "{} => {}:{} => {}:{} [{}]",
                route.hostname,
                route.virtual_ip,
                VIRTUAL_PORT,
                LOOPBACK,
                route.local_port,
                if status.is_active() { "active" } else { "inactive" }
            )?;
        }

        writeln!(f, "\n==> Hosts file:")?;
        for line in &self.hosts_entries {
            writeln!(f, "{}", line)?;
        }

        writeln!(f, "\n==> Loopback interface addresses:")?;
        if self.aliases.is_empty() {
            writeln!(f, "No 127.0.0.* addresses assigned")?;
        }
        for ip in &self.aliases {
            writeln!(f, "{}", ip)?;
        }

        writeln!(f, "\n==> Port forwarding rules:")?;
        for rule in &self.redirects {
            writeln!(f, "{}", rule)?;
        }
        Ok(())
    }
}
