// Routes module - the route table and deterministic virtual IP assignment

pub mod store;

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Address of the real loopback; never handed out as a virtual IP
pub const LOOPBACK: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Port the virtual addresses listen on; the only one redirected
pub const VIRTUAL_PORT: u16 = 80;

/// Lowest last octet a virtual IP can carry
const FIRST_HOST_OCTET: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub hostname: String,
    #[serde(rename = "port")]
    pub local_port: u16,
    #[serde(rename = "virtualIP")]
    pub virtual_ip: Ipv4Addr,
}

impl Route {
    pub fn short_name(&self) -> &str {
        short_name(&self.hostname)
    }
}

/// Routes keyed by short hostname, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    /// Look up a route by its short hostname
    pub fn get(&self, short: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.short_name() == short)
    }

    fn get_mut(&mut self, short: &str) -> Option<&mut Route> {
        self.routes.iter_mut().find(|r| r.short_name() == short)
    }

    /// Insert or overwrite a route. An existing short name keeps its
    /// position and virtual IP; only the hostname and port change.
    pub fn upsert(&mut self, hostname: &str, local_port: u16) -> AppResult<Route> {
        validate(hostname, local_port)?;
        let short = short_name(hostname);

        if let Some(existing) = self.get_mut(short) {
            existing.hostname = hostname.to_string();
            existing.local_port = local_port;
            return Ok(existing.clone());
        }

        let virtual_ip = self.next_virtual_ip(hostname)?;
        let route = Route {
            hostname: hostname.to_string(),
            local_port,
            virtual_ip,
        };
        self.routes.push(route.clone());
        Ok(route)
    }

    /// Append a route read back from storage. Rejects anything `upsert`
    /// could not have produced: bad hostnames or ports, addresses outside
    /// 127.0.0.0/8 or on 127.0.0.1, duplicate keys and shared addresses.
    pub(crate) fn push_loaded(&mut self, route: Route) -> Result<(), String> {
        validate(&route.hostname, route.local_port).map_err(|e| e.to_string())?;
        if !is_virtual_ip(route.virtual_ip) {
            return Err(format!(
                "{} has virtual IP {}, outside 127.0.0.2-127.255.255.255",
                route.hostname, route.virtual_ip
            ));
        }
        if self.get(route.short_name()).is_some() {
            return Err(format!("duplicate route for {}", route.short_name()));
        }
        if let Some(other) = self.routes.iter().find(|r| r.virtual_ip == route.virtual_ip) {
            return Err(format!(
                "{} and {} share virtual IP {}",
                other.hostname, route.hostname, route.virtual_ip
            ));
        }
        self.routes.push(route);
        Ok(())
    }

    /// The address for the next new short name: 127.0.0.(index + 2),
    /// moved up past any address a hand-edited table already holds.
    fn next_virtual_ip(&self, hostname: &str) -> AppResult<Ipv4Addr> {
        (FIRST_HOST_OCTET + self.routes.len()..=255)
            .map(|octet| Ipv4Addr::new(127, 0, 0, octet as u8))
            .find(|ip| self.routes.iter().all(|r| r.virtual_ip != *ip))
            .ok_or_else(|| AppError::AddressSpaceExhausted {
                hostname: hostname.to_string(),
            })
    }
}

impl<'a> IntoIterator for &'a RouteTable {
    type Item = &'a Route;
    type IntoIter = std::slice::Iter<'a, Route>;

    fn into_iter(self) -> Self::IntoIter {
        self.routes.iter()
    }
}

/// The portion of a hostname before its first `.`
pub fn short_name(hostname: &str) -> &str {
    hostname.split('.').next().unwrap_or(hostname)
}

/// True for 127.0.0.0/8 addresses other than the real loopback
pub fn is_virtual_ip(ip: Ipv4Addr) -> bool {
    ip.is_loopback() && ip != LOOPBACK
}

fn validate(hostname: &str, local_port: u16) -> AppResult<()> {
    if hostname.is_empty() || short_name(hostname).is_empty() {
        return Err(AppError::InvalidRoute(format!(
            "hostname {:?} has an empty short name",
            hostname
        )));
    }
    if let Some(c) = hostname
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '-'))
    {
        return Err(AppError::InvalidRoute(format!(
            "hostname {:?} contains {:?}; only letters, digits, '.' and '-' are allowed",
            hostname, c
        )));
    }
    if local_port == 0 {
        return Err(AppError::InvalidRoute(format!(
            "port for {} must be between 1 and 65535",
            hostname
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(127, 0, 0, last)
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("api.dev"), "api");
        assert_eq!(short_name("api.internal.dev"), "api");
        assert_eq!(short_name("api"), "api");
    }

    #[test]
    fn test_first_route_skips_real_loopback() {
        let mut table = RouteTable::new();
        let route = table.upsert("api.dev", 3000).unwrap();
        assert_eq!(route.virtual_ip, ip(2));
    }

    #[test]
    fn test_new_routes_get_increasing_distinct_ips() {
        let mut table = RouteTable::new();
        let ips: Vec<_> = ["a.dev", "b.dev", "c.dev", "d.dev"]
            .iter()
            .map(|h| table.upsert(h, 8080).unwrap().virtual_ip)
            .collect();
        assert_eq!(ips, vec![ip(2), ip(3), ip(4), ip(5)]);
    }

    #[test]
    fn test_upsert_known_name_keeps_ip_and_updates_port() {
        let mut table = RouteTable::new();
        table.upsert("api.dev", 3000).unwrap();
        table.upsert("web.dev", 4000).unwrap();

        let updated = table.upsert("api.dev", 3001).unwrap();
        assert_eq!(updated.virtual_ip, ip(2));
        assert_eq!(updated.local_port, 3001);
        assert_eq!(table.len(), 2);

        // same short name, different domain: still the same route
        let renamed = table.upsert("api.test", 3002).unwrap();
        assert_eq!(renamed.virtual_ip, ip(2));
        assert_eq!(renamed.hostname, "api.test");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_next_ip_skips_addresses_left_by_removed_entries() {
        let mut table = RouteTable::new();
        table
            .push_loaded(Route {
                hostname: "web.dev".to_string(),
                local_port: 4000,
                virtual_ip: ip(3),
            })
            .unwrap();

        let route = table.upsert("api.dev", 3000).unwrap();
        assert_eq!(route.virtual_ip, ip(4));
    }

    #[test]
    fn test_address_space_exhausted() {
        let mut table = RouteTable::new();
        for n in 0..254 {
            table.upsert(&format!("host{}.dev", n), 8080).unwrap();
        }
        assert_eq!(table.get("host253").unwrap().virtual_ip, ip(255));

        let err = table.upsert("overflow.dev", 8080).unwrap_err();
        assert!(matches!(err, AppError::AddressSpaceExhausted { ref hostname } if hostname == "overflow.dev"));
        assert_eq!(table.len(), 254);
    }

    #[test]
    fn test_rejects_invalid_routes() {
        let mut table = RouteTable::new();
        assert!(matches!(table.upsert("", 80), Err(AppError::InvalidRoute(_))));
        assert!(matches!(table.upsert(".dev", 80), Err(AppError::InvalidRoute(_))));
        assert!(matches!(table.upsert("a b.dev", 80), Err(AppError::InvalidRoute(_))));
        assert!(matches!(table.upsert("api.dev", 0), Err(AppError::InvalidRoute(_))));
        assert!(table.is_empty());
    }

    #[test]
    fn test_rejects_characters_outside_hostname_charset() {
        let mut table = RouteTable::new();
        // '#' would start a comment in the hosts file
        for bad in ["api#x.dev", "api_x.dev", "api/x.dev", "api\tx.dev", "äpi.dev"] {
            assert!(
                matches!(table.upsert(bad, 3000), Err(AppError::InvalidRoute(_))),
                "{:?} accepted",
                bad
            );
        }
        assert!(table.is_empty());

        table.upsert("my-api.v2.dev", 3000).unwrap();
        table.upsert("API9.dev", 3001).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_push_loaded_rejects_what_upsert_never_writes() {
        let mut table = RouteTable::new();
        let loaded = |hostname: &str, local_port, virtual_ip| Route {
            hostname: hostname.to_string(),
            local_port,
            virtual_ip,
        };

        let err = table.push_loaded(loaded("api.dev", 0, ip(2))).unwrap_err();
        assert!(err.contains("port"));
        let err = table.push_loaded(loaded("api.dev", 3000, LOOPBACK)).unwrap_err();
        assert!(err.contains("127.0.0.1"));
        let err = table
            .push_loaded(loaded("web.dev", 4000, Ipv4Addr::new(10, 0, 0, 5)))
            .unwrap_err();
        assert!(err.contains("10.0.0.5"));
        assert!(table.push_loaded(loaded("api#x.dev", 3000, ip(2))).is_err());
        assert!(table.is_empty());

        table.push_loaded(loaded("api.dev", 3000, ip(2))).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_push_loaded_rejects_shared_ip() {
        let mut table = RouteTable::new();
        table.upsert("api.dev", 3000).unwrap();
        let err = table
            .push_loaded(Route {
                hostname: "web.dev".to_string(),
                local_port: 4000,
                virtual_ip: ip(2),
            })
            .unwrap_err();
        assert!(err.contains("share virtual IP 127.0.0.2"));
    }

    #[test]
    fn test_is_virtual_ip() {
        assert!(is_virtual_ip(ip(2)));
        assert!(is_virtual_ip(Ipv4Addr::new(127, 1, 2, 3)));
        assert!(!is_virtual_ip(LOOPBACK));
        assert!(!is_virtual_ip(Ipv4Addr::new(10, 0, 0, 2)));
    }
}
