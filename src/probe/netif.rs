//! Interface and route tables.
//!
//! Built once at startup from the system interface list and (on linux) the
//! kernel routing table, then consulted read-only by the probing paths to
//! pick an egress interface for a target.

use std::collections::HashMap;
use std::net::IpAddr;

use ipnetwork::{IpNetwork, Ipv4Network};
use tracing::debug;

use crate::model::Mac;

/// One enumerated system interface.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub mac: Option<Mac>,
    pub addrs: Vec<IpAddr>,
}

impl Interface {
    /// Any address of the requested family.
    pub fn addr(&self, want_v4: bool) -> Option<IpAddr> {
        self.addrs.iter().copied().find(|a| a.is_ipv4() == want_v4)
    }
}

/// A single routing-table entry mapping a prefix to an egress interface.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub prefix: Ipv4Network,
    pub iface: String,
}

/// Immutable interface/route lookup tables.
#[derive(Debug, Default)]
pub struct Netif {
    by_name: HashMap<String, Interface>,
    by_addr: HashMap<IpAddr, String>,
    by_mac: HashMap<Mac, String>,
    routes: Vec<Route>,
    default_iface: Option<String>,
    default_gateway: Option<IpAddr>,
}

impl Netif {
    /// Enumerate interfaces and read the routing table. Platforms without
    /// a readable routing table degrade to default-interface selection.
    pub fn discover() -> std::io::Result<Self> {
        let mut tables = Self::default();

        // MAC addresses come from the datalink layer, assigned addresses
        // from the interface address list.
        let mut macs: HashMap<String, Mac> = HashMap::new();
        for iface in pnet_datalink::interfaces() {
            if let Some(mac) = iface.mac {
                macs.insert(iface.name.clone(), Mac::from(mac));
            }
        }

        for ifaddr in if_addrs::get_if_addrs()? {
            let addr = ifaddr.ip();
            let name = ifaddr.name.clone();
            let entry = tables
                .by_name
                .entry(name.clone())
                .or_insert_with(|| Interface {
                    name: name.clone(),
                    mac: macs.get(&name).copied(),
                    addrs: Vec::new(),
                });
            entry.addrs.push(addr);
            tables.by_addr.insert(addr, name.clone());
            if let Some(mac) = macs.get(&name) {
                tables.by_mac.insert(*mac, name.clone());
            }
        }

        #[cfg(target_os = "linux")]
        match std::fs::read_to_string("/proc/net/route") {
            Ok(table) => {
                let (routes, default) = parse_route_table(&table);
                tables.routes = routes;
                if let Some((iface, gateway)) = default {
                    tables.default_iface = Some(iface);
                    tables.default_gateway = Some(IpAddr::V4(gateway));
                }
            }
            Err(e) => debug!(error = %e, "routing table unavailable"),
        }

        // No routing table on this platform: fall back to the first
        // interface carrying a routable v4 address.
        if tables.default_iface.is_none() {
            tables.default_iface = tables
                .by_name
                .values()
                .find(|i| {
                    i.addrs
                        .iter()
                        .any(|a| a.is_ipv4() && !a.is_loopback())
                })
                .map(|i| i.name.clone());
        }

        debug!(
            interfaces = tables.by_name.len(),
            routes = tables.routes.len(),
            default = tables.default_iface.as_deref().unwrap_or("-"),
            "interface tables built"
        );
        Ok(tables)
    }

    pub fn interface(&self, name: &str) -> Option<&Interface> {
        self.by_name.get(name)
    }

    pub fn interface_of_addr(&self, addr: IpAddr) -> Option<&Interface> {
        self.by_addr.get(&addr).and_then(|n| self.by_name.get(n))
    }

    pub fn interface_of_mac(&self, mac: Mac) -> Option<&Interface> {
        self.by_mac.get(&mac).and_then(|n| self.by_name.get(n))
    }

    pub fn default_gateway(&self) -> Option<IpAddr> {
        self.default_gateway
    }

    /// The interface whose registered route prefix contains `target`,
    /// most specific first; fallback is the default-route interface.
    pub fn best_interface(&self, target: IpAddr) -> Option<&Interface> {
        let name = match target {
            IpAddr::V4(v4) => self
                .routes
                .iter()
                .filter(|r| r.prefix.contains(v4))
                .max_by_key(|r| r.prefix.prefix())
                .map(|r| r.iface.as_str()),
            IpAddr::V6(_) => None,
        };
        let name = name.or(self.default_iface.as_deref())?;
        self.by_name.get(name)
    }

    /// Whether `target` falls inside a directly attached (non-default)
    /// route, i.e. is reachable without crossing the gateway.
    pub fn is_on_link(&self, target: IpAddr) -> bool {
        match target {
            IpAddr::V4(v4) => self.routes.iter().any(|r| r.prefix.contains(v4)),
            IpAddr::V6(_) => false,
        }
    }

    /// The v4 (or v6) address assigned to a named interface.
    pub fn addr_of_iface(&self, name: &str, want_v4: bool) -> Option<IpAddr> {
        self.by_name.get(name).and_then(|i| i.addr(want_v4))
    }

    #[cfg(test)]
    pub(crate) fn for_tests(routes: Vec<Route>, default_iface: Option<&str>) -> Self {
        let mut by_name = HashMap::new();
        for r in &routes {
            by_name.insert(
                r.iface.clone(),
                Interface {
                    name: r.iface.clone(),
                    mac: None,
                    addrs: Vec::new(),
                },
            );
        }
        if let Some(name) = default_iface {
            by_name.entry(name.to_string()).or_insert_with(|| Interface {
                name: name.to_string(),
                mac: None,
                addrs: Vec::new(),
            });
        }
        Self {
            by_name,
            routes,
            default_iface: default_iface.map(String::from),
            ..Self::default()
        }
    }
}

/// Parse the text form of `/proc/net/route`. Addresses are hex dumps of
/// the in-memory u32, so the byte order must be swapped back.
fn parse_route_table(table: &str) -> (Vec<Route>, Option<(String, std::net::Ipv4Addr)>) {
    const RTF_UP: u32 = 0x0001;

    let mut routes = Vec::new();
    let mut default = None;

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 8 {
            continue;
        }
        let iface = fields[0];
        let (Some(dst), Some(gw), Some(flags), Some(mask)) = (
            parse_route_addr(fields[1]),
            parse_route_addr(fields[2]),
            u32::from_str_radix(fields[3], 16).ok(),
            parse_route_addr(fields[7]),
        ) else {
            continue;
        };
        if flags & RTF_UP == 0 {
            continue;
        }
        let prefix_len = u32::from(mask).count_ones() as u8;
        if u32::from(dst) == 0 && prefix_len == 0 {
            if default.is_none() {
                default = Some((iface.to_string(), gw));
            }
            continue;
        }
        match Ipv4Network::new(dst, prefix_len) {
            Ok(prefix) => routes.push(Route {
                prefix,
                iface: iface.to_string(),
            }),
            Err(e) => debug!(iface, error = %e, "skipping malformed route"),
        }
    }

    (routes, default)
}

fn parse_route_addr(field: &str) -> Option<std::net::Ipv4Addr> {
    u32::from_str_radix(field, 16)
        .ok()
        .map(|v| std::net::Ipv4Addr::from(v.swap_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
eth0\t00000000\t0101A8C0\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0001A8C0\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
wlan0\t0002A8C0\t00000000\t0001\t0\t0\t600\t00FFFFFF\t0\t0\t0
eth1\t000010AC\t00000000\t0000\t0\t0\t0\t0000FFFF\t0\t0\t0";

    #[test]
    fn test_parse_route_table() {
        let (routes, default) = parse_route_table(SAMPLE);

        // down route (flags 0) is skipped
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].iface, "eth0");
        assert_eq!(routes[0].prefix, "192.168.1.0/24".parse().unwrap());
        assert_eq!(routes[1].iface, "wlan0");
        assert_eq!(routes[1].prefix, "192.168.2.0/24".parse().unwrap());

        let (iface, gw) = default.unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(gw, std::net::Ipv4Addr::new(192, 168, 1, 1));
    }

    #[test]
    fn test_best_interface_prefers_covering_prefix() {
        let (routes, _) = parse_route_table(SAMPLE);
        let tables = Netif::for_tests(routes, Some("eth0"));

        let hit = tables.best_interface("192.168.2.40".parse().unwrap()).unwrap();
        assert_eq!(hit.name, "wlan0");

        // off-link target falls back to the default-route interface
        let miss = tables.best_interface("8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(miss.name, "eth0");
    }

    #[test]
    fn test_on_link() {
        let (routes, _) = parse_route_table(SAMPLE);
        let tables = Netif::for_tests(routes, Some("eth0"));
        assert!(tables.is_on_link("192.168.1.7".parse().unwrap()));
        assert!(!tables.is_on_link("1.1.1.1".parse().unwrap()));
    }
}
