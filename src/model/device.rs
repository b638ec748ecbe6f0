//! Device records and the merge semantics used by store updates.

use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Mac;

/// Closed set of labels a device can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tag {
    /// The hardware address is locally administered; no vendor exists.
    RandomizedMac,
}

/// Enrichment-owned metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMeta {
    pub dns_name: String,
    pub manufacturer: String,
    /// Owning AS, looked up for globally routable addresses only.
    pub asn: String,
    pub tags: Vec<Tag>,
}

/// Port-scan state for a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub ports: Vec<u16>,
    pub tls_ports: Vec<u16>,
    pub last_scan: Option<DateTime<Utc>>,
    pub is_server: bool,
}

/// SNMP probe state for a device. Community and port are remembered once a
/// credential pair answers so later passes skip the search grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnmpInfo {
    pub last_check: Option<DateTime<Utc>>,
    pub community: String,
    pub port: u16,
    pub name: String,
    pub description: String,
}

/// A known endpoint. Uniqueness is by `addr`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub addr: IpAddr,
    pub mac: Option<Mac>,
    pub meta: DeviceMeta,
    pub server: ServerInfo,
    pub snmp: SnmpInfo,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Dirty flag: set by any mutator, cleared when the store persists.
    #[serde(skip)]
    pub updated: bool,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mac: None,
            meta: DeviceMeta::default(),
            server: ServerInfo::default(),
            snmp: SnmpInfo::default(),
            first_seen: None,
            last_seen: None,
            updated: false,
        }
    }
}

impl Device {
    pub fn new(addr: IpAddr) -> Self {
        Self {
            addr,
            ..Self::default()
        }
    }

    pub fn with_mac(addr: IpAddr, mac: Mac) -> Self {
        Self {
            addr,
            mac: Some(mac),
            ..Self::default()
        }
    }

    pub fn set_dns_name(&mut self, name: impl Into<String>) {
        self.meta.dns_name = name.into();
        self.updated = true;
    }

    pub fn set_manufacturer(&mut self, manufacturer: impl Into<String>) {
        self.meta.manufacturer = manufacturer.into();
        self.updated = true;
    }

    pub fn set_asn(&mut self, asn: impl Into<String>) {
        self.meta.asn = asn.into();
        self.updated = true;
    }

    pub fn add_tag(&mut self, tag: Tag) {
        if !self.meta.tags.contains(&tag) {
            self.meta.tags.push(tag);
            self.updated = true;
        }
    }

    pub fn remove_tag(&mut self, tag: Tag) {
        if let Some(idx) = self.meta.tags.iter().position(|t| *t == tag) {
            self.meta.tags.swap_remove(idx);
            self.updated = true;
        }
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.meta.tags.contains(&tag)
    }

    pub fn mark_seen(&mut self, at: DateTime<Utc>) {
        if self.first_seen.is_none() {
            self.first_seen = Some(at);
        }
        self.last_seen = Some(at);
        self.updated = true;
    }

    /// Last-writer-wins overlay: any populated field of `other` replaces
    /// the field here. Used by store updates.
    pub fn merge(&mut self, other: &Device) {
        if let Some(mac) = other.mac {
            self.mac = Some(mac);
        }
        if !other.meta.dns_name.is_empty() {
            self.meta.dns_name = other.meta.dns_name.clone();
        }
        if !other.meta.manufacturer.is_empty() {
            self.meta.manufacturer = other.meta.manufacturer.clone();
        }
        if !other.meta.asn.is_empty() {
            self.meta.asn = other.meta.asn.clone();
        }
        for tag in &other.meta.tags {
            if !self.meta.tags.contains(tag) {
                self.meta.tags.push(*tag);
            }
        }
        if !other.server.ports.is_empty() {
            self.server.ports = other.server.ports.clone();
        }
        if !other.server.tls_ports.is_empty() {
            self.server.tls_ports = other.server.tls_ports.clone();
        }
        if other.server.last_scan.is_some() {
            self.server.last_scan = other.server.last_scan;
        }
        if other.server.is_server {
            self.server.is_server = true;
        }
        if other.snmp.last_check.is_some() {
            self.snmp.last_check = other.snmp.last_check;
        }
        if !other.snmp.community.is_empty() {
            self.snmp.community = other.snmp.community.clone();
            self.snmp.port = other.snmp.port;
        }
        if !other.snmp.name.is_empty() {
            self.snmp.name = other.snmp.name.clone();
        }
        if !other.snmp.description.is_empty() {
            self.snmp.description = other.snmp.description.clone();
        }
        if other.first_seen.is_some() && self.first_seen.is_none() {
            self.first_seen = other.first_seen;
        }
        if other.last_seen.is_some() {
            self.last_seen = other.last_seen;
        }
        self.updated = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_mutators_set_dirty_flag() {
        let mut d = Device::new(addr("192.168.1.2"));
        assert!(!d.updated);
        d.set_dns_name("printer.lan");
        assert!(d.updated);
    }

    #[test]
    fn test_tags_are_a_set() {
        let mut d = Device::new(addr("192.168.1.2"));
        d.add_tag(Tag::RandomizedMac);
        d.add_tag(Tag::RandomizedMac);
        assert_eq!(d.meta.tags.len(), 1);
        d.remove_tag(Tag::RandomizedMac);
        assert!(d.meta.tags.is_empty());
    }

    #[test]
    fn test_merge_overlays_populated_fields() {
        let mut base = Device::new(addr("192.168.1.2"));
        base.meta.dns_name = "old.lan".into();
        base.server.ports = vec![22];

        let mut patch = Device::new(addr("192.168.1.2"));
        patch.meta.dns_name = "new.lan".into();
        patch.mac = Some("aa:bb:cc:dd:ee:ff".parse().unwrap());

        base.merge(&patch);
        assert_eq!(base.meta.dns_name, "new.lan");
        assert_eq!(base.mac, Some("aa:bb:cc:dd:ee:ff".parse().unwrap()));
        // untouched by an empty patch field
        assert_eq!(base.server.ports, vec![22]);
        assert!(base.updated);
    }

    #[test]
    fn test_merge_keeps_existing_when_patch_empty() {
        let mut base = Device::new(addr("10.0.0.1"));
        base.meta.manufacturer = "Acme".into();
        let patch = Device::new(addr("10.0.0.1"));
        base.merge(&patch);
        assert_eq!(base.meta.manufacturer, "Acme");
    }
}
