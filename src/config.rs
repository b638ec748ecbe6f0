//! Runtime configuration.
//!
//! Plain records with documented defaults. Values load from an optional
//! `mason.{toml,yaml,json}` file and `MASON_*` environment overrides; the
//! CLI only picks the file and the data directory.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parse a human duration like `20ms`, `1s`, `10m`, `24h`, `7d` or `3w`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    let ms = match unit {
        "ms" => n,
        "s" => n * 1_000,
        "m" => n * 60_000,
        "h" => n * 3_600_000,
        "d" => n * 86_400_000,
        "w" => n * 7 * 86_400_000,
        _ => return Err(format!("unknown duration unit {unit:?}")),
    };
    Ok(Duration::from_millis(ms))
}

/// Render a duration back in the largest exact unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    for (div, unit) in [
        (7 * 86_400_000, "w"),
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ] {
        if ms > 0 && ms % div == 0 {
            return format!("{}{}", ms / div, unit);
        }
    }
    format!("{ms}ms")
}

/// Serde adapter for `Duration` fields written as `20ms` / `7d` strings.
pub mod duration_str {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub asn: AsnConfig,
    pub oui: OuiConfig,
    pub store: StoreConfig,
    pub enrichment: EnrichmentConfig,
    pub discovery: DiscoveryConfig,
    pub pinger: PingerConfig,
    /// Networks to manage, as `name=cidr` or bare `cidr` strings.
    pub networks: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            asn: AsnConfig::default(),
            oui: OuiConfig::default(),
            store: StoreConfig::default(),
            enrichment: EnrichmentConfig::default(),
            discovery: DiscoveryConfig::default(),
            pinger: PingerConfig::default(),
            networks: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the given file (or `mason.*` in the working directory)
    /// layered under `MASON_*` environment overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p)),
            None => builder.add_source(config::File::with_name("mason").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("MASON")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );
        Ok(builder.build()?.try_deserialize()?)
    }
}

/// ASN/country reference database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AsnConfig {
    pub enabled: bool,
    #[serde(rename = "asnurl")]
    pub asn_url: String,
    #[serde(rename = "countryurl")]
    pub country_url: String,
    pub directory: String,
    #[serde(rename = "cachefilename")]
    pub cache_filename: String,
}

impl Default for AsnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            asn_url: "https://raw.githubusercontent.com/sapics/ip-location-db/main/asn/asn-ipv4.csv".into(),
            country_url: "https://raw.githubusercontent.com/sapics/ip-location-db/main/geo-whois-asn-country/geo-whois-asn-country-ipv4.csv".into(),
            directory: "data/asn".into(),
            cache_filename: "cache.mpz1".into(),
        }
    }
}

/// IEEE OUI reference database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OuiConfig {
    pub enabled: bool,
    pub url: String,
    pub directory: String,
    pub filename: String,
}

impl Default for OuiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "https://standards-oui.ieee.org/oui/oui.txt".into(),
            directory: "data/oui".into(),
            filename: "oui.mpz1".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub combo: ComboStoreConfig,
}

/// Combined store: snapshot directory and whisper retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComboStoreConfig {
    pub enabled: bool,
    pub directory: String,
    /// `granularity:length` pairs, highest precision first.
    #[serde(rename = "wspretention")]
    pub wsp_retention: String,
}

impl Default for ComboStoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: "data".into(),
            wsp_retention: "10m:3d,1h:3w".into(),
        }
    }
}

/// Enrichment pipeline settings, one sub-group per pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    #[serde(rename = "maxworkers")]
    pub max_workers: usize,
    pub dns: DnsPassConfig,
    pub oui: OuiPassConfig,
    pub portscan: PortScanConfig,
    pub snmp: SnmpConfig,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 2,
            dns: DnsPassConfig::default(),
            oui: OuiPassConfig::default(),
            portscan: PortScanConfig::default(),
            snmp: SnmpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsPassConfig {
    pub enabled: bool,
}

impl Default for DnsPassConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OuiPassConfig {
    pub enabled: bool,
}

impl Default for OuiPassConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortScanConfig {
    pub enabled: bool,
    #[serde(rename = "maxworkers")]
    pub max_workers: usize,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Rescan period for ordinary devices.
    #[serde(rename = "defaultscaninterval", with = "duration_str")]
    pub default_scan_interval: Duration,
    /// Rescan period for devices with open ports.
    #[serde(rename = "serverscaninterval", with = "duration_str")]
    pub server_scan_interval: Duration,
    #[serde(rename = "portlist")]
    pub port_list: String,
}

impl Default for PortScanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_workers: 2,
            timeout: Duration::from_millis(20),
            default_scan_interval: parse_duration("7d").unwrap(),
            server_scan_interval: parse_duration("24h").unwrap(),
            port_list: "general".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnmpConfig {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Communities tried against every port below, in order.
    pub community: Vec<String>,
    pub ports: Vec<u16>,
}

impl Default for SnmpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_millis(50),
            community: vec!["public".into()],
            ports: vec![161],
        }
    }
}

/// Discovery sweep settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub interval: Duration,
    #[serde(rename = "maxworkers")]
    pub max_workers: usize,
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: parse_duration("1h").unwrap(),
            max_workers: 32,
            timeout: Duration::from_millis(100),
        }
    }
}

/// Performance pinger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PingerConfig {
    pub enabled: bool,
    #[serde(with = "duration_str")]
    pub interval: Duration,
    pub count: usize,
    #[serde(with = "duration_str")]
    pub between: Duration,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: parse_duration("10m").unwrap(),
            count: 3,
            between: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("20ms").unwrap(), Duration::from_millis(20));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert_eq!(parse_duration("3w").unwrap(), Duration::from_secs(21 * 86_400));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("tenminutes").is_err());
        assert!(parse_duration("10y").is_err());
    }

    #[test]
    fn test_format_duration_round_trip() {
        for s in ["20ms", "1s", "10m", "24h", "7d", "3w"] {
            let d = parse_duration(s).unwrap();
            assert_eq!(format_duration(d), s);
        }
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = Config::default();
        assert!(!cfg.asn.enabled);
        assert_eq!(cfg.asn.cache_filename, "cache.mpz1");
        assert_eq!(cfg.oui.filename, "oui.mpz1");
        assert_eq!(cfg.store.combo.wsp_retention, "10m:3d,1h:3w");
        assert!(cfg.enrichment.enabled);
        assert_eq!(cfg.enrichment.max_workers, 2);
        assert_eq!(cfg.enrichment.portscan.timeout, Duration::from_millis(20));
        assert_eq!(cfg.enrichment.snmp.timeout, Duration::from_millis(50));
        assert_eq!(cfg.enrichment.snmp.community, vec!["public".to_string()]);
        assert_eq!(cfg.enrichment.snmp.ports, vec![161]);
        assert_eq!(cfg.enrichment.portscan.port_list, "general");
    }
}
