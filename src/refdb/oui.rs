//! IEEE OUI (MAC vendor) reference database.
//!
//! Built once from the registry text file, cached as mpz1, then consulted
//! read-only through an exact binary search on the 6-hex prefix.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::OuiConfig;
use crate::error::RefDbError;
use crate::model::Mac;
use crate::refdb::cache;

/// One assignment: uppercase 6-hex prefix and the registered vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OuiEntry {
    pub prefix: String,
    pub name: String,
}

/// The in-memory vendor index. Immutable once built.
#[derive(Debug, Default)]
pub struct OuiDb {
    entries: Vec<OuiEntry>,
}

impl OuiDb {
    /// An empty database; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build directly from entries, restoring the sort invariant.
    pub fn from_entries(mut entries: Vec<OuiEntry>) -> Self {
        entries.sort_by(|a, b| a.prefix.cmp(&b.prefix));
        Self { entries }
    }

    /// Load from the on-disk cache, building it from the IEEE registry
    /// when absent.
    pub async fn load(cfg: &OuiConfig) -> Result<Self, RefDbError> {
        let dir = Path::new(&cfg.directory);
        if cache::exists(dir, &cfg.filename) {
            let mut entries: Vec<OuiEntry> = cache::read(dir, &cfg.filename)?;
            entries.sort_by(|a, b| a.prefix.cmp(&b.prefix));
            debug!(entries = entries.len(), "oui cache loaded");
            return Ok(Self { entries });
        }

        info!(url = %cfg.url, "building oui database");
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        let text = client
            .get(&cfg.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let entries = parse_oui_text(&text);
        cache::write(dir, &cfg.filename, &entries)?;
        info!(entries = entries.len(), "oui database built");
        Ok(Self { entries })
    }

    /// The vendor registered for the MAC's OUI, if any.
    pub fn lookup(&self, mac: Mac) -> Option<&str> {
        if self.entries.is_empty() {
            return None;
        }
        let prefix = mac.oui_prefix();
        self.entries
            .binary_search_by(|entry| entry.prefix.as_str().cmp(prefix.as_str()))
            .ok()
            .map(|idx| self.entries[idx].name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Extract `(base 16)` assignment lines from the registry text.
///
/// The prefix sits before five spaces and the `(base 16)` marker; the
/// vendor name is the third tab-separated field of the line.
pub fn parse_oui_text(text: &str) -> Vec<OuiEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        if !line.contains("(base 16)") {
            continue;
        }
        let Some((prefix_part, _)) = line.split_once("     (base 16)") else {
            continue;
        };
        let prefix = prefix_part.trim();
        if prefix.len() != 6 || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            continue;
        }
        let name = match line.split('\t').nth(2) {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => continue,
        };
        entries.push(OuiEntry {
            prefix: prefix.to_ascii_uppercase(),
            name,
        });
    }
    entries.sort_by(|a, b| a.prefix.cmp(&b.prefix));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
OUI/MA-L                                                    Organization
company_id                                                  Organization
                                                            Address

28-6F-B9   (hex)\t\tNokia Shanghai Bell Co., Ltd.
286FB9     (base 16)\t\tNokia Shanghai Bell Co., Ltd.
\t\t\t\tNo.388 Ning Qiao Road
\t\t\t\tShanghai  201206
\t\t\t\tCN

00-1B-21   (hex)\t\tIntel Corporate
001B21     (base 16)\t\tIntel Corporate
\t\t\t\tLot 8, Jalan Hi-Tech 2/3
\t\t\t\tKulim Kedah 09000
\t\t\t\tMY
";

    #[test]
    fn test_parse_registry_text() {
        let entries = parse_oui_text(SAMPLE);
        assert_eq!(entries.len(), 2);
        // sorted by prefix
        assert_eq!(entries[0].prefix, "001B21");
        assert_eq!(entries[0].name, "Intel Corporate");
        assert_eq!(entries[1].prefix, "286FB9");
        assert_eq!(entries[1].name, "Nokia Shanghai Bell Co., Ltd.");
    }

    #[test]
    fn test_lookup() {
        let db = OuiDb::from_entries(vec![OuiEntry {
            prefix: "AABBCC".into(),
            name: "Acme".into(),
        }]);
        let hit: Mac = "aa:bb:cc:11:22:33".parse().unwrap();
        let miss: Mac = "ff:ee:dd:11:22:33".parse().unwrap();
        assert_eq!(db.lookup(hit), Some("Acme"));
        assert_eq!(db.lookup(miss), None);
        assert_eq!(OuiDb::empty().lookup(hit), None);
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let entries = parse_oui_text(SAMPLE);
        cache::write(dir.path(), "oui.mpz1", &entries).unwrap();
        let back: Vec<OuiEntry> = cache::read(dir.path(), "oui.mpz1").unwrap();
        assert_eq!(back, entries);
    }
}
