//! ASN/country reference database.
//!
//! First run downloads the ASN and country CSV feeds, joins country codes
//! onto ASN ranges and persists a slim lookup table as mpz1; later runs
//! read the cache. Lookups binary-search a from-sorted range table with a
//! contains-aware comparator.

use std::cmp::Ordering;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::AsnConfig;
use crate::error::RefDbError;
use crate::model::IpRange;
use crate::refdb::cache;

/// Slim lookup row kept in memory and in the mpz1 cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub asn: String,
    pub range: IpRange,
}

/// Full row pushed to an [`AsnStore`] during a load.
#[derive(Debug, Clone, PartialEq)]
pub struct AsnRow {
    pub range: IpRange,
    pub asn: String,
    pub name: String,
    pub country: String,
}

/// Capability abstraction over whatever wants the full ASN rows.
pub trait AsnStore: Send + Sync {
    /// Begin a bulk load.
    fn start_load(&self) -> Box<dyn AsnLoad>;
}

/// One in-flight bulk load; `finish` is always invoked with the outcome.
pub trait AsnLoad: Send {
    fn upsert(&mut self, cancel: &CancellationToken, row: &AsnRow) -> anyhow::Result<()>;
    fn finish(self: Box<Self>, outcome: Result<(), &RefDbError>);
}

/// Store that discards rows; used when no alternate backing store is
/// wired in.
pub struct NullAsnStore;

impl AsnStore for NullAsnStore {
    fn start_load(&self) -> Box<dyn AsnLoad> {
        Box::new(NullAsnLoad { rows: 0 })
    }
}

struct NullAsnLoad {
    rows: usize,
}

impl AsnLoad for NullAsnLoad {
    fn upsert(&mut self, _cancel: &CancellationToken, _row: &AsnRow) -> anyhow::Result<()> {
        self.rows += 1;
        Ok(())
    }

    fn finish(self: Box<Self>, outcome: Result<(), &RefDbError>) {
        match outcome {
            Ok(()) => debug!(rows = self.rows, "asn load finished"),
            Err(e) => debug!(rows = self.rows, error = %e, "asn load aborted"),
        }
    }
}

/// The in-memory ASN index. Immutable once built.
#[derive(Debug, Default)]
pub struct AsnDb {
    entries: Vec<CacheEntry>,
}

impl AsnDb {
    /// An empty database; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build directly from entries, restoring the sort invariant.
    pub fn from_entries(mut entries: Vec<CacheEntry>) -> Self {
        entries.sort_by_key(|e| e.range.from());
        Self { entries }
    }

    /// Load from the on-disk cache, building it from the network feeds
    /// when absent. Build failures are fatal to the caller by design:
    /// reference data is loaded once at startup.
    pub async fn load(
        cancel: &CancellationToken,
        cfg: &AsnConfig,
        store: &dyn AsnStore,
    ) -> Result<Self, RefDbError> {
        let dir = Path::new(&cfg.directory);
        if cache::exists(dir, &cfg.cache_filename) {
            let mut entries: Vec<CacheEntry> = cache::read(dir, &cfg.cache_filename)?;
            entries.sort_by_key(|e| e.range.from());
            debug!(entries = entries.len(), "asn cache loaded");
            return Ok(Self { entries });
        }

        info!(url = %cfg.asn_url, "building asn database");
        let asn_text = download(&cfg.asn_url).await?;
        let country_text = download(&cfg.country_url).await?;

        let mut rows = parse_asn_csv(&asn_text)?;
        let countries = parse_country_csv(&country_text)?;
        join_countries(&mut rows, &countries);

        let entries: Vec<CacheEntry> = rows
            .iter()
            .map(|r| CacheEntry {
                asn: r.asn.clone(),
                range: r.range,
            })
            .collect();
        cache::write(dir, &cfg.cache_filename, &entries)?;

        let mut load = store.start_load();
        let mut outcome = Ok(());
        for row in &rows {
            if let Err(e) = load.upsert(cancel, row) {
                outcome = Err(RefDbError::MalformedRow(e.to_string()));
                break;
            }
        }
        load.finish(outcome.as_ref().map(|_| ()));
        outcome?;

        info!(entries = entries.len(), "asn database built");
        Ok(Self { entries })
    }

    /// The ASN owning `addr`, if any range contains it.
    pub fn find_asn(&self, addr: IpAddr) -> Option<&str> {
        self.entries
            .binary_search_by(|entry| compare_range(&entry.range, addr))
            .ok()
            .map(|idx| self.entries[idx].asn.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Orders a range against a probe address, reporting equality when the
/// range contains it.
fn compare_range(range: &IpRange, addr: IpAddr) -> Ordering {
    if range.contains(addr) {
        Ordering::Equal
    } else {
        range.from().cmp(&addr)
    }
}

async fn download(url: &str) -> Result<String, RefDbError> {
    // feed hosts rotate certificates faster than we care to track
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let body = client.get(url).send().await?.error_for_status()?.text().await?;
    Ok(body)
}

/// Rows of `fromIP, toIP, asnumber, asname`.
fn parse_asn_csv(text: &str) -> Result<Vec<AsnRow>, RefDbError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() < 4 {
            return Err(RefDbError::MalformedRow(format!("{record:?}")));
        }
        let range = parse_range(&record[0], &record[1])?;
        rows.push(AsnRow {
            range,
            asn: record[2].trim().to_string(),
            name: record[3].trim().to_string(),
            country: String::new(),
        });
    }
    rows.sort_by_key(|r| r.range.from());
    Ok(rows)
}

/// Rows of `fromIP, toIP, ISO3166alpha2`.
fn parse_country_csv(text: &str) -> Result<Vec<(IpRange, String)>, RefDbError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.len() < 3 {
            return Err(RefDbError::MalformedRow(format!("{record:?}")));
        }
        rows.push((parse_range(&record[0], &record[1])?, record[2].trim().to_string()));
    }
    rows.sort_by_key(|(range, _)| range.from());
    Ok(rows)
}

fn parse_range(from: &str, to: &str) -> Result<IpRange, RefDbError> {
    let spec = format!("{}-{}", from.trim(), to.trim());
    spec.parse().map_err(RefDbError::InvalidRange)
}

/// Stamp each ASN row with the country whose range covers its lower
/// address. `countries` must be sorted by range start.
fn join_countries(rows: &mut [AsnRow], countries: &[(IpRange, String)]) {
    for row in rows {
        let probe = row.range.from();
        if let Ok(idx) =
            countries.binary_search_by(|(range, _)| compare_range(range, probe))
        {
            row.country = countries[idx].1.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_find_asn() {
        let db = AsnDb {
            entries: vec![CacheEntry {
                asn: "AS1".into(),
                range: "1.0.0.0-1.0.0.255".parse().unwrap(),
            }],
        };
        assert_eq!(db.find_asn(addr("1.0.0.42")), Some("AS1"));
        assert_eq!(db.find_asn(addr("2.0.0.1")), None);
        assert_eq!(AsnDb::empty().find_asn(addr("1.0.0.42")), None);
    }

    #[test]
    fn test_find_asn_many_ranges() {
        let ranges = [
            ("1.0.0.0-1.0.0.255", "AS1"),
            ("1.0.4.0-1.0.7.255", "AS2"),
            ("8.8.8.0-8.8.8.255", "AS15169"),
            ("100.0.0.0-100.255.255.255", "AS100"),
        ];
        let mut entries: Vec<CacheEntry> = ranges
            .iter()
            .map(|(r, a)| CacheEntry {
                asn: a.to_string(),
                range: r.parse().unwrap(),
            })
            .collect();
        entries.sort_by_key(|e| e.range.from());
        // sorted invariant: keys are non-decreasing
        assert!(entries.windows(2).all(|w| w[0].range.from() <= w[1].range.from()));

        let db = AsnDb { entries };
        assert_eq!(db.find_asn(addr("8.8.8.8")), Some("AS15169"));
        assert_eq!(db.find_asn(addr("100.64.1.2")), Some("AS100"));
        assert_eq!(db.find_asn(addr("1.0.2.1")), None); // gap between ranges
    }

    #[test]
    fn test_parse_and_join() {
        let asn_csv = "1.0.0.0,1.0.0.255,AS1,One Net\n1.0.4.0,1.0.7.255,AS2,Two Net\n";
        let country_csv = "1.0.0.0,1.0.3.255,AU\n1.0.4.0,1.0.7.255,CN\n";

        let mut rows = parse_asn_csv(asn_csv).unwrap();
        let countries = parse_country_csv(country_csv).unwrap();
        join_countries(&mut rows, &countries);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].asn, "AS1");
        assert_eq!(rows[0].name, "One Net");
        assert_eq!(rows[0].country, "AU");
        assert_eq!(rows[1].country, "CN");
    }

    #[test]
    fn test_parse_rejects_short_rows() {
        assert!(parse_asn_csv("1.0.0.0,1.0.0.255\n").is_err());
        assert!(parse_country_csv("1.0.0.0,1.0.0.255\n").is_err());
    }

    #[test]
    fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let entries = vec![
            CacheEntry {
                asn: "AS1".into(),
                range: "1.0.0.0-1.0.0.255".parse().unwrap(),
            },
            CacheEntry {
                asn: "AS2".into(),
                range: "1.0.4.0-1.0.7.255".parse().unwrap(),
            },
        ];
        cache::write(dir.path(), "cache.mpz1", &entries).unwrap();
        let back: Vec<CacheEntry> = cache::read(dir.path(), "cache.mpz1").unwrap();
        assert_eq!(back, entries);
    }
}
