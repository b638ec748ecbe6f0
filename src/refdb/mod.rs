//! Reference databases: ASN/country ranges and IEEE OUI vendors, cached
//! on disk in the `.mpz1` format.

pub mod asn;
pub mod cache;
pub mod oui;

pub use asn::{AsnDb, AsnLoad, AsnRow, AsnStore, CacheEntry, NullAsnStore};
pub use oui::{OuiDb, OuiEntry};
