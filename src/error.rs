//! Error taxonomy shared across the probing, store and reference-db layers.

use std::net::IpAddr;

use thiserror::Error;

/// Errors raised by the active probing toolkit and the narrow enrichment
/// clients built on top of it.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The remote did not answer within the read deadline.
    #[error("no response from remote")]
    NoResponseFromRemote,

    /// The remote actively refused the connection.
    #[error("connection refused")]
    ConnectionRefused,

    #[error("invalid address {0}")]
    InvalidAddr(IpAddr),

    /// The probing layer only speaks IPv4.
    #[error("ipv6 not supported")]
    Ipv6Unsupported,

    /// Raw-socket probing is only implemented for linux and darwin.
    #[error("os not supported")]
    OsNotSupported,

    /// An intermediate hop answered with ICMP Time Exceeded.
    #[error("ttl exceeded")]
    TtlExceeded,

    /// A reply arrived but carried no usable answer.
    #[error("empty response")]
    EmptyResponse,

    /// Reverse lookup produced zero names.
    #[error("no dns names for address")]
    NoDnsNames,

    #[error("invalid port list {0:?}")]
    InvalidPortListString(String),

    /// The hardware address is locally administered (privacy MAC).
    #[error("randomized mac address")]
    RandomizedMacAddress,

    /// No interface covers the target and no default route is known.
    #[error("no usable interface for {0}")]
    NoInterface(IpAddr),

    #[error("snmp: {0}")]
    Snmp(String),

    #[error("tls: {0}")]
    Tls(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Timeouts and refusals are expected noise on scanning paths.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ProbeError::NoResponseFromRemote | ProbeError::ConnectionRefused
        )
    }
}

/// Errors raised by the combined network/device store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("network exists")]
    NetworkExists,

    #[error("device exists")]
    DeviceExists,

    #[error("network not found")]
    NetworkNotFound,

    #[error("device not found")]
    DeviceNotFound,

    #[error("platform not supported")]
    PlatformNotSupported,

    /// The three per-metric series must line up point for point.
    #[error("timeseries length mismatch: {0} vs {1}")]
    SeriesLengthMismatch(usize, usize),

    #[error("bad whisper file: {0}")]
    BadWhisperFile(String),

    #[error("invalid retention {0:?}")]
    InvalidRetention(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("snapshot encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("snapshot decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Errors raised while building or reading the ASN/OUI reference databases.
#[derive(Debug, Error)]
pub enum RefDbError {
    #[error("download: {0}")]
    Download(#[from] reqwest::Error),

    #[error("csv: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid ip range {0:?}")]
    InvalidRange(String),

    #[error("malformed row: {0}")]
    MalformedRow(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("cache encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("cache decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}
