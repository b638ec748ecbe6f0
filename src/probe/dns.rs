//! Reverse DNS lookups via the system resolver.

use std::net::IpAddr;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;

/// Outer bound on one resolver exchange.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolve `addr` back to a name. An answer that is just the address
/// spelled out means the resolver had no PTR record: `NoDnsNames`.
pub async fn reverse_lookup(
    cancel: &CancellationToken,
    addr: IpAddr,
) -> Result<String, ProbeError> {
    let lookup = tokio::time::timeout(
        LOOKUP_TIMEOUT,
        tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr)),
    );
    let result = tokio::select! {
        _ = cancel.cancelled() => return Err(ProbeError::NoResponseFromRemote),
        result = lookup => match result {
            Err(_) => return Err(ProbeError::NoResponseFromRemote),
            Ok(joined) => joined.map_err(|e| ProbeError::Io(std::io::Error::other(e)))?,
        },
    };

    match result {
        Ok(name) if name.parse::<IpAddr>().is_ok() => Err(ProbeError::NoDnsNames),
        Ok(name) if name.is_empty() => Err(ProbeError::NoDnsNames),
        Ok(name) => Ok(name),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ProbeError::NoDnsNames),
        Err(e) => Err(ProbeError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_resolves_or_reports_no_names() {
        // environments differ on whether 127.0.0.1 carries a PTR record;
        // both outcomes are acceptable, anything else is not
        let result = reverse_lookup(&CancellationToken::new(), "127.0.0.1".parse().unwrap()).await;
        match result {
            Ok(name) => assert!(!name.is_empty()),
            Err(ProbeError::NoDnsNames) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
