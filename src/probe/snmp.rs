//! SNMPv2c system-group client.

use std::net::IpAddr;
use std::time::Duration;

use snmp2::{AsyncSession, Oid, Value};
use tokio_util::sync::CancellationToken;

use crate::error::ProbeError;

/// RFC 1213 system group: sysDescr.0 and sysName.0.
const SYS_DESCR: [u64; 9] = [1, 3, 6, 1, 2, 1, 1, 1, 0];
const SYS_NAME: [u64; 9] = [1, 3, 6, 1, 2, 1, 1, 5, 0];

/// The system information a device exposes over SNMP.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnmpSystemInfo {
    pub name: String,
    pub description: String,
}

/// Fetch sysName/sysDescr from `target` with one community string.
///
/// Unanswered requests surface as `NoResponseFromRemote`, ICMP port
/// unreachable as `ConnectionRefused`; both are routine while searching a
/// credential grid.
pub async fn get_system_info(
    cancel: &CancellationToken,
    target: IpAddr,
    community: &str,
    port: u16,
    timeout: Duration,
) -> Result<SnmpSystemInfo, ProbeError> {
    let agent = format!("{target}:{port}");
    let mut session = AsyncSession::new_v2c(&agent, community.as_bytes(), 0)
        .await
        .map_err(|e| ProbeError::Snmp(format!("session: {e:?}")))?;

    let name = get_string(cancel, &mut session, &SYS_NAME, timeout).await?;
    let description = get_string(cancel, &mut session, &SYS_DESCR, timeout).await?;

    Ok(SnmpSystemInfo { name, description })
}

async fn get_string(
    cancel: &CancellationToken,
    session: &mut AsyncSession,
    oid: &[u64],
    timeout: Duration,
) -> Result<String, ProbeError> {
    let oid = Oid::from(oid).map_err(|e| ProbeError::Snmp(format!("oid: {e:?}")))?;

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(ProbeError::NoResponseFromRemote),
        response = tokio::time::timeout(timeout, session.get(&oid)) => response,
    };
    let pdu = match response {
        Err(_) => return Err(ProbeError::NoResponseFromRemote),
        Ok(Err(e)) => return Err(classify_snmp_error(e)),
        Ok(Ok(pdu)) => pdu,
    };

    let mut varbinds = pdu.varbinds;
    match varbinds.next() {
        Some((_oid, Value::OctetString(bytes))) => {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
        Some((_oid, _other)) => Err(ProbeError::EmptyResponse),
        None => Err(ProbeError::EmptyResponse),
    }
}

/// ICMP port unreachable surfaces from the UDP socket as a refused
/// receive; everything else is an opaque protocol failure.
fn classify_snmp_error(e: snmp2::Error) -> ProbeError {
    let text = format!("{e:?}");
    if text.contains("efused") {
        ProbeError::ConnectionRefused
    } else if text.contains("imed") || text.contains("ouldBlock") {
        ProbeError::NoResponseFromRemote
    } else {
        ProbeError::Snmp(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unanswered_port_times_out() {
        // nothing listens on the discard port; the get must come back as
        // a timeout or refusal within the deadline
        let err = get_system_info(
            &CancellationToken::new(),
            "127.0.0.1".parse().unwrap(),
            "public",
            9, // discard
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
        assert!(
            matches!(
                err,
                ProbeError::NoResponseFromRemote | ProbeError::ConnectionRefused
            ),
            "got {err:?}"
        );
    }
}
