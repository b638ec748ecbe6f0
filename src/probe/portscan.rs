//! Concurrent TCP connect scanning over named port lists.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ProbeError;
use crate::pool::WorkerPool;

/// Ports frequently worth knowing about: remote access, mail, name
/// service, file sharing, databases, web and printing.
const COMMON_PORTS: [u16; 27] = [
    21, 22, 23, 25, 53, 80, 110, 111, 135, 139, 143, 161, 443, 445, 465, 587, 993, 995, 1723,
    3306, 3389, 5353, 5900, 8000, 8080, 8443, 9100,
];

/// Closed enumeration of scannable port sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortList {
    All,
    #[default]
    General,
    Privileged,
    Common,
}

impl PortList {
    pub fn ports(self) -> Vec<u16> {
        match self {
            PortList::All => (1..=65535).collect(),
            PortList::General => (1..=10000).collect(),
            PortList::Privileged => (1..=1024).collect(),
            PortList::Common => COMMON_PORTS.to_vec(),
        }
    }

    pub fn len(self) -> usize {
        match self {
            PortList::All => 65535,
            PortList::General => 10000,
            PortList::Privileged => 1024,
            PortList::Common => COMMON_PORTS.len(),
        }
    }

    pub fn is_empty(self) -> bool {
        false
    }
}

impl fmt::Display for PortList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortList::All => "all",
            PortList::General => "general",
            PortList::Privileged => "privileged",
            PortList::Common => "common",
        };
        f.write_str(s)
    }
}

impl FromStr for PortList {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(PortList::All),
            "general" => Ok(PortList::General),
            "privileged" => Ok(PortList::Privileged),
            "common" => Ok(PortList::Common),
            _ => Err(ProbeError::InvalidPortListString(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PortScanOpts {
    pub ports: PortList,
    pub max_workers: usize,
    pub response_timeout: Duration,
}

impl Default for PortScanOpts {
    fn default() -> Self {
        Self {
            ports: PortList::General,
            max_workers: 2,
            response_timeout: Duration::from_millis(100),
        }
    }
}

/// Scan every port of the selected list against `target` with a bounded
/// worker pool. Unanswered and refused ports are silent; any other dial
/// failure is logged and the port skipped. Result order is unspecified.
pub async fn scan_tcp_ports(
    cancel: &CancellationToken,
    target: IpAddr,
    opts: PortScanOpts,
) -> Result<Vec<u16>, ProbeError> {
    scan_ports(
        cancel,
        target,
        opts.ports.ports(),
        opts.max_workers,
        opts.response_timeout,
    )
    .await
}

/// Pool-driven scan over an explicit port vector.
pub(crate) async fn scan_ports(
    cancel: &CancellationToken,
    target: IpAddr,
    ports: Vec<u16>,
    max_workers: usize,
    response_timeout: Duration,
) -> Result<Vec<u16>, ProbeError> {
    if target.is_ipv6() {
        return Err(ProbeError::Ipv6Unsupported);
    }

    let pool = WorkerPool::new("portscan", move |port: u16| async move {
        dial(target, port, response_timeout).await
    });

    let (input_tx, input_rx) = mpsc::channel(max_workers.max(1));
    let mut handles = pool.run(cancel.clone(), max_workers, input_rx);

    let feeder = tokio::spawn(async move {
        for port in ports {
            if input_tx.send(port).await.is_err() {
                break;
            }
        }
    });

    let mut open = Vec::new();
    let mut output_open = true;
    let mut errors_open = true;
    while output_open || errors_open {
        tokio::select! {
            port = handles.output.recv(), if output_open => match port {
                Some(0) => {}
                Some(port) => open.push(port),
                None => output_open = false,
            },
            err = handles.errors.recv(), if errors_open => match err {
                Some(err) => warn!(target = %target, error = %err, "port dial failed"),
                None => errors_open = false,
            },
        }
    }
    let _ = feeder.await;
    let _ = handles.done.await;

    Ok(open)
}

/// One connect attempt: the open port on success, 0 for timeouts and
/// refusals, an error for anything else.
async fn dial(target: IpAddr, port: u16, response_timeout: Duration) -> Result<u16, ProbeError> {
    let addr = SocketAddr::new(target, port);
    match tokio::time::timeout(response_timeout, TcpStream::connect(addr)).await {
        Err(_) => Ok(0),
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(port)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => Ok(0),
        Ok(Err(e)) => Err(ProbeError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_list_string_round_trip() {
        for list in [
            PortList::All,
            PortList::General,
            PortList::Privileged,
            PortList::Common,
        ] {
            assert_eq!(list.to_string().parse::<PortList>().unwrap(), list);
        }
        // case-insensitive
        assert_eq!("COMMON".parse::<PortList>().unwrap(), PortList::Common);
        assert_eq!("Privileged".parse::<PortList>().unwrap(), PortList::Privileged);

        let err = "bogus".parse::<PortList>().unwrap_err();
        assert!(matches!(err, ProbeError::InvalidPortListString(s) if s == "bogus"));
    }

    #[test]
    fn test_port_list_ranges() {
        assert_eq!(PortList::All.ports().len(), 65535);
        assert_eq!(PortList::General.ports().len(), 10000);
        assert_eq!(PortList::Privileged.ports().last(), Some(&1024));
        let common = PortList::Common.ports();
        assert_eq!(common.len(), 27);
        assert!(common.contains(&22));
        assert!(common.contains(&443));
    }

    #[tokio::test]
    async fn test_scan_finds_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let open = scan_ports(
            &CancellationToken::new(),
            "127.0.0.1".parse().unwrap(),
            vec![port, 1],
            4,
            Duration::from_millis(250),
        )
        .await
        .unwrap();

        assert!(open.contains(&port));
        assert!(open.iter().all(|&p| p != 0));
        drop(listener);
    }

    #[tokio::test]
    async fn test_scan_rejects_ipv6() {
        let err = scan_tcp_ports(
            &CancellationToken::new(),
            "::1".parse().unwrap(),
            PortScanOpts::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProbeError::Ipv6Unsupported));
    }
}
