//! ICMPv4 echo over raw and unprivileged datagram sockets, traceroute and
//! response statistics.
//!
//! The raw path (`ip4:icmp`) needs CAP_NET_RAW and supports a classic-BPF
//! filter matching our echo identifier; the datagram path (`udp4`) relies
//! on the kernel to demultiplex replies by socket. IPv6 targets are
//! rejected outright.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pnet::packet::icmp::echo_reply::EchoReplyPacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes};
use pnet::packet::Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::ProbeError;

/// Fixed echo payload.
const ECHO_PAYLOAD: &[u8] = b"HELLO-R-U-THERE";

/// Largest datagram we care to read: worst-case IP header plus ICMP quote.
const RECV_BUFFER_SIZE: usize = 1500;

const TRACEROUTE_MAX_HOPS: u8 = 20;
const TRACEROUTE_PROBES_PER_HOP: usize = 5;

static PROCESS_ICMP_ID: OnceLock<u16> = OnceLock::new();

/// The per-process echo identifier, chosen randomly on first use.
pub fn process_icmp_id() -> u16 {
    *PROCESS_ICMP_ID.get_or_init(rand::random)
}

/// Socket flavor used for the echo exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    /// `ip4:icmp` packet socket; privileged, identifier is ours to match.
    Raw,
    /// `udp4` unprivileged ICMP socket; the kernel owns the identifier.
    Datagram,
}

#[derive(Debug, Clone)]
pub struct EchoOpts {
    pub mode: EchoMode,
    pub listen_address: Ipv4Addr,
    pub count: usize,
    /// Pause between probes of a multi-count run.
    pub between: Duration,
    pub read_timeout: Duration,
    pub ttl: u32,
    pub id: u16,
    /// Install the identifier BPF filter on the raw socket (linux).
    pub bpf_filter: bool,
    /// Record failed probes and keep going instead of stopping at the
    /// first error.
    pub allow_all_errors: bool,
}

impl Default for EchoOpts {
    fn default() -> Self {
        Self {
            mode: EchoMode::Datagram,
            listen_address: Ipv4Addr::UNSPECIFIED,
            count: 1,
            between: Duration::from_secs(1),
            read_timeout: Duration::from_millis(100),
            ttl: 64,
            id: process_icmp_id(),
            bpf_filter: true,
            allow_all_errors: false,
        }
    }
}

/// Outcome of one echo probe. `error` carries the per-probe failure;
/// transport-setup failures surface as the outer `Result` instead.
#[derive(Debug)]
pub struct EchoResponse {
    pub peer: IpAddr,
    pub start: DateTime<Utc>,
    pub elapsed: Duration,
    pub error: Option<ProbeError>,
}

impl EchoResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate over a probe run. Loss is the ratio of failed to successful
/// probes, not a probability.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EchoStatistics {
    pub count: usize,
    pub success_count: usize,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub std_dev: Duration,
    pub loss: f64,
    pub total_elapsed: Duration,
}

/// Run `count` echo probes against `target`, sleeping `between` in the
/// gaps. Cancellation is observed before each probe. The returned vector
/// is partial when a probe fails and `allow_all_errors` is unset.
pub async fn icmp4_echo(
    cancel: &CancellationToken,
    target: IpAddr,
    opts: EchoOpts,
) -> Result<Vec<EchoResponse>, ProbeError> {
    let IpAddr::V4(target) = target else {
        return Err(ProbeError::Ipv6Unsupported);
    };

    let mut responses = Vec::with_capacity(opts.count);
    for seq in 1..=opts.count as u16 {
        if cancel.is_cancelled() {
            break;
        }
        let probe_opts = opts.clone();
        let response =
            tokio::task::spawn_blocking(move || echo_once(target, seq, &probe_opts))
                .await
                .map_err(|e| ProbeError::Io(io::Error::other(e)))??;
        let failed = !response.is_success();
        responses.push(response);
        if failed && !opts.allow_all_errors {
            break;
        }
        if usize::from(seq) < opts.count && !opts.between.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(opts.between) => {}
            }
        }
    }
    Ok(responses)
}

/// Walk toward `target` raising the TTL one hop at a time. Raw mode and
/// error recording are forced; the walk ends the moment one sub-probe
/// comes back clean (the terminal hop answered).
pub async fn traceroute4(
    cancel: &CancellationToken,
    target: IpAddr,
    opts: EchoOpts,
) -> Result<Vec<EchoResponse>, ProbeError> {
    let mut hop_opts = EchoOpts {
        mode: EchoMode::Raw,
        allow_all_errors: true,
        count: 1,
        ..opts
    };

    let mut responses = Vec::new();
    for hop in 0..TRACEROUTE_MAX_HOPS {
        hop_opts.ttl = u32::from(hop) + 1;
        for _ in 0..TRACEROUTE_PROBES_PER_HOP {
            if cancel.is_cancelled() {
                return Ok(responses);
            }
            let mut batch = icmp4_echo(cancel, target, hop_opts.clone()).await?;
            let Some(response) = batch.pop() else {
                return Ok(responses);
            };
            let terminal = response.is_success();
            responses.push(response);
            if terminal {
                return Ok(responses);
            }
        }
    }
    Ok(responses)
}

/// Single blocking echo exchange.
fn echo_once(target: Ipv4Addr, seq: u16, opts: &EchoOpts) -> Result<EchoResponse, ProbeError> {
    let socket = open_socket(opts)?;

    let mut request_buffer =
        vec![0u8; MutableEchoRequestPacket::minimum_packet_size() + ECHO_PAYLOAD.len()];
    let len = request_buffer.len();
    {
        let mut echo = MutableEchoRequestPacket::new(&mut request_buffer)
            .ok_or_else(|| ProbeError::Io(io::Error::other("echo buffer too small")))?;
        echo.set_icmp_type(IcmpTypes::EchoRequest);
        echo.set_icmp_code(IcmpCode(0));
        echo.set_identifier(opts.id);
        echo.set_sequence_number(seq);
        echo.set_payload(ECHO_PAYLOAD);
        let checksum = pnet::util::checksum(echo.packet(), 1);
        echo.set_checksum(checksum);
    }

    let start_wall = Utc::now();
    let start = Instant::now();
    let dest = SockAddr::from(SocketAddr::new(IpAddr::V4(target), 0));
    socket.send_to(&request_buffer[..len], &dest)?;

    let expect_id = match opts.mode {
        EchoMode::Raw => Some(opts.id),
        EchoMode::Datagram => None,
    };

    let deadline = start + opts.read_timeout;
    let mut recv_buffer: [MaybeUninit<u8>; RECV_BUFFER_SIZE] =
        [MaybeUninit::uninit(); RECV_BUFFER_SIZE];
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        socket.set_read_timeout(Some(deadline - now))?;

        let (read, peer) = match socket.recv_from(&mut recv_buffer) {
            Ok(r) => r,
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                break;
            }
            Err(e) => return Err(ProbeError::Io(e)),
        };
        let elapsed = start.elapsed();
        let datagram =
            unsafe { std::slice::from_raw_parts(recv_buffer.as_ptr() as *const u8, read) };
        let peer_addr = peer
            .as_socket()
            .map(|s| s.ip())
            .unwrap_or(IpAddr::V4(target));

        match classify_reply(datagram, peer_addr, target, expect_id) {
            ReplyClass::Success => {
                return Ok(EchoResponse {
                    peer: peer_addr,
                    start: start_wall,
                    elapsed,
                    error: None,
                });
            }
            ReplyClass::TtlExceeded => {
                return Ok(EchoResponse {
                    peer: peer_addr,
                    start: start_wall,
                    elapsed,
                    error: Some(ProbeError::TtlExceeded),
                });
            }
            ReplyClass::Ignore => {
                trace!(target = %target, peer = %peer_addr, "ignoring unrelated icmp datagram");
            }
        }
    }

    Ok(EchoResponse {
        peer: IpAddr::V4(target),
        start: start_wall,
        elapsed: start.elapsed(),
        error: Some(ProbeError::NoResponseFromRemote),
    })
}

fn open_socket(opts: &EchoOpts) -> Result<Socket, ProbeError> {
    let socket = match opts.mode {
        EchoMode::Raw => {
            if !cfg!(any(target_os = "linux", target_os = "macos", target_os = "ios")) {
                return Err(ProbeError::OsNotSupported);
            }
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
            if opts.bpf_filter {
                attach_icmp_id_filter(&socket, opts.id)?;
            }
            socket
        }
        EchoMode::Datagram => Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?,
    };
    socket.bind(&SockAddr::from(SocketAddr::new(
        IpAddr::V4(opts.listen_address),
        0,
    )))?;
    socket.set_ttl(opts.ttl)?;
    socket.set_read_timeout(Some(opts.read_timeout))?;
    Ok(socket)
}

/// Attach the classic-BPF program that keeps only echo replies carrying
/// our identifier. Offsets are from the start of the received datagram,
/// which on a raw ICMP socket includes the 20-byte IP header.
#[cfg(target_os = "linux")]
fn attach_icmp_id_filter(socket: &Socket, id: u16) -> Result<(), ProbeError> {
    use std::os::fd::AsRawFd;

    const BPF_LD: u16 = 0x00;
    const BPF_H: u16 = 0x08;
    const BPF_B: u16 = 0x10;
    const BPF_ABS: u16 = 0x20;
    const BPF_JMP: u16 = 0x05;
    const BPF_JEQ: u16 = 0x10;
    const BPF_K: u16 = 0x00;
    const BPF_RET: u16 = 0x06;

    let filter = |code, jt, jf, k| libc::sock_filter { code, jt, jf, k };
    let program = [
        // icmp type must be echo-reply (0)
        filter(BPF_LD | BPF_B | BPF_ABS, 0, 0, 20),
        filter(BPF_JMP | BPF_JEQ | BPF_K, 0, 3, 0),
        // identifier sits 4 bytes into the icmp header
        filter(BPF_LD | BPF_H | BPF_ABS, 0, 0, 24),
        filter(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, u32::from(id)),
        filter(BPF_RET | BPF_K, 0, 0, 1500),
        filter(BPF_RET | BPF_K, 0, 0, 0),
    ];
    let prog = libc::sock_fprog {
        len: program.len() as u16,
        filter: program.as_ptr() as *mut libc::sock_filter,
    };
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &prog as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(ProbeError::Io(io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn attach_icmp_id_filter(_socket: &Socket, _id: u16) -> Result<(), ProbeError> {
    // the darwin raw path reads unfiltered and classifies in userspace
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ReplyClass {
    Success,
    TtlExceeded,
    Ignore,
}

/// Classify one received datagram against the probe we sent. Raw sockets
/// (and the darwin datagram path) deliver the IP header; strip it before
/// reading the ICMP message.
fn classify_reply(
    datagram: &[u8],
    peer: IpAddr,
    target: Ipv4Addr,
    expect_id: Option<u16>,
) -> ReplyClass {
    let message = strip_ip_header(datagram);
    let Some(icmp) = IcmpPacket::new(message) else {
        return ReplyClass::Ignore;
    };
    match icmp.get_icmp_type() {
        IcmpTypes::EchoReply => {
            if let Some(id) = expect_id {
                match EchoReplyPacket::new(message) {
                    Some(reply) if reply.get_identifier() == id => {}
                    _ => return ReplyClass::Ignore,
                }
            }
            if peer != IpAddr::V4(target) {
                return ReplyClass::Ignore;
            }
            ReplyClass::Success
        }
        IcmpTypes::TimeExceeded => ReplyClass::TtlExceeded,
        _ => ReplyClass::Ignore,
    }
}

fn strip_ip_header(datagram: &[u8]) -> &[u8] {
    if datagram.len() < 20 {
        return datagram;
    }
    // IPv4 version nibble; ICMP type bytes never collide with 0x4X
    if datagram[0] >> 4 != 4 {
        return datagram;
    }
    let header_len = usize::from(datagram[0] & 0x0f) * 4;
    if header_len < 20 || datagram.len() <= header_len {
        return datagram;
    }
    &datagram[header_len..]
}

/// One-pass aggregation. Mean and population variance cover successful
/// samples only; loss is `(total - success) / success`.
pub fn statistics(responses: &[EchoResponse]) -> EchoStatistics {
    let mut stats = EchoStatistics {
        count: responses.len(),
        ..EchoStatistics::default()
    };
    if responses.is_empty() {
        return stats;
    }

    let mut min = Duration::MAX;
    let mut max = Duration::ZERO;
    let mut success_sum = 0f64;
    for response in responses {
        stats.total_elapsed += response.elapsed;
        if !response.is_success() {
            continue;
        }
        stats.success_count += 1;
        success_sum += response.elapsed.as_secs_f64();
        if response.elapsed < min {
            min = response.elapsed;
        }
        if response.elapsed > max {
            max = response.elapsed;
        }
    }

    if stats.success_count == 0 {
        stats.loss = (stats.count - stats.success_count) as f64 / stats.success_count as f64;
        return stats;
    }

    stats.min = min;
    stats.max = max;
    let mean = success_sum / stats.success_count as f64;
    stats.mean = Duration::from_secs_f64(mean);
    let variance = responses
        .iter()
        .filter(|r| r.is_success())
        .map(|r| (r.elapsed.as_secs_f64() - mean).powi(2))
        .sum::<f64>()
        / stats.success_count as f64;
    stats.std_dev = Duration::from_secs_f64(variance.sqrt());
    stats.loss = (stats.count - stats.success_count) as f64 / stats.success_count as f64;
    stats
}
