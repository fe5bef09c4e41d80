//! ICMP echo probe with a `ping` command fallback.
//!
//! The native path runs a blocking socket inside `spawn_blocking`; when the
//! process may not open ICMP sockets at all, the system `ping` binary is used.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

const ECHO_REQUEST_V4: u8 = 8;
const ECHO_REPLY_V4: u8 = 0;
const ECHO_REQUEST_V6: u8 = 128;
const ECHO_REPLY_V6: u8 = 129;
const PACKET_LEN: usize = 64;

static ICMP_SUPPORTED: OnceLock<bool> = OnceLock::new();
static SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_support() -> bool {
    let supported = [Type::RAW, Type::DGRAM]
        .into_iter()
        .any(|ty| Socket::new(Domain::IPV4, ty, Some(Protocol::ICMPV4)).is_ok());
    if supported {
        tracing::info!("Ping probe: using native ICMP sockets");
    } else {
        tracing::info!("Ping probe: ICMP sockets unavailable, using ping command");
    }
    supported
}

/// Failure of the native echo path.
enum EchoError {
    /// The kernel refused the socket operation; retry with the command.
    Denied(io::Error),
    Probe(ProbeError),
}

impl EchoError {
    fn io(context: &str, e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::PermissionDenied {
            EchoError::Denied(e)
        } else {
            EchoError::Probe(ProbeError::Network(format!("{}: {}", context, e)))
        }
    }
}

/// Measure one ICMP echo round trip to `host`.
pub async fn run_ping_probe(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    if !*ICMP_SUPPORTED.get_or_init(detect_icmp_support) {
        return run_ping_command(host, timeout).await;
    }

    let ip = resolve(host).await?;
    let outcome = tokio::task::spawn_blocking(move || echo(ip, timeout))
        .await
        .map_err(|e| ProbeError::Network(format!("echo task failed: {}", e)))?;

    match outcome {
        Ok(latency) => Ok(latency),
        Err(EchoError::Probe(e)) => Err(e),
        Err(EchoError::Denied(e)) => {
            tracing::warn!("Native ping to {} denied ({}), falling back to command", host, e);
            run_ping_command(host, timeout).await
        }
    }
}

async fn resolve(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }

    tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", host, e)))?
        .map(|sa| sa.ip())
        .next()
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}

fn echo(ip: IpAddr, timeout: Duration) -> Result<Duration, EchoError> {
    let (domain, protocol, request, reply) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4, ECHO_REQUEST_V4, ECHO_REPLY_V4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6, ECHO_REQUEST_V6, ECHO_REPLY_V6),
    };

    // RAW sockets keep our identifier; DGRAM sockets get it rewritten by the kernel.
    let (socket, raw) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(s) => (s, true),
        Err(_) => (
            Socket::new(domain, Type::DGRAM, Some(protocol)).map_err(|e| EchoError::io("open socket", e))?,
            false,
        ),
    };
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| EchoError::io("connect", e))?;

    let identifier: u16 = rand::random();
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let packet = echo_request(request, identifier, sequence, ip.is_ipv4());

    let start = Instant::now();
    socket.send(&packet).map_err(|e| EchoError::io("send", e))?;

    let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
    loop {
        let remaining = timeout
            .checked_sub(start.elapsed())
            .filter(|d| !d.is_zero())
            .ok_or(EchoError::Probe(ProbeError::Timeout(timeout)))?;
        socket
            .set_read_timeout(Some(remaining))
            .map_err(|e| EchoError::io("set timeout", e))?;

        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => EchoError::Probe(ProbeError::Timeout(timeout)),
            _ => EchoError::io("receive", e),
        })?;
        let elapsed = start.elapsed();

        // SAFETY: recv initialised the first `len` bytes of `buf`.
        let data = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
        let expected_id = raw.then_some(identifier);
        if is_echo_reply(data, reply, expected_id, sequence) {
            return Ok(elapsed);
        }
    }
}

/// Build an echo request. IPv6 checksums are filled in by the kernel.
fn echo_request(kind: u8, identifier: u16, sequence: u16, with_checksum: bool) -> Vec<u8> {
    let mut packet = vec![0u8; PACKET_LEN];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    for (i, b) in packet[8..].iter_mut().enumerate() {
        *b = i as u8;
    }

    if with_checksum {
        let sum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Match a received datagram against the request we sent. A leading IPv4
/// header (RAW sockets) is skipped.
fn is_echo_reply(data: &[u8], reply: u8, identifier: Option<u16>, sequence: u16) -> bool {
    let offset = match data.first() {
        Some(b) if b >> 4 == 4 => (b & 0x0f) as usize * 4,
        Some(_) => 0,
        None => return false,
    };
    let Some(icmp) = data.get(offset..offset + 8) else {
        return false;
    };

    let id = u16::from_be_bytes([icmp[4], icmp[5]]);
    let seq = u16::from_be_bytes([icmp[6], icmp[7]]);
    icmp[0] == reply && seq == sequence && identifier.map_or(true, |want| want == id)
}

/// RFC 1071 internet checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

async fn run_ping_command(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let wait_secs = timeout.as_secs().max(1).to_string();

    let output = Command::new("ping")
        .args(["-c", "1", "-W", &wait_secs, host])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        if stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Command(format!("ping failed: {}", stderr.trim())));
    }

    parse_ping_output(&stdout)
}

/// Pull the round-trip time out of `ping` output (Linux or macOS).
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    static PATTERNS: OnceLock<[Regex; 2]> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            Regex::new(r"time[=<](?P<ms>[0-9.]+)\s*ms").expect("valid regex"),
            Regex::new(r"(?:rtt|round-trip) min/avg/max/(?:mdev|stddev) = [0-9.]+/(?P<ms>[0-9.]+)/")
                .expect("valid regex"),
        ]
    });

    patterns
        .iter()
        .find_map(|re| re.captures(output)?.name("ms")?.as_str().parse::<f64>().ok())
        .map(|ms| Duration::from_secs_f64(ms / 1000.0))
        .ok_or_else(|| ProbeError::Command(format!("failed to parse ping output: {}", output)))
}
