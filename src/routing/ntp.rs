//! Best-effort clock offset from SNTP servers.
//!
//! Ping timestamps are compared across nodes, so each node corrects its
//! clock by the averaged offset reported by a few NTP servers.

use super::RoutingError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tracing::{debug, info};

/// Seconds between 1900-01-01 and 1970-01-01.
const NTP_UNIX_DELTA: u64 = 2_208_988_800;
const NTP_PACKET_SIZE: usize = 48;

/// Which servers to ask and how often.
#[derive(Clone, Debug, Default)]
pub struct NtpSettings {
    pub use_ntp: bool,
    /// Servers queried per sync; 0 means all.
    pub max_server_use: usize,
    pub sync_time_interval: Duration,
    pub ntp_timeout: Duration,
    pub servers: Vec<String>,
}

fn to_ntp(t: SystemTime) -> u64 {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = d.as_secs() + NTP_UNIX_DELTA;
    let frac = ((d.subsec_nanos() as u64) << 32) / 1_000_000_000;
    (secs << 32) | frac
}

/// NTP timestamp to signed milliseconds since the Unix epoch.
fn ntp_to_unix_ms(ts: u64) -> i64 {
    let secs = (ts >> 32) as i64 - NTP_UNIX_DELTA as i64;
    let frac_ms = (((ts & 0xffff_ffff) * 1000) >> 32) as i64;
    secs * 1000 + frac_ms
}

fn unix_ms(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Offset and round-trip time from a server's reply.
///
/// `t1`/`t4` are our send and receive times; `t2`/`t3` come from the reply.
fn offset_from_reply(reply: &[u8], t1: SystemTime, t4: SystemTime) -> Result<(i64, i64), RoutingError> {
    if reply.len() < NTP_PACKET_SIZE {
        return Err(RoutingError::Ntp(format!("short reply: {} bytes", reply.len())));
    }
    let mode = reply[0] & 0x07;
    if mode != 4 {
        return Err(RoutingError::Ntp(format!("unexpected mode {}", mode)));
    }
    let read = |at: usize| {
        let mut b = [0u8; 8];
        b.copy_from_slice(&reply[at..at + 8]);
        u64::from_be_bytes(b)
    };
    let t2 = ntp_to_unix_ms(read(32));
    let t3 = ntp_to_unix_ms(read(40));
    let (t1, t4) = (unix_ms(t1), unix_ms(t4));
    let offset = ((t2 - t1) + (t3 - t4)) / 2;
    let rtt = (t4 - t1) - (t3 - t2);
    Ok((offset, rtt.max(0)))
}

/// Query one server; returns `(offset_ms, rtt_ms)`.
pub async fn query_offset(server: &str, timeout: Duration) -> Result<(i64, i64), RoutingError> {
    let addr = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:123", server)
    };
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(&addr).await?;

    let mut req = [0u8; NTP_PACKET_SIZE];
    req[0] = 0x1b; // LI 0, version 3, client
    let t1 = SystemTime::now();
    req[40..48].copy_from_slice(&to_ntp(t1).to_be_bytes());
    socket.send(&req).await?;

    let mut buf = [0u8; 128];
    let n = tokio::time::timeout(timeout, socket.recv(&mut buf))
        .await
        .map_err(|_| RoutingError::Ntp(format!("{}: timeout", server)))??;
    offset_from_reply(&buf[..n], t1, SystemTime::now())
}

/// Average the offsets of the fastest servers, dropping the extremes when
/// there are more than three. `None` when every server failed.
pub async fn sync_offset(settings: &NtpSettings) -> Option<i64> {
    let count = match settings.max_server_use {
        0 => settings.servers.len(),
        n => n.min(settings.servers.len()),
    };
    let queries = settings.servers[..count]
        .iter()
        .map(|s| query_offset(s, settings.ntp_timeout));
    let results = futures::future::join_all(queries).await;

    let mut answered: Vec<(i64, i64)> = Vec::new();
    for (server, res) in settings.servers.iter().zip(results) {
        match res {
            Ok((offset, rtt)) => {
                debug!(target: "meshguard::internal", server = %server, offset_ms = offset, rtt_ms = rtt, "NTP reply");
                answered.push((offset, rtt));
            }
            Err(e) => debug!(target: "meshguard::internal", server = %server, error = %e, "NTP query failed"),
        }
    }
    answered.sort_by_key(|(_, rtt)| *rtt);
    let mut offsets: Vec<i64> = answered.into_iter().map(|(o, _)| o).collect();
    offsets.sort_unstable();
    if offsets.len() > 3 {
        offsets = offsets[1..offsets.len() - 1].to_vec();
    }
    if offsets.is_empty() {
        info!("All NTP servers failed, keeping previous offset");
        return None;
    }
    let avg = offsets.iter().sum::<i64>() / offsets.len() as i64;
    info!(offset_ms = avg, "NTP offset updated");
    Some(avg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_with(t2: SystemTime, t3: SystemTime) -> Vec<u8> {
        let mut r = vec![0u8; NTP_PACKET_SIZE];
        r[0] = 0x1c; // server mode
        r[32..40].copy_from_slice(&to_ntp(t2).to_be_bytes());
        r[40..48].copy_from_slice(&to_ntp(t3).to_be_bytes());
        r
    }

    #[test]
    fn test_ntp_timestamp_conversion() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        assert_eq!(ntp_to_unix_ms(to_ntp(t)), 1_700_000_000_123);
    }

    #[test]
    fn test_offset_math() {
        let t1 = UNIX_EPOCH + Duration::from_secs(1000);
        // Server is 5 s ahead; 100 ms each way.
        let t2 = t1 + Duration::from_millis(5100);
        let t3 = t2 + Duration::from_millis(10);
        let t4 = t1 + Duration::from_millis(210);
        let (offset, rtt) = offset_from_reply(&reply_with(t2, t3), t1, t4).unwrap();
        assert_eq!(offset, 5000);
        assert_eq!(rtt, 200);
    }

    #[test]
    fn test_rejects_client_mode_reply() {
        let t = SystemTime::now();
        let mut r = reply_with(t, t);
        r[0] = 0x1b;
        assert!(offset_from_reply(&r, t, t).is_err());
        assert!(offset_from_reply(&r[..10], t, t).is_err());
    }

    #[tokio::test]
    async fn test_local_server_query() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (_, from) = server.recv_from(&mut buf).await.unwrap();
            let now = SystemTime::now() + Duration::from_secs(3);
            server.send_to(&reply_with(now, now), from).await.unwrap();
        });
        let (offset, _) = query_offset(&addr, Duration::from_secs(2)).await.unwrap();
        assert!((2900..=3100).contains(&offset), "offset {}", offset);
    }

    #[tokio::test]
    async fn test_sync_with_no_servers() {
        let settings = NtpSettings {
            use_ntp: true,
            ntp_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        assert_eq!(sync_offset(&settings).await, None);
    }
}
