//! SSDP discovery (spec.md section 4.1): multicast M-SEARCH plus passive
//! NOTIFY listening, filtered to MediaRenderer devices.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{channel, Receiver};
use url::Url;

use crate::Result;

pub const SSDP_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const SSDP_PORT: u16 = 1900;
pub const MEDIA_RENDERER_URN: &str = "urn:schemas-upnp-org:device:MediaRenderer:1";

const SEARCH_MX: usize = 3;
/// A second M-SEARCH is sent shortly after the first so devices that
/// missed the initial burst (still booting their network stack, a lost
/// packet) get a second chance without the caller waiting any longer than
/// this to consider discovery "warmed up" (spec.md section 4.1).
const FOLLOWUP_SEARCH_DELAY: Duration = Duration::from_secs(2);

fn search_packet() -> String {
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: {SSDP_ADDR}:{SSDP_PORT}\r\n\
         MAN: \"ssdp:discover\"\r\n\
         MX: {SEARCH_MX}\r\n\
         ST: {MEDIA_RENDERER_URN}\r\n\r\n"
    )
}

/// Builds the multicast socket per spec.md section 4.1: `SO_REUSEADDR` (so
/// multiple processes, or a restarted one, can bind 1900 concurrently),
/// TTL 2 (local subnet plus one hop), multicast loopback disabled, bound to
/// `0.0.0.0:1900` and joined to the SSDP group.
fn build_socket() -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_ttl_v4(2)?;
    socket.set_multicast_loop_v4(false)?;
    let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT).into();
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&SSDP_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into()).map_err(Into::into)
}

/// Strips the request/status line and parses `name: value` headers,
/// lower-cased and dash-normalized (spec.md section 4.1).
fn parse_ssdp_headers(packet: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in packet.lines().skip(1) {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        headers.insert(
            name.trim().to_ascii_lowercase().replace('-', "_"),
            value.trim().to_string(),
        );
    }
    headers
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub host: IpAddr,
    pub location: Url,
}

fn extract_device(peer: SocketAddr, packet: &str) -> Option<DiscoveredDevice> {
    let headers = parse_ssdp_headers(packet);
    let urn = headers.get("st").or_else(|| headers.get("nt"))?;
    if urn != MEDIA_RENDERER_URN {
        return None;
    }
    let location: Url = headers.get("location")?.parse().ok()?;
    Some(DiscoveredDevice {
        host: peer.ip(),
        location,
    })
}

/// Starts SSDP discovery: sends an M-SEARCH immediately, a follow-up after
/// `FOLLOWUP_SEARCH_DELAY`, and then listens indefinitely for both
/// M-SEARCH responses and unsolicited `NOTIFY ssdp:alive` announcements.
/// Each MediaRenderer sighting is forwarded once per packet received — the
/// caller (the supervisor's registry) is responsible for treating repeat
/// sightings of an already-registered device as a no-op.
pub async fn discover() -> Result<Receiver<DiscoveredDevice>> {
    let socket = build_socket()?;
    socket
        .send_to(search_packet().as_bytes(), (SSDP_ADDR, SSDP_PORT))
        .await?;

    let (tx, rx) = channel(32);

    tokio::spawn(async move {
        let mut followup_sent = false;
        let mut seen_locations: HashSet<String> = HashSet::new();
        let mut buf = [0u8; 4096];
        let mut followup_timer = Box::pin(tokio::time::sleep(FOLLOWUP_SEARCH_DELAY));

        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (n, peer) = match result {
                        Ok(pair) => pair,
                        Err(err) => {
                            log::error!("SSDP socket error: {err:#}");
                            break;
                        }
                    };
                    let packet = String::from_utf8_lossy(&buf[..n]);
                    log::trace!("SSDP from {peer}: {packet}");
                    if let Some(device) = extract_device(peer, &packet) {
                        if seen_locations.insert(device.location.to_string()) {
                            log::debug!("discovered MediaRenderer at {} ({})", device.host, device.location);
                        }
                        if tx.send(device).await.is_err() {
                            break;
                        }
                    }
                }
                _ = &mut followup_timer, if !followup_sent => {
                    followup_sent = true;
                    if let Err(err) = socket.send_to(search_packet().as_bytes(), (SSDP_ADDR, SSDP_PORT)).await {
                        log::warn!("follow-up M-SEARCH failed: {err:#}");
                    }
                }
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_and_normalizes_headers() {
        let packet = "HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:MediaRenderer:1\r\nLOCATION: http://192.168.1.10:49154/desc.xml\r\nCACHE-CONTROL: max-age=1800\r\n\r\n";
        let headers = parse_ssdp_headers(packet);
        assert_eq!(headers["st"], "urn:schemas-upnp-org:device:MediaRenderer:1");
        assert_eq!(headers["location"], "http://192.168.1.10:49154/desc.xml");
        assert_eq!(headers["cache_control"], "max-age=1800");
    }

    #[test]
    fn extracts_device_only_for_media_renderer_urn() {
        let peer: SocketAddr = "192.168.1.10:1900".parse().unwrap();
        let packet = "HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:MediaRenderer:1\r\nLOCATION: http://192.168.1.10:49154/desc.xml\r\n\r\n";
        let device = extract_device(peer, packet).unwrap();
        assert_eq!(device.host, "192.168.1.10".parse::<IpAddr>().unwrap());

        let wrong_urn = "HTTP/1.1 200 OK\r\nST: urn:schemas-upnp-org:device:Printer:1\r\nLOCATION: http://192.168.1.10/x\r\n\r\n";
        assert!(extract_device(peer, wrong_urn).is_none());
    }
}
