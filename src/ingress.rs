//! Inbound event plumbing (spec.md section 4.6): the YXC unicast UDP
//! listener and the UPnP GENA callback decoder. Neither owns an HTTP
//! server — `handle_upnp_callback` is a plain function the embedding
//! application calls from whatever HTTP stack it already runs, matching
//! the out-of-scope note that this crate doesn't ship its own listener
//! for inbound `NOTIFY` requests.

use tokio::net::UdpSocket;
use serde_json::Value;

use crate::registry::Registry;
use crate::Result;

/// Port MusicCast devices send unicast YXC events to, per the
/// `X-AppPort` header sent during enrollment (spec.md section 4.3/4.6).
pub const YXC_EVENT_PORT: u16 = 41100;

/// Binds the YXC unicast event port and forwards every datagram to the
/// Agent registered for its originating device, by IP. Devices whose IP
/// isn't (or is no longer) registered are logged and dropped — this can
/// happen briefly during Agent initialization or after a device goes
/// offline.
pub async fn run_yxc_listener(registry: Registry) -> Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", YXC_EVENT_PORT)).await?;
    let mut buf = [0u8; 4096];
    loop {
        let (n, peer) = socket.recv_from(&mut buf).await?;
        let body: Value = match serde_json::from_slice(&buf[..n]) {
            Ok(v) => v,
            Err(err) => {
                log::warn!("malformed YXC event from {peer}: {err:#}");
                continue;
            }
        };
        let host = peer.ip().to_string();
        match registry.device_id_for_host(&host) {
            Some(device_id) => {
                if let Some(handle) = registry.whereis(&device_id) {
                    handle.deliver_yxc_event(body).await;
                }
            }
            None => log::debug!("YXC event from unregistered host {host}"),
        }
    }
}

/// What the embedding HTTP server should answer a GENA `NOTIFY` request
/// with (spec.md section 4.6): 200 once the body has been forwarded to the
/// matching Agent, 410 when no Agent's `upnp_session_id` matches the `SID`
/// header (the subscription is gone as far as this process is concerned).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Delivered,
    UnknownSubscription,
}

/// Decodes a GENA `NOTIFY` body and forwards it to the Agent whose
/// `upnp_session_id` equals the `SID` header, scanning the Registry for a
/// match. The embedding HTTP server is expected to have already read the
/// `SID` header and body off the raw request (this crate doesn't bundle an
/// HTTP/GENA server, per spec.md's non-goal) and pass both through here
/// verbatim.
pub async fn handle_upnp_callback(registry: &Registry, sid: &str, body: &str) -> CallbackOutcome {
    match registry.whereis_by_upnp_session(sid).await {
        Some(handle) => {
            handle.deliver_upnp_event(body.to_string()).await;
            CallbackOutcome::Delivered
        }
        None => CallbackOutcome::UnknownSubscription,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn unknown_sid_is_unknown_subscription() {
        let registry = Registry::new();
        let outcome = handle_upnp_callback(&registry, "uuid:missing", "<e:propertyset/>").await;
        assert_eq!(outcome, CallbackOutcome::UnknownSubscription);
    }
}
