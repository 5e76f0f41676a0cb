//! UPnP A/V transport protocol layer: SOAP action invocation, GENA
//! subscription, SCPD/description parsing, and the DIDL-Lite codec
//! (spec.md section 4.2).

pub mod didl;
pub mod scpd;
mod xmlflat;

use crate::{Error, Result};
use reqwest::Client;
use std::collections::HashMap;
use std::time::Duration;

const SOAP_ENCODING: &str = "http://schemas.xmlsoap.org/soap/encoding/";

fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// A device-reported SOAP fault (spec.md section 4.2 / section 7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpnpErrorDetail {
    pub code: i32,
    pub description: String,
}

/// Invokes a SOAP action against `control_url`.
///
/// Builds the envelope described literally in spec.md section 4.2: a
/// `s:Envelope`/`s:Body` wrapper around `u:<action>` with one child element
/// per parameter, each holding its text content. The parameter set comes
/// from the caller (normally looked up from a runtime `ActionTable`, not a
/// compile-time binding).
pub async fn call_action(
    client: &Client,
    control_url: &str,
    service_type: &str,
    action: &str,
    params: &[(&str, &str)],
) -> Result<HashMap<String, String>> {
    let mut args = String::new();
    for (name, value) in params {
        args.push_str(&format!("<{name}>{}</{name}>", xml_escape(value)));
    }
    let body = format!(
        "<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
         s:encodingStyle=\"{SOAP_ENCODING}\"><s:Body><u:{action} xmlns:u=\"{service_type}\">{args}</u:{action}></s:Body></s:Envelope>"
    );

    let soap_action = format!("\"{service_type}#{action}\"");
    let response = client
        .post(control_url)
        .header("CONTENT-TYPE", "text/xml; charset=\"utf-8\"")
        .header("SOAPAction", soap_action)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        let root = xmlflat::parse(&body)?;
        let response_node = root
            .find_recursive(&format!("{action}Response"))
            .ok_or_else(|| Error::InvalidResponse(format!("no {action}Response in body")))?;
        Ok(response_node.children_as_map())
    } else if status.as_u16() == 500 {
        let root = xmlflat::parse(&body)?;
        let upnp_error = root.find_recursive("UPnPError");
        match upnp_error {
            Some(node) => {
                let code = node
                    .child("errorCode")
                    .map(|n| n.text.trim().parse().unwrap_or(0))
                    .unwrap_or(0);
                let description = node
                    .child("errorDescription")
                    .map(|n| n.text.clone())
                    .unwrap_or_default();
                Err(Error::Upnp(UpnpErrorDetail { code, description }))
            }
            None => Err(Error::InvalidResponse(format!(
                "500 response without UPnPError detail: {body}"
            ))),
        }
    } else {
        Err(Error::Transport(format!(
            "unexpected status {status} from {control_url}"
        )))
    }
}

/// Result of a successful (re)subscribe, per spec.md section 4.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub sid: String,
    pub granted_timeout_secs: u64,
}

fn parse_timeout_header(value: &str) -> u64 {
    value
        .strip_prefix("Second-")
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(300)
}

/// `subscribe`/renew per spec.md section 4.2: a `sid_or_callback` starting
/// with `uuid:` is a renewal (sends `SID`); otherwise it's treated as a
/// callback URL and a fresh `SUBSCRIBE` with `NT`/`CALLBACK` is sent.
pub async fn subscribe(
    client: &Client,
    event_sub_url: &str,
    sid_or_callback: &str,
    timeout_seconds: u64,
) -> Result<Subscription> {
    let method = reqwest::Method::from_bytes(b"SUBSCRIBE").expect("valid method");
    let mut request = client.request(method, event_sub_url);

    if let Some(sid) = sid_or_callback.strip_prefix("uuid:") {
        request = request
            .header("SID", format!("uuid:{sid}"))
            .header("TIMEOUT", format!("Second-{timeout_seconds}"));
    } else {
        request = request
            .header("NT", "upnp:event")
            .header("CALLBACK", format!("<{sid_or_callback}>"))
            .header("TIMEOUT", format!("Second-{timeout_seconds}"));
    }

    let response = request.send().await?;
    let status = response.status();

    if status.as_u16() == 412 {
        return Err(Error::PreconditionFailed);
    }
    if !status.is_success() {
        return Err(Error::Transport(format!(
            "SUBSCRIBE failed with status {status}"
        )));
    }

    let sid = response
        .headers()
        .get("SID")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::InvalidResponse("SUBSCRIBE response missing SID".to_string()))?
        .to_string();
    let granted_timeout_secs = response
        .headers()
        .get("TIMEOUT")
        .and_then(|v| v.to_str().ok())
        .map(parse_timeout_header)
        .unwrap_or(timeout_seconds);

    Ok(Subscription {
        sid,
        granted_timeout_secs,
    })
}

/// Cancels a subscription.
pub async fn unsubscribe(client: &Client, event_sub_url: &str, sid: &str) -> Result<()> {
    let method = reqwest::Method::from_bytes(b"UNSUBSCRIBE").expect("valid method");
    let response = client
        .request(method, event_sub_url)
        .header("SID", sid)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::Transport(format!(
            "UNSUBSCRIBE failed with status {}",
            response.status()
        )));
    }
    Ok(())
}

/// A typed GENA event value, cast per the service's state-variable table
/// (spec.md section 4.2): `ui4`/`i4` become integers, the literal
/// `OK`/`NOT_IMPLEMENTED` enum values stay as-is (tagged `Enum` so callers
/// can special-case them), everything else is a string.
#[derive(Debug, Clone, PartialEq)]
pub enum EventValue {
    Integer(i64),
    Enum(String),
    Str(String),
    Didl(didl::Decoded),
}

const DIDL_VARIABLES: &[&str] = &[
    "CurrentTrackMetaData",
    "NextTrackMetaData",
    "AVTransportURIMetaData",
    "NextAVTransportURIMetaData",
];

/// Decodes a GENA `NOTIFY` body into `variable -> value`, per spec.md
/// section 4.2: `e:propertyset/e:property/LastChange/Event/InstanceID/*`,
/// each inner element's tag is the variable name and its `val` attribute
/// is the new value.
pub fn decode_event_body(
    xml: &str,
    state_variables: &HashMap<String, scpd::StateVariableDef>,
) -> Result<HashMap<String, EventValue>> {
    let root = xmlflat::parse(xml)?;
    let last_change = root
        .find_recursive("LastChange")
        .ok_or_else(|| Error::InvalidResponse("missing LastChange".to_string()))?;
    // LastChange carries an embedded, separately-escaped XML document in
    // most real devices; fall back to treating it as already-parsed nodes
    // when it isn't (keeps decoding tolerant, matching the teacher's
    // "just try to parse, log on failure" style elsewhere).
    let inner = if last_change.children.is_empty() && !last_change.text.trim().is_empty() {
        xmlflat::parse(&last_change.text)?
    } else {
        last_change.clone()
    };

    let instance = inner
        .find_recursive("InstanceID")
        .ok_or_else(|| Error::InvalidResponse("missing InstanceID".to_string()))?;

    let mut out = HashMap::new();
    for child in &instance.children {
        let name = child.local_name().to_string();
        let raw = child
            .attrs
            .get("val")
            .cloned()
            .unwrap_or_else(|| child.text.clone());

        let value = if DIDL_VARIABLES.contains(&name.as_str()) {
            if raw.trim().is_empty() {
                EventValue::Str(String::new())
            } else {
                EventValue::Didl(didl::decode(&raw)?)
            }
        } else {
            match state_variables.get(&name).map(|sv| sv.data_type.as_str()) {
                Some("ui4") | Some("i4") | Some("ui2") | Some("i2") => raw
                    .parse::<i64>()
                    .map(EventValue::Integer)
                    .unwrap_or(EventValue::Str(raw)),
                _ if raw == "OK" || raw == "NOT_IMPLEMENTED" => EventValue::Enum(raw),
                _ => EventValue::Str(raw),
            }
        };
        out.insert(name, value);
    }
    Ok(out)
}

/// AVTransport metadata argument: pass through empty string for "no
/// metadata", a raw DIDL-Lite string verbatim, or encode a structured
/// track (spec.md section 4.2, "AVTransport specialization").
#[derive(Debug, Clone)]
pub enum TransportMetadata {
    None,
    Raw(String),
    Track(String, didl::TrackMetaData),
}

impl TransportMetadata {
    pub fn to_didl_string(&self) -> String {
        match self {
            TransportMetadata::None => String::new(),
            TransportMetadata::Raw(s) => s.clone(),
            TransportMetadata::Track(url, meta) => didl::encode(&[(url.clone(), meta.clone())]),
        }
    }
}

/// `SetAVTransportURI(InstanceID, url, meta)`.
pub async fn set_av_transport_uri(
    client: &Client,
    control_url: &str,
    service_type: &str,
    instance_id: u32,
    url: &str,
    meta: &TransportMetadata,
) -> Result<()> {
    let instance_str = instance_id.to_string();
    let meta_str = meta.to_didl_string();
    call_action(
        client,
        control_url,
        service_type,
        "SetAVTransportURI",
        &[
            ("InstanceID", &instance_str),
            ("CurrentURI", url),
            ("CurrentURIMetaData", &meta_str),
        ],
    )
    .await
    .map(|_| ())
}

/// `SetNextAVTransportURI(InstanceID, url, meta)`.
pub async fn set_next_av_transport_uri(
    client: &Client,
    control_url: &str,
    service_type: &str,
    instance_id: u32,
    url: &str,
    meta: &TransportMetadata,
) -> Result<()> {
    let instance_str = instance_id.to_string();
    let meta_str = meta.to_didl_string();
    call_action(
        client,
        control_url,
        service_type,
        "SetNextAVTransportURI",
        &[
            ("InstanceID", &instance_str),
            ("NextURI", url),
            ("NextURIMetaData", &meta_str),
        ],
    )
    .await
    .map(|_| ())
}

pub async fn stop(client: &Client, control_url: &str, service_type: &str, instance_id: u32) -> Result<()> {
    let instance_str = instance_id.to_string();
    call_action(client, control_url, service_type, "Stop", &[("InstanceID", &instance_str)])
        .await
        .map(|_| ())
}

pub async fn play(
    client: &Client,
    control_url: &str,
    service_type: &str,
    instance_id: u32,
    speed: u32,
) -> Result<()> {
    let instance_str = instance_id.to_string();
    let speed_str = speed.to_string();
    call_action(
        client,
        control_url,
        service_type,
        "Play",
        &[("InstanceID", &instance_str), ("Speed", &speed_str)],
    )
    .await
    .map(|_| ())
}

/// Default GENA subscription timeout for demo/reference call sites; the
/// Agent itself always passes the server-granted value on renewal.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(300);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_timeout_header() {
        assert_eq!(parse_timeout_header("Second-300"), 300);
        assert_eq!(parse_timeout_header("garbage"), 300);
    }

    #[test]
    fn decode_event_body_types_variables() {
        let mut vars = HashMap::new();
        vars.insert(
            "TransportStatus".to_string(),
            scpd::StateVariableDef {
                name: "TransportStatus".to_string(),
                data_type: "string".to_string(),
            },
        );
        vars.insert(
            "NumberOfTracks".to_string(),
            scpd::StateVariableDef {
                name: "NumberOfTracks".to_string(),
                data_type: "ui4".to_string(),
            },
        );
        let xml = r#"<e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><LastChange>&lt;Event xmlns="urn:schemas-upnp-org:metadata-1-0/AVT/"&gt;&lt;InstanceID val="0"&gt;&lt;TransportStatus val="OK"/&gt;&lt;NumberOfTracks val="5"/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>"#;
        let decoded = decode_event_body(xml, &vars).unwrap();
        assert_eq!(decoded["TransportStatus"], EventValue::Enum("OK".to_string()));
        assert_eq!(decoded["NumberOfTracks"], EventValue::Integer(5));
    }

    #[test]
    fn transport_metadata_none_is_empty_string() {
        assert_eq!(TransportMetadata::None.to_didl_string(), "");
    }
}
