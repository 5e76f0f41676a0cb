//! DIDL-Lite encode/decode (spec.md section 4.2).

use instant_xml::{FromXml, ToXml};
use serde::{Deserialize, Serialize};

const XMLNS_DIDL_LITE: &str = "urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/";
const XMLNS_DC: &str = "http://purl.org/dc/elements/1.1/";
const XMLNS_UPNP: &str = "urn:schemas-upnp-org:metadata-1-0/upnp/";

/// Track metadata as carried by DIDL-Lite `<item>` elements.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMetaData {
    pub id: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_cover_url: Option<String>,
    pub duration_seconds: Option<i64>,
    pub mimetype: Option<String>,
}

/// Result of decoding a DIDL-Lite document: per spec.md section 9's Open
/// Question resolution, a document with exactly one `<item>` decodes to
/// `Single`; any other count (0 or >1) decodes to `Many`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Single((String, TrackMetaData)),
    Many(Vec<(String, TrackMetaData)>),
}

impl Decoded {
    pub fn into_vec(self) -> Vec<(String, TrackMetaData)> {
        match self {
            Decoded::Single(item) => vec![item],
            Decoded::Many(items) => items,
        }
    }

    pub fn single(self) -> Option<(String, TrackMetaData)> {
        match self {
            Decoded::Single(item) => Some(item),
            Decoded::Many(mut items) if items.len() == 1 => Some(items.pop().expect("len 1")),
            Decoded::Many(_) => None,
        }
    }
}

fn html_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn html_unescape(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
}

const HMS_FACTORS: &[i64] = &[3600, 60, 1];

/// Formats seconds as `H:MM:SS`: hours unpadded, minutes/seconds 2-padded.
/// Valid for `n` in `[0, 359999]` per spec.md section 8.
pub fn duration_to_hms(total_seconds: i64) -> String {
    use std::fmt::Write;
    let mut remaining = total_seconds.max(0);
    let mut out = String::new();
    for (i, &factor) in HMS_FACTORS.iter().enumerate() {
        let v = remaining / factor;
        remaining -= v * factor;
        if i == 0 {
            write!(&mut out, "{v}:").ok();
        } else if i == HMS_FACTORS.len() - 1 {
            write!(&mut out, "{v:02}").ok();
        } else {
            write!(&mut out, "{v:02}:").ok();
        }
    }
    out
}

/// Inverse of `duration_to_hms`.
pub fn hms_to_duration(hms: &str) -> i64 {
    let mut total = 0i64;
    for (field, factor) in hms.split(':').rev().zip(HMS_FACTORS.iter().rev()) {
        let Ok(v) = field.parse::<i64>() else {
            return 0;
        };
        total += v * factor;
    }
    total
}

fn protocol_info_for(mimetype: Option<&str>) -> String {
    match mimetype {
        None => String::new(),
        Some("audio/mp4") => "http-get:*:audio/mp4:DLNA.ORG_PN=AAC_ISO_320".to_string(),
        Some(mime) => format!("http-get:*:{mime}"),
    }
}

/// Encodes a list of `(url, metadata)` pairs as a single DIDL-Lite document.
pub fn encode(items: &[(String, TrackMetaData)]) -> String {
    let mut body = String::new();
    for (url, meta) in items {
        body.push_str(&encode_item(url, meta));
    }
    format!(
        "<DIDL-Lite xmlns=\"{XMLNS_DIDL_LITE}\" xmlns:upnp=\"{XMLNS_UPNP}\" xmlns:dc=\"{XMLNS_DC}\">{body}</DIDL-Lite>"
    )
}

fn encode_item(url: &str, meta: &TrackMetaData) -> String {
    let mut out = format!(
        "<item id=\"{}\" parentID=\"0\" restricted=\"0\"><upnp:class>object.item.audioItem.musicTrack</upnp:class>",
        html_escape(&meta.id)
    );
    if let Some(title) = &meta.title {
        out.push_str(&format!("<dc:title>{}</dc:title>", html_escape(title)));
    }
    if let Some(album) = &meta.album {
        out.push_str(&format!("<upnp:album>{}</upnp:album>", html_escape(album)));
    }
    if let Some(art) = &meta.album_cover_url {
        out.push_str(&format!("<upnp:albumArtURI>{}</upnp:albumArtURI>", html_escape(art)));
    }
    if let Some(artist) = &meta.artist {
        out.push_str(&format!("<upnp:artist>{}</upnp:artist>", html_escape(artist)));
    }
    let protocol_info = protocol_info_for(meta.mimetype.as_deref());
    let duration = duration_to_hms(meta.duration_seconds.unwrap_or(0));
    out.push_str(&format!(
        "<res protocolInfo=\"{protocol_info}\" duration=\"{duration}\">{url}</res></item>"
    ));
    out
}

#[derive(Debug, FromXml)]
#[xml(rename = "DIDL-Lite")]
struct DidlLiteDoc {
    item: Vec<RawItem>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "item")]
struct RawItem {
    #[xml(attribute)]
    id: String,
    title: Option<RawTitle>,
    album: Option<RawAlbum>,
    #[xml(rename = "albumArtURI")]
    album_art_uri: Option<RawAlbumArt>,
    artist: Option<RawArtist>,
    res: Option<RawRes>,
}

#[derive(Debug, FromXml)]
#[xml(rename = "title", ns(XMLNS_DC))]
struct RawTitle {
    #[xml(direct)]
    value: String,
}

#[derive(Debug, FromXml)]
#[xml(rename = "album", ns(XMLNS_UPNP))]
struct RawAlbum {
    #[xml(direct)]
    value: String,
}

#[derive(Debug, FromXml)]
#[xml(rename = "albumArtURI", ns(XMLNS_UPNP))]
struct RawAlbumArt {
    #[xml(direct)]
    value: String,
}

#[derive(Debug, FromXml)]
#[xml(rename = "artist", ns(XMLNS_UPNP))]
struct RawArtist {
    #[xml(direct)]
    value: String,
}

#[derive(Debug, FromXml)]
#[xml(rename = "res")]
struct RawRes {
    #[xml(attribute, rename = "protocolInfo")]
    protocol_info: String,
    #[xml(attribute)]
    duration: String,
    #[xml(direct)]
    url: String,
}

/// Parses a DIDL-Lite document into `(url, metadata)` pairs.
pub fn decode_items(xml: &str) -> crate::Result<Vec<(String, TrackMetaData)>> {
    let doc: DidlLiteDoc = instant_xml::from_str(xml)?;
    let mut out = Vec::with_capacity(doc.item.len());
    for item in doc.item {
        let url = item.res.as_ref().map(|r| r.url.clone()).unwrap_or_default();
        let mimetype = item.res.as_ref().and_then(|r| {
            r.protocol_info
                .split(':')
                .nth(2)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        });
        let duration_seconds = item
            .res
            .as_ref()
            .map(|r| hms_to_duration(&r.duration))
            .filter(|&d| d != 0);
        out.push((
            url,
            TrackMetaData {
                id: item.id,
                title: item.title.map(|t| t.value),
                artist: item.artist.map(|a| html_unescape(&a.value)),
                album: item.album.map(|a| a.value),
                album_cover_url: item.album_art_uri.map(|a| a.value).filter(|s| !s.is_empty()),
                duration_seconds,
                mimetype,
            },
        ));
    }
    Ok(out)
}

/// Decodes per spec.md section 9's Open Question resolution: one item
/// decodes to `Single`, any other count to `Many`.
pub fn decode(xml: &str) -> crate::Result<Decoded> {
    let mut items = decode_items(xml)?;
    if items.len() == 1 {
        Ok(Decoded::Single(items.pop().expect("len 1")))
    } else {
        Ok(Decoded::Many(items))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hms_round_trip_boundaries() {
        for n in [0, 1, 59, 60, 3599, 3600, 359999] {
            let encoded = duration_to_hms(n);
            assert_eq!(hms_to_duration(&encoded), n, "{encoded}");
        }
    }

    #[test]
    fn hms_format_unpadded_hours() {
        assert_eq!(duration_to_hms(240), "0:04:00");
        assert_eq!(duration_to_hms(3600 + 61), "1:01:01");
        assert_eq!(duration_to_hms(99 * 3600), "99:00:00");
    }

    #[test]
    fn protocol_info_mp4_special_case() {
        assert_eq!(
            protocol_info_for(Some("audio/mp4")),
            "http-get:*:audio/mp4:DLNA.ORG_PN=AAC_ISO_320"
        );
        assert_eq!(protocol_info_for(Some("audio/mpeg")), "http-get:*:audio/mpeg");
        assert_eq!(protocol_info_for(None), "");
    }

    #[test]
    fn encode_decode_round_trip() {
        let meta = TrackMetaData {
            id: "1".to_string(),
            title: Some("A".to_string()),
            artist: Some("Me & You".to_string()),
            album: Some("Al".to_string()),
            album_cover_url: Some("http://art".to_string()),
            duration_seconds: Some(240),
            mimetype: Some("audio/mp4".to_string()),
        };
        let xml = encode(&[("http://media/a.m4a".to_string(), meta.clone())]);
        assert!(xml.contains("0:04:00"));
        assert!(xml.contains("DLNA.ORG_PN=AAC_ISO_320"));
        assert!(xml.contains("Me &amp; You"));

        let decoded = decode(&xml).unwrap();
        let (url, decoded_meta) = decoded.single().expect("exactly one item");
        assert_eq!(url, "http://media/a.m4a");
        assert_eq!(decoded_meta, meta);
    }

    #[test]
    fn encode_item_snapshot() {
        let meta = TrackMetaData {
            id: "7".to_string(),
            title: Some("Track".to_string()),
            artist: None,
            album: None,
            album_cover_url: None,
            duration_seconds: Some(65),
            mimetype: Some("audio/mpeg".to_string()),
        };
        k9::snapshot!(
            encode_item("http://media/t.mp3", &meta),
            r#"<item id="7" parentID="0" restricted="0"><upnp:class>object.item.audioItem.musicTrack</upnp:class><dc:title>Track</dc:title><res protocolInfo="http-get:*:audio/mpeg" duration="0:01:05">http://media/t.mp3</res></item>"#
        );
    }

    #[test]
    fn decode_many_items_not_single() {
        let a = TrackMetaData {
            id: "1".to_string(),
            title: Some("A".to_string()),
            ..Default::default()
        };
        let b = TrackMetaData {
            id: "2".to_string(),
            title: Some("B".to_string()),
            ..Default::default()
        };
        let xml = encode(&[("u1".to_string(), a), ("u2".to_string(), b)]);
        match decode(&xml).unwrap() {
            Decoded::Many(items) => assert_eq!(items.len(), 2),
            Decoded::Single(_) => panic!("expected Many"),
        }
    }

    #[test]
    fn artist_entity_encoding_roundtrips() {
        for raw in ["Tom & Jerry", "<script>", "\"quoted\"", "It's"] {
            let meta = TrackMetaData {
                id: "1".to_string(),
                artist: Some(raw.to_string()),
                ..Default::default()
            };
            let xml = encode(&[("u".to_string(), meta)]);
            let (_, decoded) = decode(&xml).unwrap().single().unwrap();
            assert_eq!(decoded.artist.as_deref(), Some(raw));
        }
    }
}
