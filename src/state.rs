//! Device state types and the structural differ that drives pubsub deltas.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::upnp::didl::TrackMetaData;
use crate::upnp::scpd::RootDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Play,
    Pause,
    Stop,
    FastReverse,
    FastForward,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Equalizer {
    pub high: i32,
    pub low: i32,
    pub mid: i32,
    pub mode: i32,
}

/// Per-zone status, shaped after `getStatus` (spec.md section 3).
///
/// Unrecognized keys land in `extras` rather than being dropped, since
/// firmware revisions add fields faster than this struct can track them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneStatus {
    pub power: PowerState,
    pub input: String,
    pub volume: i32,
    pub max_volume: i32,
    pub mute: bool,
    pub sleep: i32,
    pub equalizer: Equalizer,
    pub balance: i32,
    pub bass_extension: bool,
    pub direct: bool,
    pub enhancer: bool,
    pub link_control: String,
    pub link_audio_delay: String,
    pub subwoofer_volume: i32,
    pub distribution_enable: bool,
    pub disable_flags: i64,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl Default for ZoneStatus {
    fn default() -> Self {
        ZoneStatus {
            power: PowerState::Standby,
            input: String::new(),
            volume: 0,
            max_volume: 0,
            mute: false,
            sleep: 0,
            equalizer: Equalizer::default(),
            balance: 0,
            bass_extension: false,
            direct: false,
            enhancer: false,
            link_control: String::new(),
            link_audio_delay: String::new(),
            subwoofer_volume: 0,
            distribution_enable: false,
            disable_flags: 0,
            extras: Map::new(),
        }
    }
}

/// Current-track info, shaped after `getPlayInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackInfo {
    pub input: String,
    pub playback: PlaybackState,
    pub repeat: String,
    pub shuffle: String,
    pub play_time: i32,
    pub total_time: i32,
    pub artist: String,
    pub album: String,
    pub track: String,
    /// Absolute `http://<host><path>` URL, or empty string if the device
    /// reports no art (spec.md section 3 "Album art" invariant).
    pub albumart_url: String,
    #[serde(flatten)]
    pub extras: Map<String, Value>,
}

impl Default for PlaybackInfo {
    fn default() -> Self {
        PlaybackInfo {
            input: String::new(),
            playback: PlaybackState::Stop,
            repeat: "off".to_string(),
            shuffle: "off".to_string(),
            play_time: 0,
            total_time: 0,
            artist: String::new(),
            album: String::new(),
            track: String::new(),
            albumart_url: String::new(),
            extras: Map::new(),
        }
    }
}

/// `http://<host><p>` unless `p` is empty, per spec.md section 4.5.
pub fn absolutize_albumart(host: &str, p: &str) -> String {
    if p.is_empty() {
        String::new()
    } else {
        format!("http://{host}{p}")
    }
}

/// Last-known AVTransport event payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AvTransportEvent {
    pub transport_state: Option<String>,
    pub av_transport_uri: Option<String>,
    pub next_av_transport_uri: Option<String>,
    pub current_track_metadata: Option<TrackMetaData>,
    pub next_track_metadata: Option<TrackMetaData>,
}

/// `{media_url, items}` from spec.md section 3.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackQueue {
    pub media_url: Option<String>,
    pub items: Vec<(String, TrackMetaData)>,
}

impl PlaybackQueue {
    /// Index of `media_url` among `items`, if present.
    pub fn current_index(&self) -> Option<usize> {
        let cur = self.media_url.as_deref()?;
        self.items.iter().position(|(url, _)| url == cur)
    }

    /// The item at `idx + delta`, clamped to `[0, len-1]`, unless shuffle is
    /// requested, in which case a uniformly random *other* item is chosen.
    pub fn neighbor(&self, delta: i64, shuffle: bool) -> Option<&(String, TrackMetaData)> {
        if self.items.is_empty() {
            return None;
        }
        if shuffle {
            if self.items.len() == 1 {
                return self.items.first();
            }
            let cur = self.current_index();
            loop {
                let idx = rand::random::<usize>() % self.items.len();
                if Some(idx) != cur {
                    return self.items.get(idx);
                }
            }
        }
        let cur = self.current_index().unwrap_or(0) as i64;
        let idx = (cur + delta).clamp(0, self.items.len() as i64 - 1);
        self.items.get(idx as usize)
    }
}

/// Full state held by one Agent. Mutated only by its owning Agent; readers
/// get snapshots via `Agent::lookup` / `Agent::whole_state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub host: String,
    pub device_id: String,
    pub network_name: String,
    pub available_inputs: Vec<String>,
    pub status: ZoneStatus,
    pub playback: PlaybackInfo,
    pub upnp_service: RootDescription,
    pub upnp: Option<AvTransportEvent>,
    pub upnp_session_id: Option<String>,
    pub playback_queue: PlaybackQueue,
}

/// Recursively diffs two JSON values, returning `Some(value)` describing
/// only what changed from `old` to `new`.
///
/// - For objects: recurse key by key; a key present in both with equal
///   values is omitted; a key only in `new` (or changed) is included
///   whole (recursing into nested objects).
/// - For arrays of `[url, meta]` pairs (the `playback_queue.items` shape)
///   comparison is as a *set* of pairs, per spec.md section 4.5; any other
///   array is compared as a whole value.
/// - Anything else: included iff `old != new`.
///
/// `diff(old, new)` — changed-from-`old`-to-`new`, matching spec.md's
/// section 9 Open Question resolution (not the reversed argument order).
pub fn diff_value(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut out = Map::new();
            for (k, nv) in n {
                match o.get(k) {
                    Some(ov) => {
                        if let Some(d) = diff_value(ov, nv) {
                            out.insert(k.clone(), d);
                        }
                    }
                    None => {
                        out.insert(k.clone(), nv.clone());
                    }
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Value::Object(out))
            }
        }
        (Value::Array(o), Value::Array(n)) if is_pair_list(o) && is_pair_list(n) => {
            let os: BTreeSet<String> = o.iter().map(|v| v.to_string()).collect();
            let ns: BTreeSet<String> = n.iter().map(|v| v.to_string()).collect();
            if os == ns {
                None
            } else {
                Some(Value::Array(n.clone()))
            }
        }
        _ => {
            if old == new {
                None
            } else {
                Some(new.clone())
            }
        }
    }
}

fn is_pair_list(arr: &[Value]) -> bool {
    arr.iter()
        .all(|v| matches!(v, Value::Array(inner) if inner.len() == 2))
}

/// Diffs two `DeviceState` snapshots, returning the minimal changed-path
/// object (or `None` if nothing changed) that gets published to the
/// device's pubsub topic as `{:update, device_id, diff}`.
pub fn diff_state(old: &DeviceState, new: &DeviceState) -> Option<Value> {
    let old_v = serde_json::to_value(old).expect("DeviceState always serializes");
    let new_v = serde_json::to_value(new).expect("DeviceState always serializes");
    diff_value(&old_v, &new_v)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn diff_flat_change() {
        let old = serde_json::json!({"a": 1, "b": 2});
        let new = serde_json::json!({"a": 1, "b": 3});
        assert_eq!(diff_value(&old, &new), Some(serde_json::json!({"b": 3})));
    }

    #[test]
    fn diff_nested_recurses() {
        let old = serde_json::json!({"status": {"volume": 10, "mute": false}});
        let new = serde_json::json!({"status": {"volume": 42, "mute": false}});
        assert_eq!(
            diff_value(&old, &new),
            Some(serde_json::json!({"status": {"volume": 42}}))
        );
    }

    #[test]
    fn diff_no_change_is_none() {
        let v = serde_json::json!({"a": {"b": 1}});
        assert_eq!(diff_value(&v, &v), None);
    }

    #[test]
    fn diff_pair_list_as_set() {
        let old = serde_json::json!([["u1", {"title": "A"}], ["u2", {"title": "B"}]]);
        let new = serde_json::json!([["u2", {"title": "B"}], ["u1", {"title": "A"}]]);
        assert_eq!(diff_value(&old, &new), None);
    }

    #[test]
    fn queue_neighbor_clamped_no_shuffle() {
        let q = PlaybackQueue {
            media_url: Some("u1".to_string()),
            items: vec![
                ("u1".to_string(), TrackMetaData::default()),
                ("u2".to_string(), TrackMetaData::default()),
                ("u3".to_string(), TrackMetaData::default()),
            ],
        };
        assert_eq!(q.neighbor(1, false).unwrap().0, "u2");
        let q_last = PlaybackQueue {
            media_url: Some("u3".to_string()),
            ..q
        };
        assert_eq!(q_last.neighbor(1, false).unwrap().0, "u3");
    }

    #[test]
    fn albumart_url_empty_path_stays_empty() {
        assert_eq!(absolutize_albumart("192.168.1.10", ""), "");
        assert_eq!(
            absolutize_albumart("192.168.1.10", "/YamahaRemoteControl/AlbumArt?cid=1"),
            "http://192.168.1.10/YamahaRemoteControl/AlbumArt?cid=1"
        );
    }
}
