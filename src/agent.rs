//! The Device Agent: one tokio task per MusicCast device, merging YXC
//! unicast events and UPnP GENA events into a single `DeviceState`,
//! publishing diffs, and executing commands (spec.md section 4.5).

use std::time::Duration;

use reqwest::{Client, Url};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};

use crate::registry::{PubSub, Registry, Update};
use crate::state::{
    absolutize_albumart, diff_state, AvTransportEvent, DeviceState, PlaybackInfo, PlaybackQueue,
    PowerState, ZoneStatus,
};
use crate::upnp::didl::TrackMetaData;
use crate::upnp::scpd::{self, ActionTable, RootDescription};
use crate::upnp::{self, EventValue, TransportMetadata};
use crate::yxc::{SubscriptionHeaders, YxcClient};
use crate::{Error, Result};

const DEFAULT_ZONE: &str = "main";
/// YXC has no GENA-style subscription handshake; "renewal" just means
/// re-sending the `X-AppName`/`X-AppPort` headers on the next poll before
/// the device's internal registration would lapse (spec.md section 4.5).
/// Polls 3s ahead of `SUBSCRIPTION_TIMEOUT_SECS` so the renewal always
/// lands before the device's own registration would expire.
const YXC_RENEWAL_INTERVAL: Duration = Duration::from_secs(crate::yxc::SUBSCRIPTION_TIMEOUT_SECS - 3);

type Reply<T> = oneshot::Sender<Result<T>>;

fn reply<T>(tx: Reply<T>, value: Result<T>) {
    let _ = tx.send(value);
}

#[derive(Debug)]
enum Command {
    PlaybackPlay(Reply<()>),
    PlaybackPause(Reply<()>),
    PlaybackStop(Reply<()>),
    PlaybackNext(Reply<()>),
    PlaybackPrevious(Reply<()>),
    PlaybackLoad {
        url: String,
        meta: Option<TrackMetaData>,
        reply: Reply<()>,
    },
    PlaybackLoadNext {
        url: String,
        meta: Option<TrackMetaData>,
        reply: Reply<()>,
    },
    PlaybackLoadQueue {
        media_url: String,
        items: Vec<(String, TrackMetaData)>,
        reply: Reply<()>,
    },
    SetPower {
        power: PowerState,
        reply: Reply<()>,
    },
    SetInput {
        input: String,
        reply: Reply<()>,
    },
    SetVolume {
        volume: String,
        reply: Reply<()>,
    },
    IncreaseVolume(Reply<()>),
    DecreaseVolume(Reply<()>),
    Mute {
        enable: bool,
        reply: Reply<()>,
    },
    TogglePlayPause(Reply<()>),
    ToggleRepeat(Reply<()>),
    ToggleShuffle(Reply<()>),
    Lookup {
        keys: Vec<String>,
        reply: Reply<Value>,
    },
    WholeState(Reply<DeviceState>),
    YxcEvent(Value),
    UpnpEvent(String),
    Shutdown,
}

/// A cheap, cloneable reference to a running Agent. Every call round-trips
/// through the Agent's inbox so state mutation always happens on the
/// Agent's own task.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    pub device_id: String,
    pub host: String,
}

macro_rules! unit_command {
    ($name:ident, $variant:ident) => {
        pub async fn $name(&self) -> Result<()> {
            self.call(|reply| Command::$variant(reply)).await
        }
    };
}

impl AgentHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(build(tx)).await.map_err(|_| Error::AgentGone)?;
        rx.await.map_err(|_| Error::AgentGone)?
    }

    unit_command!(playback_play, PlaybackPlay);
    unit_command!(playback_pause, PlaybackPause);
    unit_command!(playback_stop, PlaybackStop);
    unit_command!(playback_next, PlaybackNext);
    unit_command!(playback_previous, PlaybackPrevious);
    unit_command!(toggle_play_pause, TogglePlayPause);
    unit_command!(toggle_repeat, ToggleRepeat);
    unit_command!(toggle_shuffle, ToggleShuffle);
    unit_command!(increase_volume, IncreaseVolume);
    unit_command!(decrease_volume, DecreaseVolume);

    pub async fn playback_load(&self, url: String, meta: Option<TrackMetaData>) -> Result<()> {
        self.call(|reply| Command::PlaybackLoad { url, meta, reply }).await
    }

    pub async fn playback_load_next(&self, url: String, meta: Option<TrackMetaData>) -> Result<()> {
        self.call(|reply| Command::PlaybackLoadNext { url, meta, reply }).await
    }

    pub async fn playback_load_queue(&self, media_url: String, items: Vec<(String, TrackMetaData)>) -> Result<()> {
        self.call(|reply| Command::PlaybackLoadQueue { media_url, items, reply }).await
    }

    pub async fn set_power(&self, power: PowerState) -> Result<()> {
        self.call(|reply| Command::SetPower { power, reply }).await
    }

    pub async fn set_input(&self, input: String) -> Result<()> {
        self.call(|reply| Command::SetInput { input, reply }).await
    }

    pub async fn set_volume(&self, volume: String) -> Result<()> {
        self.call(|reply| Command::SetVolume { volume, reply }).await
    }

    pub async fn mute(&self, enable: bool) -> Result<()> {
        self.call(|reply| Command::Mute { enable, reply }).await
    }

    pub async fn lookup(&self, keys: Vec<String>) -> Result<Value> {
        self.call(|reply| Command::Lookup { keys, reply }).await
    }

    pub async fn whole_state(&self) -> Result<DeviceState> {
        self.call(Command::WholeState).await
    }

    /// Forwards a raw, response-code-stripped YXC event payload delivered
    /// by the ingress UDP listener. Fire-and-forget: the event loop applies
    /// it on its own time.
    pub async fn deliver_yxc_event(&self, body: Value) {
        let _ = self.tx.send(Command::YxcEvent(body)).await;
    }

    /// Forwards a raw GENA `NOTIFY` body delivered by the ingress HTTP
    /// callback handler.
    pub async fn deliver_upnp_event(&self, body: String) {
        let _ = self.tx.send(Command::UpnpEvent(body)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }
}

/// Everything the Agent needs at spawn time, resolved once during
/// initialization (spec.md section 4.5 steps 1-9) and then held for the
/// life of the task.
pub struct Agent {
    rx: mpsc::Receiver<Command>,
    http: Client,
    yxc: YxcClient,
    zone: String,
    state: DeviceState,
    av_transport_control_url: Option<String>,
    av_transport_service_type: Option<String>,
    av_transport_event_sub_url: Option<String>,
    av_transport_action_table: ActionTable,
    upnp_renewal_secs: u64,
    registry: Registry,
    pubsub: PubSub,
}

impl Agent {
    /// Runs the full initialization sequence (spec.md section 4.5):
    /// `getDeviceInfo` (enrolling for YXC events), `getFeatures`,
    /// `getNetworkStatus`, then, if a UPnP device description is known,
    /// fetch it, resolve the AVTransport service, parse its SCPD into an
    /// `ActionTable`, and GENA-subscribe. Registers the resulting Agent in
    /// `registry` before returning its handle.
    pub async fn spawn(
        host: String,
        upnp_root_xml: Option<(String, Url)>,
        upnp_callback_url: Option<Url>,
        registry: Registry,
        pubsub: PubSub,
    ) -> Result<AgentHandle> {
        let http = Client::new();
        let yxc = YxcClient::new();

        let device_info = yxc.get_device_info(&host, SubscriptionHeaders::Include).await?;
        let device_id = device_info
            .get("device_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidResponse("getDeviceInfo missing device_id".to_string()))?
            .to_string();

        let features = yxc.get_features(&host).await?;
        let available_inputs = features
            .get("system")
            .and_then(|s| s.get("input_list"))
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let network_status = yxc.get_network_status(&host).await?;
        let network_name = network_status
            .get("network_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut upnp_service = RootDescription {
            device: scpd::DeviceMetadata {
                friendly_name: String::new(),
                device_type: String::new(),
                model_name: None,
                model_number: None,
            },
            icon_list: Vec::new(),
            service_list: Vec::new(),
        };
        let mut av_transport_control_url = None;
        let mut av_transport_service_type = None;
        let mut av_transport_event_sub_url = None;
        let mut av_transport_action_table = ActionTable::default();
        let mut upnp_session_id = None;
        let mut upnp_renewal_secs = upnp::DEFAULT_SUBSCRIBE_TIMEOUT.as_secs();

        if let Some((root_xml, base_url)) = upnp_root_xml {
            upnp_service = scpd::parse_root_description(&root_xml, &base_url)?;
            if let Some(service) = upnp_service
                .find_service("urn:schemas-upnp-org:service:AVTransport:1")
                .cloned()
            {
                let scpd_xml = http.get(&service.scpd_url).send().await?.text().await?;
                av_transport_action_table = scpd::parse_scpd(&scpd_xml)?;
                av_transport_control_url = Some(service.control_url.clone());
                av_transport_service_type = Some(service.service_type.clone());
                av_transport_event_sub_url = Some(service.event_sub_url.clone());

                if let Some(callback) = &upnp_callback_url {
                    match upnp::subscribe(&http, &service.event_sub_url, callback.as_str(), upnp::DEFAULT_SUBSCRIBE_TIMEOUT.as_secs()).await {
                        Ok(sub) => {
                            upnp_session_id = Some(sub.sid);
                            upnp_renewal_secs = sub.granted_timeout_secs;
                        }
                        Err(err) => log::warn!("GENA subscribe to {host} failed: {err:#}"),
                    }
                }
            }
        }

        let raw_status = yxc.get_status_with_enrollment(&host, DEFAULT_ZONE).await?;
        let status: ZoneStatus = serde_json::from_value(raw_status)
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;

        let raw_playback = yxc.get_playback_info(&host, DEFAULT_ZONE).await?;
        let mut playback: PlaybackInfo = serde_json::from_value(raw_playback)
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        let albumart_path = playback.extras.get("albumart_url").and_then(Value::as_str).unwrap_or("").to_string();
        playback.albumart_url = absolutize_albumart(&host, &albumart_path);

        let state = DeviceState {
            host: host.clone(),
            device_id: device_id.clone(),
            network_name,
            available_inputs,
            status,
            playback,
            upnp_service,
            upnp: None,
            upnp_session_id,
            playback_queue: PlaybackQueue::default(),
        };

        let (handle_tx, rx) = mpsc::channel(64);
        let agent = Agent {
            rx,
            http,
            yxc,
            zone: DEFAULT_ZONE.to_string(),
            state,
            av_transport_control_url,
            av_transport_service_type,
            av_transport_event_sub_url,
            av_transport_action_table,
            upnp_renewal_secs,
            registry: registry.clone(),
            pubsub: pubsub.clone(),
        };

        let handle = AgentHandle {
            tx: handle_tx,
            device_id: device_id.clone(),
            host: host.clone(),
        };
        registry.register(&device_id, handle.clone(), &host)?;

        pubsub.publish(
            "network",
            Update {
                device_id: device_id.clone(),
                diff: serde_json::json!({"event": "online", "state": &agent.state}),
            },
        );

        tokio::spawn(agent.run());
        Ok(handle)
    }

    async fn run(mut self) {
        let device_id = self.state.device_id.clone();
        let mut yxc_renewal = interval(YXC_RENEWAL_INTERVAL);
        yxc_renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        yxc_renewal.tick().await; // consume the immediate first tick

        let mut upnp_renewal = interval(Duration::from_secs(self.upnp_renewal_secs.saturating_sub(3).max(1)));
        upnp_renewal.set_missed_tick_behavior(MissedTickBehavior::Delay);
        upnp_renewal.tick().await;

        loop {
            tokio::select! {
                maybe_cmd = self.rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                _ = yxc_renewal.tick() => {
                    if let Err(err) = self.yxc.get_status_with_enrollment(&self.state.host, &self.zone).await {
                        log::warn!("YXC renewal poll for {device_id} failed: {err:#}");
                    }
                }
                _ = upnp_renewal.tick() => {
                    self.renew_upnp_subscription().await;
                }
            }
        }

        self.registry.deregister(&device_id);
        log::debug!("agent for {device_id} shut down");
    }

    async fn renew_upnp_subscription(&mut self) {
        let (Some(event_sub_url), Some(sid)) = (&self.av_transport_event_sub_url, &self.state.upnp_session_id) else {
            return;
        };
        match upnp::subscribe(&self.http, event_sub_url, sid, self.upnp_renewal_secs).await {
            Ok(sub) => {
                self.state.upnp_session_id = Some(sub.sid);
                self.upnp_renewal_secs = sub.granted_timeout_secs;
            }
            Err(err) => log::warn!("GENA renewal for {} failed: {err:#}", self.state.device_id),
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::PlaybackPlay(r) => reply(r, self.yxc_playback("play").await),
            Command::PlaybackPause(r) => reply(r, self.yxc_playback("pause").await),
            Command::PlaybackStop(r) => reply(r, self.yxc_playback("stop").await),
            Command::PlaybackNext(r) => {
                let before = self.state.clone();
                let result = self.queue_step(1).await;
                self.publish_diff(&before);
                reply(r, result);
            }
            Command::PlaybackPrevious(r) => {
                let before = self.state.clone();
                let result = self.queue_step(-1).await;
                self.publish_diff(&before);
                reply(r, result);
            }
            Command::TogglePlayPause(r) => {
                let action = if matches!(self.state.playback.playback, crate::state::PlaybackState::Play) {
                    "pause"
                } else {
                    "play"
                };
                reply(r, self.yxc_playback(action).await);
            }
            Command::ToggleRepeat(r) => reply(r, self.yxc.netusb_toggle_repeat(&self.state.host).await),
            Command::ToggleShuffle(r) => reply(r, self.yxc.netusb_toggle_shuffle(&self.state.host).await),
            Command::IncreaseVolume(r) => reply(r, self.set_volume_inner("up").await),
            Command::DecreaseVolume(r) => reply(r, self.set_volume_inner("down").await),
            Command::SetVolume { volume, reply: r } => reply(r, self.set_volume_inner(&volume).await),
            Command::SetPower { power, reply: r } => {
                let value = match power {
                    PowerState::On => "on",
                    PowerState::Standby => "standby",
                };
                reply(r, self.yxc.set_power(&self.state.host, &self.zone, value).await);
            }
            Command::SetInput { input, reply: r } => {
                reply(r, self.yxc.set_input(&self.state.host, &self.zone, &input).await);
            }
            Command::Mute { enable, reply: r } => {
                reply(r, self.yxc.set_mute(&self.state.host, &self.zone, enable).await);
            }
            Command::PlaybackLoad { url, meta, reply: r } => {
                let result = self.upnp_load(url, meta, false).await;
                reply(r, result);
            }
            Command::PlaybackLoadNext { url, meta, reply: r } => {
                let result = self.upnp_load(url, meta, true).await;
                reply(r, result);
            }
            Command::PlaybackLoadQueue { media_url, items, reply: r } => {
                self.state.playback_queue = PlaybackQueue {
                    media_url: Some(media_url),
                    items,
                };
                reply(r, Ok(()));
            }
            Command::Lookup { keys, reply: r } => reply(r, self.lookup(&keys)),
            Command::WholeState(r) => reply(r, Ok(self.state.clone())),
            Command::YxcEvent(body) => self.apply_yxc_event(body).await,
            Command::UpnpEvent(body) => self.apply_upnp_event(&body).await,
            Command::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn yxc_playback(&self, action: &str) -> Result<()> {
        self.yxc.netusb_set_playback(&self.state.host, action).await
    }

    async fn set_volume_inner(&self, volume: &str) -> Result<()> {
        let step = if volume == "up" || volume == "down" { Some(1) } else { None };
        self.yxc.set_volume(&self.state.host, &self.zone, volume, step).await
    }

    fn lookup(&self, keys: &[String]) -> Result<Value> {
        let whole = serde_json::to_value(&self.state).expect("DeviceState always serializes");
        if keys.is_empty() {
            return Ok(whole);
        }
        let mut out = serde_json::Map::new();
        for key in keys {
            if let Some(v) = whole.get(key) {
                out.insert(key.clone(), v.clone());
            }
        }
        Ok(Value::Object(out))
    }

    /// "UPnP load" (spec.md section 4.5): `Stop` → `SetAVTransportURI` →
    /// `Play`, in that order, for a non-`as_next` load; `as_next` only
    /// stages `SetNextAVTransportURI` and leaves current playback alone.
    /// On a successful non-`as_next` load, `playback_queue.media_url` is
    /// cleared — the freshly-loaded URI isn't necessarily a queue member.
    async fn upnp_load(&mut self, url: String, meta: Option<TrackMetaData>, as_next: bool) -> Result<()> {
        let (Some(control_url), Some(service_type)) = (&self.av_transport_control_url, &self.av_transport_service_type) else {
            return Err(Error::ArgumentError("device has no AVTransport service".to_string()));
        };
        let control_url = control_url.clone();
        let service_type = service_type.clone();
        let transport_meta = match meta {
            Some(m) => TransportMetadata::Track(url.clone(), m),
            None => TransportMetadata::None,
        };
        if as_next {
            upnp::set_next_av_transport_uri(&self.http, &control_url, &service_type, 0, &url, &transport_meta).await
        } else {
            upnp::stop(&self.http, &control_url, &service_type, 0).await?;
            upnp::set_av_transport_uri(&self.http, &control_url, &service_type, 0, &url, &transport_meta).await?;
            upnp::play(&self.http, &control_url, &service_type, 0, 1).await?;
            self.state.playback_queue.media_url = None;
            Ok(())
        }
    }

    /// "Queue next/previous" (spec.md section 4.5): picks
    /// `playback_queue.neighbor` off the current `media_url` (random if
    /// shuffle is on, else index±1 clamped) and UPnP-loads it. A queue
    /// with no items falls back to the plain YXC `setPlayback` transport
    /// command, since there's nothing to navigate.
    async fn queue_step(&mut self, delta: i64) -> Result<()> {
        if self.state.playback_queue.items.is_empty() {
            let action = if delta < 0 { "previous" } else { "next" };
            return self.yxc_playback(action).await;
        }
        let shuffle = self.state.playback.shuffle != "off";
        let (url, meta) = self
            .state
            .playback_queue
            .neighbor(delta, shuffle)
            .cloned()
            .ok_or_else(|| Error::ArgumentError("empty playback queue".to_string()))?;
        self.upnp_load(url.clone(), Some(meta), false).await?;
        self.state.playback_queue.media_url = Some(url);
        Ok(())
    }

    async fn apply_yxc_event(&mut self, body: Value) {
        let before = self.state.clone();
        if let Some(main) = body.get(&self.zone).or_else(|| body.get("main")) {
            if let Some(power) = main.get("power").and_then(Value::as_str) {
                self.state.status.power = if power == "on" { PowerState::On } else { PowerState::Standby };
            }
            if let Some(volume) = main.get("volume").and_then(Value::as_i64) {
                self.state.status.volume = volume as i32;
            }
            if let Some(mute) = main.get("mute").and_then(Value::as_bool) {
                self.state.status.mute = mute;
            }
            if let Some(input) = main.get("input").and_then(Value::as_str) {
                self.state.status.input = input.to_string();
            }
        }
        if body.get("play_info_updated").is_some() {
            match self.yxc.get_playback_info(&self.state.host, &self.zone).await {
                Ok(raw) => match serde_json::from_value::<PlaybackInfo>(raw) {
                    Ok(mut playback) => {
                        let albumart_path = playback.extras.get("albumart_url").and_then(Value::as_str).unwrap_or("").to_string();
                        playback.albumart_url = absolutize_albumart(&self.state.host, &albumart_path);
                        self.state.playback = playback;
                    }
                    Err(err) => log::warn!("malformed getPlayInfo for {}: {err:#}", self.state.device_id),
                },
                Err(err) => log::warn!("getPlayInfo refresh for {} failed: {err:#}", self.state.device_id),
            }
        }
        self.publish_diff(&before);
    }

    async fn apply_upnp_event(&mut self, xml: &str) {
        let before = self.state.clone();
        match upnp::decode_event_body(xml, &self.av_transport_action_table.state_variables) {
            Ok(vars) => {
                let mut event = self.state.upnp.clone().unwrap_or_default();
                if let Some(EventValue::Enum(s)) | Some(EventValue::Str(s)) = vars.get("TransportState").cloned() {
                    event.transport_state = Some(s);
                }
                if let Some(EventValue::Str(s)) = vars.get("AVTransportURI").cloned() {
                    event.av_transport_uri = Some(s);
                }
                if let Some(EventValue::Str(s)) = vars.get("NextAVTransportURI").cloned() {
                    event.next_av_transport_uri = Some(s);
                }
                if let Some(EventValue::Didl(decoded)) = vars.get("CurrentTrackMetaData").cloned() {
                    event.current_track_metadata = decoded.single().map(|(_, m)| m);
                }
                if let Some(EventValue::Didl(decoded)) = vars.get("NextTrackMetaData").cloned() {
                    event.next_track_metadata = decoded.single().map(|(_, m)| m);
                }
                self.state.upnp = Some(event);
            }
            Err(err) => log::warn!("malformed GENA event for {}: {err:#}", self.state.device_id),
        }
        self.publish_diff(&before);
    }

    /// Publishes on the topic named by the device's own id (spec.md
    /// section 4.4) — not a `"device:"`-prefixed topic.
    fn publish_diff(&self, before: &DeviceState) {
        if let Some(diff) = diff_state(before, &self.state) {
            self.pubsub.publish(
                &self.state.device_id,
                Update {
                    device_id: self.state.device_id.clone(),
                    diff,
                },
            );
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("device_id", &self.state.device_id)
            .field("host", &self.state.host)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_restricts_to_requested_keys() {
        let state = DeviceState {
            host: "1.2.3.4".to_string(),
            device_id: "dev1".to_string(),
            network_name: "home".to_string(),
            available_inputs: vec!["net_radio".to_string()],
            status: ZoneStatus::default(),
            playback: PlaybackInfo::default(),
            upnp_service: RootDescription {
                device: scpd::DeviceMetadata {
                    friendly_name: String::new(),
                    device_type: String::new(),
                    model_name: None,
                    model_number: None,
                },
                icon_list: Vec::new(),
                service_list: Vec::new(),
            },
            upnp: None,
            upnp_session_id: None,
            playback_queue: PlaybackQueue::default(),
        };
        let whole = serde_json::to_value(&state).unwrap();
        let mut out = serde_json::Map::new();
        out.insert("network_name".to_string(), whole["network_name"].clone());
        assert_eq!(Value::Object(out), serde_json::json!({"network_name": "home"}));
    }
}
