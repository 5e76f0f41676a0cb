//! Yamaha Extended Control (YXC) REST client (spec.md section 4.3).
//!
//! Stateless: every call is a fresh HTTP request against
//! `http://<host>/YamahaExtendedControl/v1<path>`. `response_code` is
//! stripped from successful payloads before they're handed back to the
//! caller; a non-zero code is turned into a named `YxcErrorKind`.

use crate::{Error, Result};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Enrollment headers for unicast YXC events (spec.md section 4.3/4.6):
/// sent on `getDeviceInfo` at Agent init and on every renewal tick.
pub const APP_NAME_HEADER: &str = "MusicCast/1.50";
pub const APP_PORT_HEADER: &str = "41100";

/// Poll/subscription interval; renewal is scheduled at `max(0, t-3)`.
pub const SUBSCRIPTION_TIMEOUT_SECS: u64 = 180;

/// `response_code` → named error kind (spec.md section 7). The exact
/// numeric assignment follows the order spec.md's table lists the kinds
/// in; what matters for the invariant in section 8 is that the mapping is
/// total and deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YxcErrorKind {
    Initializing,
    InternalError,
    InvalidRequest,
    InvalidParameter,
    Guarded,
    Timeout,
    FirmwareUpdating,
    AccessError,
    StreamingError,
    WrongUsername,
    WrongPassword,
    AccountExpired,
    AccountDisconnected,
    AccountLimitReached,
    ServerMaintenance,
    InvalidAccount,
    LicenseError,
    ReadOnlyMode,
    MaxStations,
    AccessDenied,
    UnknownError,
}

impl YxcErrorKind {
    pub fn from_code(code: i32) -> Self {
        use YxcErrorKind::*;
        match code {
            1 => Initializing,
            2 => InternalError,
            3 => InvalidRequest,
            4 => InvalidParameter,
            5 => Guarded,
            6 => Timeout,
            7 => FirmwareUpdating,
            8 => AccessError,
            9 => StreamingError,
            10 => WrongUsername,
            11 => WrongPassword,
            12 => AccountExpired,
            13 => AccountDisconnected,
            14 => AccountLimitReached,
            15 => ServerMaintenance,
            16 => InvalidAccount,
            17 => LicenseError,
            18 => ReadOnlyMode,
            19 => MaxStations,
            20 => AccessDenied,
            _ => UnknownError,
        }
    }
}

impl std::fmt::Display for YxcErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for YxcErrorKind {}

#[derive(Debug, Clone, Copy, Default)]
pub enum SubscriptionHeaders {
    #[default]
    Omit,
    Include,
}

/// Stateless YXC client: one `reqwest::Client` reused across calls.
#[derive(Debug, Clone)]
pub struct YxcClient {
    http: Client,
}

impl Default for YxcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl YxcClient {
    pub fn new() -> Self {
        YxcClient {
            http: Client::new(),
        }
    }

    fn base_url(host: &str, path: &str) -> String {
        format!("http://{host}/YamahaExtendedControl/v1{path}")
    }

    async fn get_raw(
        &self,
        host: &str,
        path: &str,
        query: &[(&str, &str)],
        headers: SubscriptionHeaders,
    ) -> Result<Value> {
        let mut req = self.http.get(Self::base_url(host, path)).query(query);
        if let SubscriptionHeaders::Include = headers {
            req = req
                .header("X-AppName", APP_NAME_HEADER)
                .header("X-AppPort", APP_PORT_HEADER);
        }
        let response = req.send().await.map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "YXC {path} returned status {}",
                response.status()
            )));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        Self::strip_response_code(value)
    }

    async fn post_raw(&self, host: &str, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(Self::base_url(host, path))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Transport(format!(
                "YXC {path} returned status {}",
                response.status()
            )));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        Self::strip_response_code(value)
    }

    fn strip_response_code(mut value: Value) -> Result<Value> {
        let obj = value
            .as_object_mut()
            .ok_or_else(|| Error::InvalidResponse("response is not a JSON object".to_string()))?;
        let code = obj
            .get("response_code")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::InvalidResponse("missing response_code".to_string()))? as i32;
        if code != 0 {
            return Err(Error::Yxc(YxcErrorKind::from_code(code)));
        }
        obj.remove("response_code");
        Ok(value)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        host: &str,
        path: &str,
        query: &[(&str, &str)],
        headers: SubscriptionHeaders,
    ) -> Result<T> {
        let value = self.get_raw(host, path, query, headers).await?;
        serde_json::from_value(value).map_err(|e| Error::InvalidResponse(e.to_string()))
    }

    // ---- System ----

    pub async fn get_device_info(&self, host: &str, headers: SubscriptionHeaders) -> Result<Value> {
        self.get_raw(host, "/system/getDeviceInfo", &[], headers).await
    }

    pub async fn get_features(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/system/getFeatures", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn get_network_status(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/system/getNetworkStatus", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn get_func_status(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/system/getFuncStatus", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn get_location_info(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/system/getLocationInfo", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn set_auto_power_standby(&self, host: &str, enable: bool) -> Result<()> {
        let onoff = if enable { "on" } else { "off" };
        self.get_raw(
            host,
            "/system/setAutoPowerStandby",
            &[("enable", onoff)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    pub async fn send_ir_code(&self, host: &str, code: &str) -> Result<()> {
        self.get_raw(host, "/system/sendIrCode", &[("code", code)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    // ---- Zone ----

    pub async fn get_status(&self, host: &str, zone: &str) -> Result<Value> {
        self.get_raw(host, &format!("/{zone}/getStatus"), &[], SubscriptionHeaders::Omit).await
    }

    /// Same as `get_status` but enrolled for unicast events — used on the
    /// renewal tick, which doubles as the enrollment refresh.
    pub async fn get_status_with_enrollment(&self, host: &str, zone: &str) -> Result<Value> {
        self.get_raw(host, &format!("/{zone}/getStatus"), &[], SubscriptionHeaders::Include).await
    }

    pub async fn set_power(&self, host: &str, zone: &str, power: &str) -> Result<()> {
        self.get_raw(host, &format!("/{zone}/setPower"), &[("power", power)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    pub async fn set_sleep(&self, host: &str, zone: &str, seconds: i32) -> Result<()> {
        let s = seconds.to_string();
        self.get_raw(host, &format!("/{zone}/setSleep"), &[("sleep", &s)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    /// `setVolume`; per spec.md section 9's Open Question resolution, the
    /// `step` argument is only included when `volume` is literally `"up"`
    /// or `"down"`.
    pub async fn set_volume(&self, host: &str, zone: &str, volume: &str, step: Option<i32>) -> Result<()> {
        let include_step = volume == "up" || volume == "down";
        let step_str = step.unwrap_or(1).to_string();
        let mut query = vec![("volume", volume)];
        if include_step {
            query.push(("step", step_str.as_str()));
        }
        self.get_raw(host, &format!("/{zone}/setVolume"), &query, SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    pub async fn set_mute(&self, host: &str, zone: &str, enable: bool) -> Result<()> {
        let onoff = if enable { "true" } else { "false" };
        self.get_raw(host, &format!("/{zone}/setMute"), &[("enable", onoff)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    pub async fn set_input(&self, host: &str, zone: &str, input: &str) -> Result<()> {
        self.get_raw(host, &format!("/{zone}/setInput"), &[("input", input)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    pub async fn set_sound_program(&self, host: &str, zone: &str, program: &str) -> Result<()> {
        self.get_raw(
            host,
            &format!("/{zone}/setSoundProgram"),
            &[("program", program)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    pub async fn prepare_input_change(&self, host: &str, zone: &str, input: &str) -> Result<()> {
        self.get_raw(
            host,
            &format!("/{zone}/prepareInputChange"),
            &[("input", input)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    // ---- Playback (netusb / tuner / cd share the same shape) ----

    pub async fn get_playback_info(&self, host: &str, zone: &str) -> Result<Value> {
        self.get_raw(host, &format!("/{zone}/getPlayInfo"), &[], SubscriptionHeaders::Omit).await
    }

    pub async fn netusb_get_play_info(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/netusb/getPlayInfo", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn netusb_get_preset_info(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/netusb/getPresetInfo", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn netusb_set_playback(&self, host: &str, action: &str) -> Result<()> {
        self.get_raw(
            host,
            "/netusb/setPlayback",
            &[("playback", action)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    pub async fn netusb_toggle_repeat(&self, host: &str) -> Result<()> {
        self.get_raw(host, "/netusb/toggleRepeat", &[], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    pub async fn netusb_toggle_shuffle(&self, host: &str) -> Result<()> {
        self.get_raw(host, "/netusb/toggleShuffle", &[], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    /// `getListInfo`; defaults `index=0`, `size=8` (spec.md section 8).
    pub async fn netusb_get_list_info(&self, host: &str, index: Option<i32>, size: Option<i32>) -> Result<Value> {
        let index = index.unwrap_or(0).to_string();
        let size = size.unwrap_or(8).to_string();
        self.get_raw(
            host,
            "/netusb/getListInfo",
            &[("index", &index), ("size", &size)],
            SubscriptionHeaders::Omit,
        )
        .await
    }

    pub async fn netusb_set_list_control(&self, host: &str, list_id: &str, typ: &str, index: Option<i32>) -> Result<()> {
        let mut query = vec![("list_id", list_id), ("type", typ)];
        let idx_str;
        if let Some(idx) = index {
            idx_str = idx.to_string();
            query.push(("index", idx_str.as_str()));
        }
        self.get_raw(host, "/netusb/setListControl", &query, SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    /// The one POST endpoint: `setSearchString` (spec.md section 4.3).
    pub async fn netusb_set_search_string(&self, host: &str, list_id: &str, string: &str) -> Result<()> {
        let body = serde_json::json!({"list_id": list_id, "string": string});
        self.post_raw(host, "/netusb/setSearchString", &body).await.map(|_| ())
    }

    pub async fn netusb_recall_preset(&self, host: &str, zone: &str, num: i32) -> Result<()> {
        let zone_owned = zone.to_string();
        let num_str = num.to_string();
        self.get_raw(
            host,
            "/netusb/recallPreset",
            &[("zone", &zone_owned), ("num", &num_str)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    pub async fn netusb_store_preset(&self, host: &str, num: i32) -> Result<()> {
        let num_str = num.to_string();
        self.get_raw(host, "/netusb/storePreset", &[("num", &num_str)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    pub async fn netusb_get_account_status(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/netusb/getAccountStatus", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn netusb_switch_account(&self, host: &str, input: &str, index: i32) -> Result<()> {
        let index_str = index.to_string();
        self.get_raw(
            host,
            "/netusb/switchAccount",
            &[("input", input), ("index", &index_str)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    pub async fn netusb_get_service_info(&self, host: &str, input: &str, typ: &str) -> Result<Value> {
        self.get_raw(
            host,
            "/netusb/getServiceInfo",
            &[("input", input), ("type", typ)],
            SubscriptionHeaders::Omit,
        )
        .await
    }

    // ---- Tuner ----

    pub async fn tuner_get_preset_info(&self, host: &str, band: &str) -> Result<Value> {
        self.get_raw(host, "/tuner/getPresetInfo", &[("band", band)], SubscriptionHeaders::Omit).await
    }

    pub async fn tuner_get_play_info(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/tuner/getPlayInfo", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn tuner_set_freq(&self, host: &str, band: &str, tuning: &str, num: i32) -> Result<()> {
        let num_str = num.to_string();
        self.get_raw(
            host,
            "/tuner/setFreq",
            &[("band", band), ("tuning", tuning), ("num", &num_str)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    pub async fn tuner_recall_preset(&self, host: &str, zone: &str, band: &str, num: i32) -> Result<()> {
        let zone_owned = zone.to_string();
        let num_str = num.to_string();
        self.get_raw(
            host,
            "/tuner/recallPreset",
            &[("zone", &zone_owned), ("band", band), ("num", &num_str)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    pub async fn tuner_store_preset(&self, host: &str, band: &str, num: i32) -> Result<()> {
        let num_str = num.to_string();
        self.get_raw(
            host,
            "/tuner/storePreset",
            &[("band", band), ("num", &num_str)],
            SubscriptionHeaders::Omit,
        )
        .await
        .map(|_| ())
    }

    pub async fn tuner_switch_preset(&self, host: &str, dir: &str) -> Result<()> {
        self.get_raw(host, "/tuner/switchPreset", &[("dir", dir)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    pub async fn tuner_set_dab(&self, host: &str, service_type: &str) -> Result<()> {
        self.get_raw(host, "/tuner/setDabService", &[("type", service_type)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    // ---- CD ----

    pub async fn cd_get_play_info(&self, host: &str) -> Result<Value> {
        self.get_raw(host, "/cd/getPlayInfo", &[], SubscriptionHeaders::Omit).await
    }

    pub async fn cd_set_playback(&self, host: &str, action: &str) -> Result<()> {
        self.get_raw(host, "/cd/setPlayback", &[("playback", action)], SubscriptionHeaders::Omit)
            .await
            .map(|_| ())
    }

    pub async fn cd_toggle_tray(&self, host: &str) -> Result<()> {
        self.get_raw(host, "/cd/toggleTray", &[], SubscriptionHeaders::Omit).await.map(|_| ())
    }

    pub async fn cd_toggle_repeat(&self, host: &str) -> Result<()> {
        self.get_raw(host, "/cd/toggleRepeat", &[], SubscriptionHeaders::Omit).await.map(|_| ())
    }

    pub async fn cd_toggle_shuffle(&self, host: &str) -> Result<()> {
        self.get_raw(host, "/cd/toggleShuffle", &[], SubscriptionHeaders::Omit).await.map(|_| ())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_code_mapping_is_total_and_deterministic() {
        for code in 1..=20 {
            let a = YxcErrorKind::from_code(code);
            let b = YxcErrorKind::from_code(code);
            assert_eq!(a, b);
        }
        assert_eq!(YxcErrorKind::from_code(999), YxcErrorKind::UnknownError);
    }

    #[test]
    fn strip_response_code_removes_field_on_success() {
        let v = serde_json::json!({"response_code": 0, "volume": 42});
        let stripped = YxcClient::strip_response_code(v).unwrap();
        assert!(stripped.get("response_code").is_none());
        assert_eq!(stripped["volume"], 42);
    }

    #[test]
    fn strip_response_code_errors_on_nonzero() {
        let v = serde_json::json!({"response_code": 4});
        let err = YxcClient::strip_response_code(v).unwrap_err();
        assert!(matches!(err, Error::Yxc(YxcErrorKind::InvalidParameter)));
    }
}
