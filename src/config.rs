//! Process-wide configuration (spec.md section 4.6 / ambient stack).

use url::Url;

/// The only thing this crate can't discover on its own: where GENA
/// `NOTIFY` requests should be delivered. Left unset, UPnP eventing is
/// simply skipped during Agent initialization (state still works off YXC
/// polling and unicast events alone).
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub upnp_callback_url: Option<Url>,
}

impl Config {
    /// Reads `MUSICCAST_UPNP_CALLBACK_URL`. An unset or empty variable
    /// yields `None` rather than an error; a set-but-unparsable one is
    /// logged and treated as unset, matching the teacher's "log and
    /// degrade" posture for best-effort inputs.
    pub fn from_env() -> Self {
        let upnp_callback_url = std::env::var("MUSICCAST_UPNP_CALLBACK_URL")
            .ok()
            .filter(|s| !s.is_empty())
            .and_then(|raw| match raw.parse::<Url>() {
                Ok(url) => Some(url),
                Err(err) => {
                    log::warn!("MUSICCAST_UPNP_CALLBACK_URL={raw:?} is not a valid URL: {err:#}");
                    None
                }
            });
        Config { upnp_callback_url }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn missing_env_var_yields_none() {
        std::env::remove_var("MUSICCAST_UPNP_CALLBACK_URL");
        assert!(Config::from_env().upnp_callback_url.is_none());
    }

    #[test]
    fn invalid_url_is_treated_as_unset() {
        std::env::set_var("MUSICCAST_UPNP_CALLBACK_URL", "not a url");
        assert!(Config::from_env().upnp_callback_url.is_none());
        std::env::remove_var("MUSICCAST_UPNP_CALLBACK_URL");
    }
}
