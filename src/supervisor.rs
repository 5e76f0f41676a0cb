//! The Network Supervisor (spec.md section 4.7): owns the `Registry` and
//! `PubSub`, spawns one Agent per admitted device, and reacts to SSDP
//! sightings. Supervision is transient and one-for-one — a crashed Agent
//! is not auto-restarted; the device is re-admitted the next time SSDP
//! sees it (spec.md section 4.7 invariant).

use std::collections::HashMap;

use reqwest::Url;
use serde_json::Value;

use crate::agent::{Agent, AgentHandle};
use crate::config::Config;
use crate::discovery::{self, DiscoveredDevice};
use crate::registry::{PubSub, Registry};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct Supervisor {
    registry: Registry,
    pubsub: PubSub,
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Supervisor {
            registry: Registry::new(),
            pubsub: PubSub::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    /// Spawns an Agent for `host`, fetching `upnp_root` (if given) first so
    /// the Agent's init sequence can parse it without an extra round trip
    /// back through the supervisor (spec.md section 4.5 step 4).
    ///
    /// A device already present in the registry is left alone — duplicate
    /// SSDP sightings of a running Agent are expected and harmless.
    pub async fn add_device(&self, host: &str, upnp_location: Option<&Url>) -> Result<AgentHandle> {
        let upnp_root_xml = match upnp_location {
            Some(url) => {
                let xml = reqwest::get(url.clone()).await?.text().await?;
                Some((xml, url.clone()))
            }
            None => None,
        };
        Agent::spawn(
            host.to_string(),
            upnp_root_xml,
            self.config.upnp_callback_url.clone(),
            self.registry.clone(),
            self.pubsub.clone(),
        )
        .await
    }

    /// Runs SSDP discovery forever, admitting every newly-sighted
    /// MediaRenderer. Errors from an individual `add_device` call (a
    /// device that went offline between the SSDP packet and the
    /// description fetch, one already registered under a different host)
    /// are logged and do not stop the loop.
    /// `which_devices(lookup_keys)` (spec.md section 6): restricts every
    /// currently registered device's snapshot to `lookup_keys` (the whole
    /// state if empty), keyed by `device_id`. An Agent that's shut down
    /// between `device_ids()` and its own lookup is simply omitted.
    pub async fn which_devices(&self, lookup_keys: &[String]) -> HashMap<String, Value> {
        let mut out = HashMap::new();
        for device_id in self.registry.device_ids() {
            let Some(handle) = self.registry.whereis(&device_id) else {
                continue;
            };
            if let Ok(snapshot) = handle.lookup(lookup_keys.to_vec()).await {
                out.insert(device_id, snapshot);
            }
        }
        out
    }

    pub async fn run_discovery(&self) -> Result<()> {
        let mut sightings = discovery::discover().await?;
        while let Some(DiscoveredDevice { host, location }) = sightings.recv().await {
            if self.registry.device_id_for_host(&host.to_string()).is_some() {
                continue;
            }
            match self.add_device(&host.to_string(), Some(&location)).await {
                Ok(handle) => log::info!("admitted device {} at {}", handle.device_id, handle.host),
                Err(Error::AlreadyRegistered(id)) => log::debug!("device {id} already registered"),
                Err(err) => log::warn!("failed to admit device at {host}: {err:#}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_supervisor_has_empty_registry() {
        let supervisor = Supervisor::new(Config::default());
        assert!(supervisor.registry().device_ids().is_empty());
    }
}
