//! Runs SSDP discovery and prints every admitted device's network name and
//! available inputs as they come online.

use musiccast::config::Config;
use musiccast::supervisor::Supervisor;

#[tokio::main]
async fn main() -> musiccast::Result<()> {
    env_logger::init();

    let supervisor = Supervisor::new(Config::from_env());
    let registry = supervisor.registry().clone();

    tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            if let Err(err) = supervisor.run_discovery().await {
                log::error!("discovery loop exited: {err:#}");
            }
        }
    });

    let mut seen = std::collections::HashSet::new();
    loop {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        for device_id in registry.device_ids() {
            if seen.insert(device_id.clone()) {
                if let Some(handle) = registry.whereis(&device_id) {
                    match handle.whole_state().await {
                        Ok(state) => println!(
                            "{} @ {} — inputs: {:?}",
                            state.network_name, state.host, state.available_inputs
                        ),
                        Err(err) => log::warn!("{device_id}: {err:#}"),
                    }
                }
            }
        }
    }
}
