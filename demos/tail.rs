//! Discovers devices, then tails the pubsub diff stream of the first one
//! admitted — handy for watching what a remote/volume/input change on the
//! device actually publishes.

use musiccast::config::Config;
use musiccast::supervisor::Supervisor;

#[tokio::main]
async fn main() -> musiccast::Result<()> {
    env_logger::init();

    let supervisor = Supervisor::new(Config::from_env());
    let registry = supervisor.registry().clone();
    let pubsub = supervisor.pubsub().clone();

    tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            if let Err(err) = supervisor.run_discovery().await {
                log::error!("discovery loop exited: {err:#}");
            }
        }
    });

    let device_id = loop {
        if let Some(id) = registry.device_ids().into_iter().next() {
            break id;
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    };

    println!("tailing updates for {device_id}");
    let mut updates = pubsub.subscribe(&device_id);
    while let Some(update) = updates.recv().await {
        println!("{}: {}", update.device_id, update.diff);
    }

    Ok(())
}
