// Discovery daemon: finds HDHomeRun tuners on the LAN and advertises their
// capture devices until interrupted. The recorder-facing control surface
// lives elsewhere; this binary exists to run the bridge standalone.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use tunerlink::config::Config;
use tunerlink::discovery::discoverer::TunerDiscoverer;
use tunerlink::discovery::{DeviceLoader, TlvControl, TunerRecord};
use tunerlink::logging;
use tunerlink::options::OptionStore;

struct AdvertisingLoader;

impl DeviceLoader for AdvertisingLoader {
    fn advertise_device(&self, tuner: &TunerRecord) {
        info!(
            tuner = %tuner.name,
            description = %tuner.description,
            "capture device available"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref()).context("loading configuration")?;
    logging::init_logging(&config.logging)?;

    let store = Arc::new(
        OptionStore::load(&config.storage.options_file).context("loading device options")?,
    );
    let discoverer = TunerDiscoverer::new(
        store.clone(),
        Arc::new(AdvertisingLoader),
        Arc::new(TlvControl),
    );
    discoverer.start().context("starting discovery")?;
    store.save().context("persisting device options")?;

    info!("discovery running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    discoverer.stop();
    discoverer.wait_for_stop().await;
    info!(devices = discoverer.device_count(), "stopped");
    Ok(())
}
