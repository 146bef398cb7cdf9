use certify::dgi::DgiClient;
use queue::NetworkState;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const PROBE_PERIOD: Duration = Duration::from_secs(30);

/// Feeds the scheduler's network signal from the DGI health endpoint.
/// Transitions (offline -> online) are what wake the queue; steady states
/// are absorbed by the monitor.
pub fn spawn(client: Arc<DgiClient>, network: Arc<NetworkState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let up = client.health().await;
            network.set_connected(up);
            tokio::time::sleep(PROBE_PERIOD).await;
        }
    })
}
