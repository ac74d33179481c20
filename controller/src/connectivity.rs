//! Connectivity acquisition. Runs at the start of every duty cycle and
//! does not return until the station is online, provisioning timed out,
//! or (wired mode) the single probe has been made.

use std::time::Duration;

use tracing::info;

use fieldstation_common::{LinkMetrics, StationMode};

use crate::eventlog::EventLog;
use crate::net::NetworkControl;
use crate::store::ConfigStore;

/// Where the reachability probe points. Any stable HTTP 200 endpoint
/// works; the collection server itself is the natural choice.
pub const REACHABILITY_URL: &str = "http://connectivitycheck.gstatic.com/generate_204";

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectivityOutcome {
    /// Online. Metrics are absent when the query tool failed even though
    /// the probe succeeded.
    Connected(Option<LinkMetrics>),
    /// Wired mode only: the probe failed and there is no credential
    /// loop to fall back to.
    Offline,
    /// The provisioning window expired with nobody at the portal. The
    /// cycle should end and the station power off to save charge.
    ShutdownRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalOutcome {
    /// An operator submitted credentials; they are already persisted.
    Submitted,
    /// Nobody connected before the provisioning window closed.
    TimedOut,
}

/// Serves the provisioning UI while the AP is up. Implemented over axum
/// in production; substituted in tests.
pub trait ProvisioningPortal {
    fn run(&self) -> impl std::future::Future<Output = anyhow::Result<PortalOutcome>> + Send;
}

pub struct ConnectivityStateMachine<'a, N, P> {
    net: &'a N,
    portal: &'a P,
    store: &'a ConfigStore,
    events: &'a EventLog,
}

impl<'a, N, P> ConnectivityStateMachine<'a, N, P>
where
    N: NetworkControl + Sync,
    P: ProvisioningPortal + Sync,
{
    pub fn new(net: &'a N, portal: &'a P, store: &'a ConfigStore, events: &'a EventLog) -> Self {
        Self {
            net,
            portal,
            store,
            events,
        }
    }

    pub async fn acquire(&self) -> anyhow::Result<ConnectivityOutcome> {
        let mode = self.store.load().await?.device.mode;
        match mode {
            StationMode::Wired => self.acquire_wired().await,
            StationMode::Wifi => self.acquire_wifi().await,
        }
    }

    /// Wired links are not provisioned in the field, so a failed probe
    /// is terminal for the cycle.
    async fn acquire_wired(&self) -> anyhow::Result<ConnectivityOutcome> {
        if !self.net.probe_reachability(REACHABILITY_URL).await {
            self.events.error("E00", "unable to connect to the internet");
            return Ok(ConnectivityOutcome::Offline);
        }

        self.events.info("M00", "network connection successful");
        let metrics = self
            .net
            .query_link_metrics(StationMode::Wired.interface())
            .await;
        Ok(ConnectivityOutcome::Connected(metrics))
    }

    /// Loop until online or the operator window closes. The config file
    /// is reloaded every iteration so credentials submitted through the
    /// portal (or edited by hand over the AP) take effect immediately.
    async fn acquire_wifi(&self) -> anyhow::Result<ConnectivityOutcome> {
        loop {
            let config = self.store.load().await?;

            if !config.network.has_credentials() {
                self.events
                    .info("M01", "no credentials stored, starting provisioning AP");
                match self.provision().await? {
                    PortalOutcome::Submitted => continue,
                    PortalOutcome::TimedOut => {
                        return Ok(ConnectivityOutcome::ShutdownRequested);
                    }
                }
            }

            if config.network.priority {
                if let Err(err) = self
                    .net
                    .join_network(&config.network.ssid, &config.network.password)
                    .await
                {
                    self.events
                        .error("E02", &format!("priority join failed: {err:#}"));
                }
            } else if let Err(err) = self.net.restart_auto_connect().await {
                self.events
                    .error("E02", &format!("auto-connect restart failed: {err:#}"));
            }

            tokio::time::sleep(Duration::from_secs(config.delays.stabilize_secs)).await;

            if !self.net.probe_reachability(REACHABILITY_URL).await {
                // The stored credentials may simply be wrong, so every
                // failed attempt reopens the portal. The portal timeout
                // is what keeps this loop from running the battery down.
                self.events.error("E00", "unable to connect to the internet");
                match self.provision().await? {
                    PortalOutcome::Submitted => continue,
                    PortalOutcome::TimedOut => {
                        return Ok(ConnectivityOutcome::ShutdownRequested);
                    }
                }
            }

            self.events.info("M00", "network connection successful");
            let metrics = self
                .net
                .query_link_metrics(StationMode::Wifi.interface())
                .await;

            if let Some(quality) = metrics.as_ref().and_then(LinkMetrics::wifi_quality) {
                if quality < config.network.link_quality_threshold {
                    // Advisory only. A weak link still beats no upload.
                    self.events.info(
                        "M03",
                        &format!(
                            "connected but link unstable: quality {quality}% below threshold {}%",
                            config.network.link_quality_threshold
                        ),
                    );
                } else {
                    info!(quality, "wifi link healthy");
                }
            }

            return Ok(ConnectivityOutcome::Connected(metrics));
        }
    }

    /// AP up, portal until submission or timeout, AP down. The AP is
    /// torn down before the outcome is inspected so no path leaves it
    /// running.
    async fn provision(&self) -> anyhow::Result<PortalOutcome> {
        self.net.start_ap().await?;
        let outcome = self.portal.run().await;
        self.net.stop_ap().await?;

        let outcome = outcome?;
        match outcome {
            PortalOutcome::Submitted => {
                self.events.info("M02", "credentials received from portal");
            }
            PortalOutcome::TimedOut => {
                self.events
                    .error("E01", "provisioning window expired without a submission");
            }
        }
        Ok(outcome)
    }
}
