//! OS-level network control: NetworkManager/hostapd for station vs AP
//! mode, iwconfig for Wi-Fi link metrics, sysfs for wired metrics, and
//! an HTTP reachability probe.

use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;
use tracing::{debug, warn};

use fieldstation_common::LinkMetrics;

/// Static address the device takes while hosting the provisioning AP;
/// the captive portal redirects all port-80 traffic here.
pub const AP_ADDRESS: &str = "10.3.141.1";
pub const PORTAL_PORT: u16 = 8000;

const WIFI_CONNECTION_NAME: &str = "station-wifi";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub trait NetworkControl {
    fn start_ap(&self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    fn stop_ap(&self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    fn join_network(
        &self,
        ssid: &str,
        password: &str,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    fn restart_auto_connect(&self) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
    fn query_link_metrics(
        &self,
        interface: &str,
    ) -> impl std::future::Future<Output = Option<LinkMetrics>> + Send;
    fn probe_reachability(&self, url: &str) -> impl std::future::Future<Output = bool> + Send;
}

pub struct NetworkManagerControl {
    http: reqwest::Client,
}

impl NetworkManagerControl {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("failed to build reachability probe client")?;
        Ok(Self { http })
    }

    async fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to spawn {program}"))?;

        if !output.status.success() {
            anyhow::bail!(
                "{program} {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Best-effort variant for steps where failure is acceptable
    /// (deleting a connection profile that may not exist yet).
    async fn run_unchecked(&self, program: &str, args: &[&str]) {
        if let Err(err) = self.run(program, args).await {
            debug!("{err:#}");
        }
    }

    /// dnsmasq + NAT redirect so any HTTP request from an associated
    /// phone lands on the provisioning form.
    async fn enable_captive_portal(&self) -> anyhow::Result<()> {
        self.run("sudo", &["systemctl", "restart", "dnsmasq"]).await?;
        self.run(
            "sudo",
            &["sh", "-c", "echo 1 > /proc/sys/net/ipv4/ip_forward"],
        )
        .await?;
        self.run("sudo", &["iptables", "-t", "nat", "-F"]).await?;
        let portal = format!("{AP_ADDRESS}:{PORTAL_PORT}");
        self.run(
            "sudo",
            &[
                "iptables", "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "--dport", "80", "-j",
                "DNAT", "--to-destination", &portal,
            ],
        )
        .await?;
        self.run(
            "sudo",
            &["iptables", "-t", "nat", "-A", "POSTROUTING", "-j", "MASQUERADE"],
        )
        .await?;
        Ok(())
    }

    async fn wired_metrics(&self, interface: &str) -> Option<LinkMetrics> {
        let carrier = tokio::fs::read_to_string(format!("/sys/class/net/{interface}/carrier"))
            .await
            .ok()?;
        let link_detected = carrier.trim() == "1";
        let speed_mbps = tokio::fs::read_to_string(format!("/sys/class/net/{interface}/speed"))
            .await
            .ok()
            .and_then(|raw| raw.trim().parse::<u32>().ok());

        Some(LinkMetrics::Wired {
            interface: interface.to_string(),
            link_detected,
            speed_mbps,
        })
    }
}

impl NetworkControl for NetworkManagerControl {
    async fn start_ap(&self) -> anyhow::Result<()> {
        self.run("sudo", &["systemctl", "stop", "NetworkManager"]).await?;
        self.run(
            "sudo",
            &["ifconfig", "wlan0", AP_ADDRESS, "netmask", "255.255.255.0", "up"],
        )
        .await?;
        self.run("sudo", &["systemctl", "restart", "hostapd"]).await?;
        self.enable_captive_portal().await
    }

    async fn stop_ap(&self) -> anyhow::Result<()> {
        self.run("sudo", &["systemctl", "stop", "hostapd"]).await?;
        self.run("sudo", &["systemctl", "start", "NetworkManager"]).await?;
        Ok(())
    }

    /// System-scoped connection profile for the configured SSID, so the
    /// join survives reboots and needs no desktop session.
    async fn join_network(&self, ssid: &str, password: &str) -> anyhow::Result<()> {
        self.run("sudo", &["systemctl", "start", "NetworkManager"]).await?;
        self.run_unchecked("nmcli", &["connection", "delete", WIFI_CONNECTION_NAME])
            .await;
        self.run(
            "nmcli",
            &[
                "connection", "add", "type", "wifi", "ifname", "wlan0", "con-name",
                WIFI_CONNECTION_NAME, "ssid", ssid,
                "802-11-wireless-security.key-mgmt", "wpa-psk", "wifi-sec.psk", password,
            ],
        )
        .await?;
        self.run("nmcli", &["connection", "up", WIFI_CONNECTION_NAME]).await?;
        Ok(())
    }

    async fn restart_auto_connect(&self) -> anyhow::Result<()> {
        self.run("sudo", &["systemctl", "restart", "NetworkManager"]).await?;
        Ok(())
    }

    async fn query_link_metrics(&self, interface: &str) -> Option<LinkMetrics> {
        if !interface.starts_with("wlan") {
            return self.wired_metrics(interface).await;
        }

        match self.run("iwconfig", &[interface]).await {
            Ok(output) => parse_iwconfig(interface, &output),
            Err(err) => {
                warn!("iwconfig {interface} failed: {err:#}");
                None
            }
        }
    }

    async fn probe_reachability(&self, url: &str) -> bool {
        match self.http.get(url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(err) => {
                debug!("reachability probe failed: {err}");
                false
            }
        }
    }
}

/// Pull `Link Quality=54/70` and `Signal level=-45 dBm` out of iwconfig
/// output. Quality is normalized to a percentage.
fn parse_iwconfig(interface: &str, output: &str) -> Option<LinkMetrics> {
    let quality_raw = find_after(output, "Link Quality=")?;
    let (numerator, denominator) = quality_raw.split_once('/')?;
    let numerator: u32 = numerator.trim().parse().ok()?;
    let denominator: u32 = denominator.trim().parse().ok()?;
    if denominator == 0 {
        return None;
    }
    let link_quality_percent = ((numerator * 100) / denominator).min(100) as u8;

    let signal_level_dbm = find_after(output, "Signal level=")
        .and_then(|value| value.trim_end_matches("dBm").trim().parse::<i32>().ok());

    Some(LinkMetrics::Wifi {
        interface: interface.to_string(),
        link_quality_percent,
        signal_level_dbm,
    })
}

/// Token immediately following `key`, terminated by whitespace.
fn find_after<'a>(haystack: &'a str, key: &str) -> Option<&'a str> {
    let start = haystack.find(key)? + key.len();
    let rest = &haystack[start..];
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const IWCONFIG_OUTPUT: &str = "\
wlan0     IEEE 802.11  ESSID:\"field-ap\"
          Mode:Managed  Frequency:2.437 GHz  Access Point: AA:BB:CC:DD:EE:FF
          Bit Rate=72.2 Mb/s   Tx-Power=31 dBm
          Link Quality=54/70  Signal level=-45 dBm
          Rx invalid nwid:0  Rx invalid crypt:0  Rx invalid frag:0
";

    #[test]
    fn parses_quality_and_signal() {
        let metrics = parse_iwconfig("wlan0", IWCONFIG_OUTPUT).unwrap();
        assert_eq!(
            metrics,
            LinkMetrics::Wifi {
                interface: "wlan0".to_string(),
                link_quality_percent: 77,
                signal_level_dbm: Some(-45),
            }
        );
    }

    #[test]
    fn missing_quality_yields_none() {
        assert_eq!(parse_iwconfig("wlan0", "wlan0  no wireless extensions."), None);
    }

    #[test]
    fn tolerates_missing_signal_level() {
        let output = "wlan0  Link Quality=30/70\n";
        let metrics = parse_iwconfig("wlan0", output).unwrap();
        assert_eq!(metrics.wifi_quality(), Some(42));
        match metrics {
            LinkMetrics::Wifi {
                signal_level_dbm, ..
            } => assert_eq!(signal_level_dbm, None),
            _ => unreachable!(),
        }
    }
}
