use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;

use crate::error::RotateError;

/// Rotates the egress identity (VPN IP, proxy, whatever the deployment
/// uses) so a BLOCKED target gets a fresh fingerprint on the next tick.
/// The Scheduler treats this trait opaquely.
#[async_trait::async_trait]
pub trait IdentityRotator: Send + Sync {
    /// Returns (old identity, new identity) on success.
    async fn rotate(&self) -> Result<(String, String), RotateError>;
}

#[derive(Debug, Deserialize)]
struct PublicIpResponse {
    #[serde(alias = "public_ip", alias = "ip")]
    ip: String,
}

/// Rotates a Gluetun-managed VPN tunnel via its local control-plane API:
/// stop the tunnel, wait, start it, wait for it to report healthy, then
/// verify the egress IP actually changed, retrying up to `max_attempts`.
pub struct GluetunRotator {
    base_url: String,
    client: reqwest::Client,
    max_attempts: u32,
}

impl GluetunRotator {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            max_attempts: 3,
        }
    }

    async fn current_ip(&self) -> Result<String, RotateError> {
        let url = format!("{}/v1/publicip/ip", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RotateError::Unreachable(e.to_string()))?
            .json::<PublicIpResponse>()
            .await
            .map_err(|e| RotateError::Unreachable(e.to_string()))?;
        Ok(resp.ip)
    }

    async fn set_vpn_status(&self, status: &str) -> Result<(), RotateError> {
        let url = format!("{}/v1/openvpn/status", self.base_url);
        self.client
            .put(&url)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await
            .map_err(|e| RotateError::Unreachable(e.to_string()))?;
        Ok(())
    }

    async fn vpn_status(&self) -> Result<String, RotateError> {
        #[derive(Deserialize)]
        struct Status {
            status: String,
        }
        let url = format!("{}/v1/openvpn/status", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RotateError::Unreachable(e.to_string()))?
            .json::<Status>()
            .await
            .map_err(|e| RotateError::Unreachable(e.to_string()))?;
        Ok(resp.status)
    }

    async fn wait_for_vpn_ready(&self, timeout: Duration) -> Result<(), RotateError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(status) = self.vpn_status().await {
                if status == "running" {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RotateError::Unreachable("vpn never became ready".into()));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[async_trait::async_trait]
impl IdentityRotator for GluetunRotator {
    async fn rotate(&self) -> Result<(String, String), RotateError> {
        let old_ip = self.current_ip().await.unwrap_or_else(|_| "unknown".into());

        for attempt in 1..=self.max_attempts {
            info!("vpn rotation attempt {attempt}/{}", self.max_attempts);

            self.set_vpn_status("stopped").await?;
            tokio::time::sleep(Duration::from_secs(5)).await;

            self.set_vpn_status("running").await?;
            self.wait_for_vpn_ready(Duration::from_secs(60)).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;

            match self.current_ip().await {
                Ok(new_ip) if new_ip != old_ip => {
                    info!("vpn rotated: {old_ip} -> {new_ip}");
                    return Ok((old_ip, new_ip));
                }
                Ok(_) => warn!("vpn rotation attempt {attempt} produced the same IP"),
                Err(e) => warn!("vpn rotation attempt {attempt} could not confirm new IP: {e}"),
            }
        }

        Err(RotateError::NoNewIdentity)
    }
}

/// For deployments with no rotation tunnel: logs and reports the identity
/// unchanged, relying on a supervisor restart to get a new egress IP.
pub struct NoopRotator;

#[async_trait::async_trait]
impl IdentityRotator for NoopRotator {
    async fn rotate(&self) -> Result<(String, String), RotateError> {
        warn!("no identity rotator configured; identity will not change");
        Ok(("unchanged".into(), "unchanged".into()))
    }
}
