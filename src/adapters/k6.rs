//! k6 load generator: a child process steered through k6's REST API
//!
//! Rate changes scale the VU count with `PATCH /v1/status`; stopping first
//! asks k6 to stop through the same endpoint and kills the process if it
//! does not exit within the configured timeout.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use reqwest::Client;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::LoadGenerator;
use crate::config::LoadGeneratorConfig;
use crate::{Error, Result};

/// Attempts for each control request
const CONTROL_ATTEMPTS: usize = 3;

/// Drives a `k6 run` child process
pub struct K6LoadGenerator {
    config: LoadGeneratorConfig,
    client: Client,
    child: Mutex<Option<Child>>,
}

impl K6LoadGenerator {
    /// Create a generator; nothing is spawned until [`start`](LoadGenerator::start)
    pub fn new(config: LoadGeneratorConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.control_timeout).build()?;
        Ok(Self {
            config,
            client,
            child: Mutex::new(None),
        })
    }

    /// Arguments passed to the k6 binary
    #[must_use]
    pub fn run_args(&self, test_id: &str, duration: Duration) -> Vec<String> {
        let vus = self.config.vus.to_string();
        let mut args = vec![
            "run".to_string(),
            "--address".to_string(),
            self.config.api_address.clone(),
            "--tag".to_string(),
            format!("test_id={test_id}"),
            "--vus".to_string(),
            vus.clone(),
            "--max-vus".to_string(),
            vus,
            "--duration".to_string(),
            format!("{}s", duration.as_secs().max(1)),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args.push(self.config.script.clone());
        args
    }

    fn status_url(&self) -> String {
        format!("http://{}/v1/status", self.config.api_address)
    }

    /// Body for a status patch
    #[must_use]
    pub fn status_patch(attributes: Value) -> Value {
        json!({
            "data": {
                "type": "status",
                "id": "default",
                "attributes": attributes,
            }
        })
    }

    async fn patch_status(&self, attributes: Value) -> Result<()> {
        let body = &Self::status_patch(attributes);
        let url = &self.status_url();
        let client = &self.client;
        let send = move || async move {
            let response = client
                .patch(url.as_str())
                .json(body)
                .send()
                .await
                .map_err(|e| Error::LoadGenerator(format!("k6 API unreachable: {e}")))?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(Error::LoadGenerator(format!(
                    "k6 API rejected status patch: HTTP {}",
                    response.status()
                )))
            }
        };

        send.retry(
            ExponentialBuilder::default()
                .with_min_delay(Duration::from_millis(200))
                .with_max_times(CONTROL_ATTEMPTS),
        )
        .notify(|err: &Error, delay: Duration| {
            debug!(error = %err, delay_ms = delay.as_millis(), "Retrying k6 control request");
        })
        .await
    }

    async fn set_vus(&self, vus: u32) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::LoadGenerator("k6 is not running".to_string()));
        }
        self.patch_status(json!({ "vus": vus })).await?;
        info!(vus, "k6 VU count changed");
        Ok(())
    }
}

#[async_trait]
impl LoadGenerator for K6LoadGenerator {
    async fn start(&self, test_id: &str, duration: Duration) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(Error::LoadGenerator("k6 already started".to_string()));
        }

        let child = Command::new(&self.config.command)
            .args(self.run_args(test_id, duration))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::LoadGenerator(format!("failed to spawn {}: {e}", self.config.command))
            })?;

        info!(pid = ?child.id(), script = %self.config.script, vus = self.config.vus, "Started k6");
        *slot = Some(child);
        Ok(())
    }

    async fn reduce_rate(&self) -> Result<()> {
        self.set_vus(self.config.reduced_vus).await
    }

    async fn resume_rate(&self) -> Result<()> {
        self.set_vus(self.config.vus).await
    }

    async fn is_running(&self) -> bool {
        let mut slot = self.child.lock().await;
        match slot.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!(%status, "k6 has exited");
                false
            }
            Some(Err(e)) => {
                warn!(error = %e, "Could not poll k6 process");
                false
            }
            None => false,
        }
    }

    async fn stop(&self) -> Result<()> {
        if self.is_running().await {
            if let Err(e) = self.patch_status(json!({ "stopped": true })).await {
                warn!(error = %e, "Graceful k6 stop failed; killing");
            }
        }

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(self.config.stop_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "k6 stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(Error::LoadGenerator(format!("failed to wait for k6: {e}"))),
            Err(_) => {
                warn!(timeout = ?self.config.stop_timeout, "k6 did not stop in time; killing");
                child
                    .kill()
                    .await
                    .map_err(|e| Error::LoadGenerator(format!("failed to kill k6: {e}")))
            }
        }
    }
}
