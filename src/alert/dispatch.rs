//! Alert delivery
//!
//! `deliver` is fire-and-forget for the pipeline: a notifier never blocks
//! the event processor and never reports failures back to it.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::alert::types::{AlertMatch, AlertPayload};
use crate::error::{Error, Result};
use crate::types::short;

/// Notification channel for matched alerts
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, alert: AlertMatch);

    fn name(&self) -> &'static str;
}

/// Writes alerts to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, alert: AlertMatch) {
        let subscription = &alert.subscription;
        match &alert.payload {
            AlertPayload::Swap { event, kol } => info!(
                subscription = %subscription.id,
                user = %subscription.user_id,
                alert_type = %subscription.alert_type(),
                wallet = %short(&event.wallet),
                kol = kol.as_ref().map(|k| k.username.as_str()).unwrap_or("-"),
                mint = %short(&event.token_mint),
                side = ?event.side,
                amount_usd = event.amount_usd,
                "Swap alert"
            ),
            AlertPayload::Cluster { cluster } => info!(
                subscription = %subscription.id,
                user = %subscription.user_id,
                mint = %short(&cluster.token_mint),
                wallets = cluster.count,
                volume_usd = cluster.total_volume_usd,
                window_minutes = cluster.time_window_minutes,
                "Whale cluster alert"
            ),
        }
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Hands alerts to an in-process consumer without waiting
pub struct ChannelNotifier {
    tx: mpsc::Sender<AlertMatch>,
    dropped: AtomicU64,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<AlertMatch>) -> Self {
        Self {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a notifier along with its receiving end
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<AlertMatch>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx), rx)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn deliver(&self, alert: AlertMatch) {
        if let Err(e) = self.tx.try_send(alert) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "Alert channel unavailable, alert dropped");
        }
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// POSTs alerts as JSON to a webhook, retrying transient failures
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    max_elapsed: Duration,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build webhook client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            max_elapsed: Duration::from_secs(30),
        })
    }

    async fn post(client: &reqwest::Client, url: &str, alert: &AlertMatch) -> Result<()> {
        let response = client.post(url).json(alert).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.is_server_error() || status.as_u16() == 429 {
            Err(Error::Rpc(format!("webhook returned {}", status)))
        } else {
            Err(Error::Internal(format!("webhook rejected alert: {}", status)))
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, alert: AlertMatch) {
        let client = self.client.clone();
        let url = self.url.clone();
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(250),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        // Delivery runs detached so the processor moves on immediately
        tokio::spawn(async move {
            let alert = Arc::new(alert);
            let result = retry(backoff, || {
                let client = client.clone();
                let url = url.clone();
                let alert = alert.clone();
                async move {
                    match Self::post(&client, &url, &alert).await {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_retryable() => {
                            debug!(error = %e, "Retryable webhook error");
                            Err(backoff::Error::transient(e))
                        }
                        Err(e) => Err(backoff::Error::permanent(e)),
                    }
                }
            })
            .await;

            if let Err(e) = result {
                warn!(
                    subscription = %alert.subscription.id,
                    error = %e,
                    "Webhook delivery failed"
                );
            }
        });
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
