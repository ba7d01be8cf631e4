// =============================================================================
// Notification sink — fire-and-forget operator notifications
// =============================================================================
//
// Notifications never affect trading decisions: sends are spawned onto the
// runtime and failures are logged and dropped. The webhook sink posts JSON to
// the URL in `NOTIFY_WEBHOOK_URL`; without one configured the engine falls
// back to log-only.
// =============================================================================

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::execution::ExecutionReport;
use crate::strategy::TradingSignal;

/// Operator-facing notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_warning(&self, market: &str, message: &str);
    async fn send_error(&self, market: &str, message: &str);
    async fn send_trade(&self, signal: &TradingSignal, report: &ExecutionReport);
    async fn send_system(&self, title: &str, body: &str);
}

// ---------------------------------------------------------------------------
// Webhook sink
// ---------------------------------------------------------------------------

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn from_env() -> Self {
        let url = std::env::var("NOTIFY_WEBHOOK_URL").ok().filter(|u| !u.is_empty());
        if url.is_none() {
            info!("NOTIFY_WEBHOOK_URL not set — notifications are log-only");
        }
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("failed to build notifier client"),
            url,
        }
    }

    fn post(&self, payload: serde_json::Value) {
        let Some(url) = self.url.clone() else {
            return;
        };
        let client = self.client.clone();
        // Fire-and-forget: the caller never waits on delivery.
        tokio::spawn(async move {
            if let Err(e) = client.post(&url).json(&payload).send().await {
                warn!(error = %e, "notification delivery failed");
            }
        });
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_warning(&self, market: &str, message: &str) {
        warn!(market, message, "operator warning");
        self.post(json!({ "level": "warning", "market": market, "message": message }));
    }

    async fn send_error(&self, market: &str, message: &str) {
        warn!(market, message, "operator error");
        self.post(json!({ "level": "error", "market": market, "message": message }));
    }

    async fn send_trade(&self, signal: &TradingSignal, report: &ExecutionReport) {
        info!(
            market = %signal.market,
            action = %signal.action,
            strategy = %signal.strategy,
            success = report.success,
            "trade notification"
        );
        self.post(json!({
            "level": "trade",
            "market": signal.market,
            "action": signal.action.to_string(),
            "strategy": signal.strategy.to_string(),
            "confidence": signal.confidence,
            "success": report.success,
            "price": report.price.map(|p| p.to_string()),
            "executed_quantity": report.executed_quantity.to_string(),
            "fill_rate_percent": report.fill_rate_percent,
            "message": report.message,
        }));
    }

    async fn send_system(&self, title: &str, body: &str) {
        info!(title, body, "system notification");
        self.post(json!({ "level": "system", "title": title, "body": body }));
    }
}

// ---------------------------------------------------------------------------
// Log-only sink for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testkit {
    use super::*;
    use parking_lot::Mutex;

    /// Records every notification for assertion.
    #[derive(Default)]
    pub struct RecordingNotifier {
        pub warnings: Mutex<Vec<(String, String)>>,
        pub errors: Mutex<Vec<(String, String)>>,
        pub systems: Mutex<Vec<(String, String)>>,
        pub trades: Mutex<usize>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_warning(&self, market: &str, message: &str) {
            self.warnings.lock().push((market.into(), message.into()));
        }

        async fn send_error(&self, market: &str, message: &str) {
            self.errors.lock().push((market.into(), message.into()));
        }

        async fn send_trade(&self, _signal: &TradingSignal, _report: &ExecutionReport) {
            *self.trades.lock() += 1;
        }

        async fn send_system(&self, title: &str, body: &str) {
            self.systems.lock().push((title.into(), body.into()));
        }
    }
}
