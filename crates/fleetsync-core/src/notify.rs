//! Archive notification collaborator

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::error::CoreError;

/// Delivers the archived transaction view to a caller-supplied callback
#[async_trait]
pub trait Notifier: Send + Sync {
    /// POST `body` to `url`
    async fn notify(&self, url: &str, body: &Value) -> Result<(), CoreError>;
}

/// Notifier that only logs; used when no callback transport is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, url: &str, body: &Value) -> Result<(), CoreError> {
        let transaction_id = body
            .get("transaction_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        info!(
            url,
            transaction_id,
            "archive notification skipped, no transport configured"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_log_notifier_accepts_any_body() {
        let notifier = LogNotifier;
        let body = json!({"transaction_id": "65a0c0ffee0000000000beef", "code": 3});
        assert!(notifier.notify("http://caller/done", &body).await.is_ok());
        assert!(notifier.notify("http://caller/done", &json!(null)).await.is_ok());
    }
}
