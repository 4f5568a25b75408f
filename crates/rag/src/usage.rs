use serde_json::Value;
use tokio::task;

use crate::store::PaperStore;

/// Fire-and-forget usage telemetry. Records are appended from a spawned
/// task; failures are logged and swallowed so a broken sink can never block
/// or fail a user-visible response.
#[derive(Clone)]
pub struct UsageLogger {
    store: PaperStore,
}

impl UsageLogger {
    pub fn new(store: PaperStore) -> Self {
        Self { store }
    }

    pub fn record(&self, question: &str, paper_id: Option<&str>, metadata: Value) {
        let store = self.store.clone();
        let question = question.to_string();
        let paper_id = paper_id.map(|id| id.to_string());
        tokio::spawn(async move {
            let outcome = task::spawn_blocking(move || {
                store.log_usage(&question, paper_id.as_deref(), Some(&metadata))
            })
            .await;
            match outcome {
                Ok(Err(err)) => tracing::warn!(error = %err, "usage log write failed"),
                Err(err) => tracing::warn!(error = %err, "usage log task failed"),
                Ok(Ok(())) => {}
            }
        });
    }
}
