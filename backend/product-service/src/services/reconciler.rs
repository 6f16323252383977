//! Reconciler - records a finished derivative on its product
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::ProductStore;
use crate::error::Result;
use crate::models::{AppendOutcome, TaskKey};

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn ProductStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ProductStore>) -> Self {
        Self { store }
    }

    /// Merge `task_key -> url` into the product's compressed set.
    ///
    /// Repeating the call for the same task key changes nothing and reports
    /// `AlreadyPresent`. A missing product is returned as `NotFound`.
    pub async fn reconcile(
        &self,
        product_id: i64,
        task_key: &TaskKey,
        url: &str,
    ) -> Result<AppendOutcome> {
        let outcome = self
            .store
            .append_compressed_image(product_id, task_key, url)
            .await?;

        match outcome {
            AppendOutcome::Added => {
                info!(product_id, task_key = %task_key, url = %url, "Compressed image recorded")
            }
            AppendOutcome::AlreadyPresent => {
                debug!(product_id, task_key = %task_key, "Compressed image already recorded")
            }
        }

        Ok(outcome)
    }
}
