//! Video-generation service contract.

use async_trait::async_trait;
use futures::future::join_all;

use super::{ApiError, GenerationParams, StatusReport};

/// Client of the external video-generation service.
#[async_trait]
pub trait VideoGenerationApi: Send + Sync {
    /// Submit a job and return its task id.
    async fn create_video(&self, params: &GenerationParams) -> Result<String, ApiError>;

    async fn query_status(&self, task_id: &str) -> Result<StatusReport, ApiError>;

    /// Query several tasks at once.
    ///
    /// The default issues one request per id concurrently. Services with a
    /// multi-id endpoint should override it.
    async fn query_status_batch(&self, task_ids: &[String]) -> Vec<(String, Result<StatusReport, ApiError>)> {
        let queries = task_ids.iter().map(|id| async move {
            let result = self.query_status(id).await;
            (id.clone(), result)
        });
        join_all(queries).await
    }
}
