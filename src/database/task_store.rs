//! Task records stored in MongoDB, used to recover jobs after a reload.

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::Collection;
use mongodb::bson::doc;
use tracing::debug;

use super::Database;
use crate::tasks::{Task, TaskError, TaskStatus, TaskStore};

const COLLECTION: &str = "video_tasks";

/// [`TaskStore`] backed by the `video_tasks` collection, one document per task id.
#[derive(Debug, Clone)]
pub struct MongoTaskStore {
    collection: Collection<Task>,
}

impl MongoTaskStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection(COLLECTION),
        }
    }
}

#[async_trait]
impl TaskStore for MongoTaskStore {
    async fn load_active(&self, user_id: &str) -> Result<Vec<Task>, TaskError> {
        let filter = doc! {
            "user_id": user_id,
            "status": { "$in": [TaskStatus::Pending.as_str(), TaskStatus::Processing.as_str()] },
        };
        let cursor = self.collection.find(filter).await?;
        let tasks: Vec<Task> = cursor.try_collect().await?;

        debug!("Loaded {} stored tasks for {}", tasks.len(), user_id);
        Ok(tasks)
    }

    async fn save(&self, task: &Task) -> Result<(), TaskError> {
        let filter = doc! { "id": task.id.as_str() };
        let options = mongodb::options::ReplaceOptions::builder()
            .upsert(true)
            .build();

        self.collection
            .replace_one(filter, task)
            .with_options(options)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), TaskError> {
        self.collection.delete_one(doc! { "id": id }).await?;
        Ok(())
    }
}
