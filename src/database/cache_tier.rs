//! Persistent cache tier stored in MongoDB.
//!
//! One document per `(category, key)`; timestamps are stored as epoch
//! milliseconds so expiry can be range-queried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::Collection;
use mongodb::bson::{Binary, doc, spec::BinarySubtype};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Database;
use crate::cache::{CategoryId, PersistedRecord, PersistentTier, TierError};

const COLLECTION: &str = "cache_entries";

/// Stored form of a [`PersistedRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheDocument {
    /// `"{category}:{key}"`
    #[serde(rename = "_id")]
    pub id: String,

    pub category: CategoryId,
    pub key: String,
    pub payload: Binary,
    pub size_bytes: i64,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl CacheDocument {
    pub fn document_id(category: CategoryId, key: &str) -> String {
        format!("{}:{}", category, key)
    }

    pub fn from_record(record: &PersistedRecord) -> Self {
        Self {
            id: Self::document_id(record.category, &record.key),
            category: record.category,
            key: record.key.clone(),
            payload: Binary {
                subtype: BinarySubtype::Generic,
                bytes: record.payload.clone(),
            },
            size_bytes: i64::try_from(record.size_bytes).unwrap_or(i64::MAX),
            created_at_ms: record.created_at.timestamp_millis(),
            expires_at_ms: record.expires_at.timestamp_millis(),
        }
    }

    pub fn into_record(self) -> Result<PersistedRecord, TierError> {
        let created_at = from_millis(self.created_at_ms)?;
        let expires_at = from_millis(self.expires_at_ms)?;
        Ok(PersistedRecord {
            category: self.category,
            key: self.key,
            payload: self.payload.bytes,
            size_bytes: u64::try_from(self.size_bytes).unwrap_or(0),
            created_at,
            expires_at,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, TierError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| TierError::Codec(format!("timestamp out of range: {}", ms)))
}

/// [`PersistentTier`] backed by the `cache_entries` collection.
#[derive(Debug, Clone)]
pub struct MongoCacheTier {
    db: Database,
    collection: Collection<CacheDocument>,
}

impl MongoCacheTier {
    pub fn new(db: &Database) -> Self {
        Self {
            db: db.clone(),
            collection: db.collection(COLLECTION),
        }
    }
}

#[async_trait]
impl PersistentTier for MongoCacheTier {
    async fn ping(&self) -> Result<(), TierError> {
        self.db.ping().await?;
        Ok(())
    }

    async fn read(&self, category: CategoryId, key: &str) -> Result<Option<PersistedRecord>, TierError> {
        let filter = doc! { "_id": CacheDocument::document_id(category, key) };
        match self.collection.find_one(filter).await? {
            Some(document) => document.into_record().map(Some),
            None => Ok(None),
        }
    }

    async fn write(&self, record: &PersistedRecord) -> Result<(), TierError> {
        let document = CacheDocument::from_record(record);
        let filter = doc! { "_id": document.id.clone() };
        let options = mongodb::options::ReplaceOptions::builder()
            .upsert(true)
            .build();

        self.collection
            .replace_one(filter, &document)
            .with_options(options)
            .await?;

        debug!("Persisted {}/{}", record.category, record.key);
        Ok(())
    }

    async fn remove(&self, category: CategoryId, key: &str) -> Result<(), TierError> {
        let filter = doc! { "_id": CacheDocument::document_id(category, key) };
        self.collection.delete_one(filter).await?;
        Ok(())
    }

    async fn clear(&self, category: CategoryId) -> Result<u64, TierError> {
        let filter = doc! { "category": category.as_str() };
        let result = self.collection.delete_many(filter).await?;
        Ok(result.deleted_count)
    }

    async fn purge_expired(&self, category: CategoryId, now: DateTime<Utc>) -> Result<u64, TierError> {
        let filter = doc! {
            "category": category.as_str(),
            "expires_at_ms": { "$lte": now.timestamp_millis() },
        };
        let result = self.collection.delete_many(filter).await?;
        Ok(result.deleted_count)
    }
}
