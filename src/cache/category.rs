//! Cache categories and their payload types.
//!
//! Each category is a marker type tying a [`CategoryId`] to the payload it
//! stores, so `cache.get::<Images>(key)` can only ever yield an image.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::CacheError;

/// Identifier of a cache partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CategoryId {
    Image,
    Template,
    Video,
    UserData,
}

impl CategoryId {
    pub const ALL: [CategoryId; 4] = [Self::Image, Self::Template, Self::Video, Self::UserData];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Template => "template",
            Self::Video => "video",
            Self::UserData => "user-data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == s)
    }
}

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value that can be stored in the persistent and fallback tiers.
pub trait CachePayload: Clone + Send + Sync + 'static {
    fn encode(&self) -> Result<Vec<u8>, CacheError>;
    fn decode(bytes: &[u8]) -> Result<Self, CacheError>;
}

/// Binding between a category id and its payload type.
pub trait CacheCategory: Send + Sync + 'static {
    const ID: CategoryId;
    type Payload: CachePayload;
}

/// Binary asset with its MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Blob {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// Layout: content type, a NUL separator, then the raw bytes.
impl CachePayload for Blob {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        if self.content_type.as_bytes().contains(&0) {
            return Err(CacheError::Codec(
                "content type contains a NUL byte".to_string(),
            ));
        }
        let mut out = Vec::with_capacity(self.content_type.len() + 1 + self.bytes.len());
        out.extend_from_slice(self.content_type.as_bytes());
        out.push(0);
        out.extend_from_slice(&self.bytes);
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let split = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| CacheError::Codec("blob is missing its content type".to_string()))?;
        let content_type = std::str::from_utf8(&bytes[..split])
            .map_err(|e| CacheError::Codec(e.to_string()))?
            .to_string();
        Ok(Self {
            content_type,
            bytes: bytes[split + 1..].to_vec(),
        })
    }
}

impl CachePayload for serde_json::Value {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        serde_json::to_vec(self).map_err(|e| CacheError::Codec(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        serde_json::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

impl CachePayload for String {
    fn encode(&self) -> Result<Vec<u8>, CacheError> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::Codec(e.to_string()))
    }
}

/// Thumbnails, cover art, previews.
pub struct Images;

impl CacheCategory for Images {
    const ID: CategoryId = CategoryId::Image;
    type Payload = Blob;
}

/// Template metadata as returned by the catalogue API.
pub struct Templates;

impl CacheCategory for Templates {
    const ID: CategoryId = CategoryId::Template;
    type Payload = serde_json::Value;
}

/// Generated video files.
pub struct Videos;

impl CacheCategory for Videos {
    const ID: CategoryId = CategoryId::Video;
    type Payload = Blob;
}

/// Signed-in user's profile and history.
pub struct UserData;

impl CacheCategory for UserData {
    const ID: CategoryId = CategoryId::UserData;
    type Payload = serde_json::Value;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_id_round_trips_through_str() {
        for id in CategoryId::ALL {
            assert_eq!(CategoryId::parse(id.as_str()), Some(id));
        }
        assert_eq!(CategoryId::parse("audio"), None);
    }

    #[test]
    fn test_blob_codec_keeps_content_type() {
        let blob = Blob::new("image/webp", vec![0, 1, 2, 0, 3]);
        let decoded = Blob::decode(&blob.encode().unwrap()).unwrap();
        assert_eq!(decoded, blob);
    }

    #[test]
    fn test_blob_decode_rejects_garbage() {
        assert!(Blob::decode(b"no separator here").is_err());
    }

    #[test]
    fn test_category_id_serializes_kebab_case() {
        let json = serde_json::to_string(&CategoryId::UserData).unwrap();
        assert_eq!(json, "\"user-data\"");
    }
}
