//! Object metadata
//!
//! Every stored object carries a [`Metadata`] record. Upload and metadata
//! update operations take a [`MetadataUpdate`] holding only the writable
//! fields; everything else is maintained by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Metadata of a stored object
///
/// Returned by uploads, [`get_metadata`] and [`update_metadata`]. The
/// `generation` counter advances with every overwrite of the object data,
/// `metageneration` with every metadata change of the current generation.
///
/// [`get_metadata`]: crate::storage::StorageReference::get_metadata
/// [`update_metadata`]: crate::storage::StorageReference::update_metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Bucket this object lives in
    pub bucket: String,

    /// Full path of the object within the bucket
    pub path: String,

    /// Short name of the object (the last path segment)
    pub name: String,

    /// Object size in bytes
    pub size_bytes: u64,

    /// MIME content type, if one was set
    pub content_type: Option<String>,

    /// Cache-Control directive served with the object
    pub cache_control: Option<String>,

    /// Content-Encoding of the object data
    pub content_encoding: Option<String>,

    /// Content-Language of the object data
    pub content_language: Option<String>,

    /// When this generation of the object was created
    pub creation_time: DateTime<Utc>,

    /// When the object data or metadata last changed
    pub updated_time: DateTime<Utc>,

    /// Application-defined key/value pairs
    pub custom_metadata: HashMap<String, String>,

    /// Data generation, bumped on every overwrite
    pub generation: i64,

    /// Metadata generation, bumped on every metadata update
    pub metageneration: i64,

    /// Opaque token for building download URLs
    pub download_token: String,
}

/// Writable metadata fields
///
/// `None` fields are left unchanged. Passed to
/// [`put_bytes_with`](crate::storage::StorageReference::put_bytes_with) and
/// [`update_metadata`](crate::storage::StorageReference::update_metadata).
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    /// New MIME content type
    pub content_type: Option<String>,

    /// New Cache-Control directive
    pub cache_control: Option<String>,

    /// New Content-Encoding
    pub content_encoding: Option<String>,

    /// New Content-Language
    pub content_language: Option<String>,

    /// Replacement for the application-defined key/value pairs
    pub custom_metadata: Option<HashMap<String, String>>,
}

impl MetadataUpdate {
    /// Set the MIME content type
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the Cache-Control directive
    pub fn cache_control(mut self, cache_control: impl Into<String>) -> Self {
        self.cache_control = Some(cache_control.into());
        self
    }

    /// Set the Content-Encoding
    pub fn content_encoding(mut self, content_encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(content_encoding.into());
        self
    }

    /// Set the Content-Language
    pub fn content_language(mut self, content_language: impl Into<String>) -> Self {
        self.content_language = Some(content_language.into());
        self
    }

    /// Replace the application-defined key/value pairs
    pub fn custom_metadata(mut self, custom_metadata: HashMap<String, String>) -> Self {
        self.custom_metadata = Some(custom_metadata);
        self
    }
}
