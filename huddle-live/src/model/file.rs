use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{EntityRef, JsonMap, Record};
use crate::store::Table;

/// Coarse file category derived from the MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Image,
    Video,
    Audio,
    Document,
    Archive,
    Other,
}

impl FileType {
    pub fn from_mime(mime_type: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        let (top, sub) = mime.split_once('/').unwrap_or((mime.as_str(), ""));
        match top {
            "image" => FileType::Image,
            "video" => FileType::Video,
            "audio" => FileType::Audio,
            "text" => FileType::Document,
            "application" => match sub {
                "pdf" | "msword" | "rtf" | "json" => FileType::Document,
                s if s.starts_with("vnd.openxmlformats-officedocument")
                    || s.starts_with("vnd.ms-")
                    || s.starts_with("vnd.oasis.opendocument") =>
                {
                    FileType::Document
                }
                "zip" | "gzip" | "x-tar" | "x-7z-compressed" | "x-rar-compressed" => FileType::Archive,
                _ => FileType::Other,
            },
            _ => FileType::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Private,
    Shared,
    Public,
}

/// Metadata row for a file uploaded into a shared context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedFile {
    pub id: Uuid,
    pub file_name: String,
    pub file_url: String,
    pub file_type: FileType,
    pub file_size: u64,
    pub mime_type: String,
    pub uploaded_by: Uuid,
    #[serde(default)]
    pub related_entity: Option<EntityRef>,
    pub access_level: AccessLevel,
    #[serde(default)]
    pub permissions: JsonMap,
    #[serde(default)]
    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Record for SharedFile {
    const TABLE: Table = Table::SharedFiles;
}

impl SharedFile {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
