pub mod cache;
pub mod files;
pub mod segments;
pub mod tasks;

use std::{fmt, path::Path};

use rusqlite::{types::FromSql, ToSql};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;

/// Content identity of a source file: sha256 over the full byte stream.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = sha2::Sha256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        crate::utils::to_hex(&self.0)
    }

    /// First hex byte, used as the fan-out directory in the content store.
    pub fn shard(&self) -> String {
        format!("{:02x}", self.0[0])
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}..)", &self.to_hex()[..8])
    }
}

impl FromSql for Digest {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        match value {
            rusqlite::types::ValueRef::Blob(blob) => blob
                .try_into()
                .map(Digest)
                .map_err(|_| rusqlite::types::FromSqlError::InvalidType),
            _ => Err(rusqlite::types::FromSqlError::InvalidType),
        }
    }
}

impl ToSql for Digest {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Borrowed(
            rusqlite::types::ValueRef::Blob(&self.0),
        ))
    }
}

/// Which embedding backbone and which vector collection a file belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Modality {
    Text,
    Image,
    Audio,
    Video,
}

impl Modality {
    pub const ALL: [Modality; 4] = [
        Modality::Text,
        Modality::Image,
        Modality::Audio,
        Modality::Video,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image => "image",
            Modality::Audio => "audio",
            Modality::Video => "video",
        }
    }

    /// Classifies a path by its extension; `None` means the file is not an
    /// indexable type and is ignored before any I/O happens.
    pub fn from_path(path: &Path) -> Option<Modality> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        let modality = match ext.as_str() {
            "jpg" | "jpeg" | "png" | "bmp" | "gif" | "webp" => Modality::Image,
            "mp4" | "avi" | "mov" | "wmv" | "flv" | "mkv" => Modality::Video,
            "mp3" | "wav" | "aac" | "ogg" | "flac" | "wma" => Modality::Audio,
            "txt" | "md" | "pdf" | "docx" | "xlsx" | "csv" => Modality::Text,
            _ => return None,
        };
        Some(modality)
    }
}

impl FromSql for Modality {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        match value {
            rusqlite::types::ValueRef::Integer(i) => match i {
                0 => Ok(Modality::Text),
                1 => Ok(Modality::Image),
                2 => Ok(Modality::Audio),
                3 => Ok(Modality::Video),
                _ => Err(rusqlite::types::FromSqlError::InvalidType),
            },
            _ => Err(rusqlite::types::FromSqlError::InvalidType),
        }
    }
}

impl ToSql for Modality {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Owned(
            rusqlite::types::Value::Integer(*self as i64),
        ))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub enum FileState {
    Pending,
    Processing,
    Indexed,
    Skipped,
    Failed,
}

impl FileState {
    pub fn name(&self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Processing => "processing",
            FileState::Indexed => "indexed",
            FileState::Skipped => "skipped",
            FileState::Failed => "failed",
        }
    }
}

impl FromSql for FileState {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        match value {
            rusqlite::types::ValueRef::Integer(i) => match i {
                0 => Ok(FileState::Pending),
                1 => Ok(FileState::Processing),
                2 => Ok(FileState::Indexed),
                3 => Ok(FileState::Skipped),
                4 => Ok(FileState::Failed),
                _ => Err(rusqlite::types::FromSqlError::InvalidType),
            },
            _ => Err(rusqlite::types::FromSqlError::InvalidType),
        }
    }
}

impl ToSql for FileState {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Owned(
            rusqlite::types::Value::Integer(*self as i64),
        ))
    }
}

/// Discriminates which segment table a vector binding points into.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum SegmentKind {
    Video = 1,
    Audio = 2,
}

impl FromSql for SegmentKind {
    fn column_result(value: rusqlite::types::ValueRef) -> rusqlite::types::FromSqlResult<Self> {
        match value {
            rusqlite::types::ValueRef::Integer(1) => Ok(SegmentKind::Video),
            rusqlite::types::ValueRef::Integer(2) => Ok(SegmentKind::Audio),
            _ => Err(rusqlite::types::FromSqlError::InvalidType),
        }
    }
}

impl ToSql for SegmentKind {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(rusqlite::types::ToSqlOutput::Owned(
            rusqlite::types::Value::Integer(*self as i64),
        ))
    }
}
