use serde::{Deserialize, Serialize};

/// Server acknowledgement for one uploaded part. `part_id` is the stored
/// identifier and is nonzero once the part is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PartFile {
    pub name: String,
    pub part_id: i64,
    pub part_no: i64,
    pub size: i64,
    pub channel_id: i64,
    pub encrypted: bool,
    pub salt: Option<String>,
}

/// Resumable-state envelope. The live API returns a bare array, the
/// legacy API wraps it in an object; both decode.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum UploadStateResponse {
    Wrapped {
        #[serde(default)]
        parts: Vec<PartFile>,
    },
    Bare(Vec<PartFile>),
}

impl UploadStateResponse {
    pub fn into_parts(self) -> Vec<PartFile> {
        match self {
            UploadStateResponse::Wrapped { parts } => parts,
            UploadStateResponse::Bare(parts) => parts,
        }
    }
}

/// Commit-manifest entry referencing a stored part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePart {
    pub id: i64,
    pub part_no: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
}

/// Commit manifest POSTed once every part is accounted for.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub parts: Vec<FilePart>,
    pub mime_type: String,
    pub path: String,
    pub size: i64,
    pub channel_id: i64,
    pub encrypted: bool,
}

/// One remote entry in a find/list response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileInfo {
    pub id: String,
    pub name: String,
    pub mime_type: Option<String>,
    pub size: i64,
    pub parent_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "updatedAt")]
    pub mod_time: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseMeta {
    pub count: i64,
}

/// Response to an `operation=find` probe.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FindResponse {
    pub items: Vec<FileInfo>,
    pub meta: ResponseMeta,
}

/// One page of the legacy directory listing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListResponse {
    pub items: Vec<FileInfo>,
    pub next_page_token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateDirRequest {
    pub path: String,
}

/// Authenticated session identity; `user_id` feeds the upload
/// fingerprint.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionInfo {
    pub user_id: i64,
    pub user_name: Option<String>,
}

/// Result of the offline directory pre-pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeSummary {
    pub total_files: usize,
    pub total_bytes: i64,
}

/// What happened to a single file job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// All parts committed and the resumable state retired.
    Uploaded,
    /// The file was already present remotely; nothing transferred.
    AlreadyExists,
    /// Dry run: fingerprint computed, transfer skipped.
    DryRun,
}
