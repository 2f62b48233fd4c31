mod engine;
mod error;
mod types;

pub use engine::{fetch_session, fingerprint, EngineConfig, UploadEngine};
pub use error::{Result, UploadError};
pub use types::{
    CreateDirRequest, FileInfo, FilePart, FilePayload, FindResponse, ListResponse, PartFile,
    ResponseMeta, SessionInfo, TreeSummary, UploadOutcome, UploadStateResponse,
};
