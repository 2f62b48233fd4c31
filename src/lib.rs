//! chunklift: a concurrent, resumable, chunked uploader for remote HTTP
//! storage. Large files are split into fixed-size parts uploaded in
//! parallel; parts the server already holds are skipped on resume, and
//! each file is committed as an ordered manifest of part identifiers.

pub mod config;
pub mod http;
pub mod logging;
pub mod pacer;
pub mod progress;
pub mod upload;
