//! The upload engine: fingerprinting, part scheduling, resumption,
//! commit, and the directory walk.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use md5::{Digest, Md5};
use reqwest::StatusCode;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::io::ReaderStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::http::ApiClient;
use crate::pacer::Pacer;
use crate::progress::{Aggregator, Bar, ProgressReader};

use super::error::{Result, UploadError};
use super::types::{
    CreateDirRequest, FileInfo, FilePart, FilePayload, FindResponse, ListResponse, PartFile,
    SessionInfo, TreeSummary, UploadOutcome, UploadStateResponse,
};

const LIST_PAGE_SIZE: u64 = 500;
const MIME_PREFIX_LEN: usize = 512;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub part_size: i64,
    /// Parts in flight per file.
    pub workers: usize,
    /// Files in flight globally.
    pub transfers: usize,
    pub channel_id: i64,
    pub encrypt_files: bool,
    pub randomise_part: bool,
    pub delete_after_upload: bool,
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            part_size: 1000 * (1 << 20),
            workers: 4,
            transfers: 4,
            channel_id: 0,
            encrypt_files: false,
            randomise_part: true,
            delete_after_upload: false,
            dry_run: false,
        }
    }
}

/// Resumable-upload key: stable across retries and process restarts for
/// the same destination, name, size and user.
pub fn fingerprint(directory_id: &str, file_name: &str, size: i64, user_id: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(format!("{directory_id}:{file_name}:{size}:{user_id}"));
    hex::encode(hasher.finalize())
}

/// Resolve the authenticated session once at startup; its user id feeds
/// every fingerprint.
pub async fn fetch_session(api: &ApiClient, pacer: &Pacer) -> Result<SessionInfo> {
    pacer
        .call(|| async move {
            let (status, body) = api.get_json::<SessionInfo>("/api/auth/session", &[]).await?;
            match body {
                Some(info) if status.is_success() => Ok(info),
                _ => Err(UploadError::api(status, "/api/auth/session")),
            }
        })
        .await
}

fn detect_mime(prefix: &[u8]) -> String {
    infer::get(prefix)
        .map(|t| t.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

fn total_parts(size: i64, part_size: i64) -> i64 {
    if size <= 0 {
        return 0;
    }
    (size + part_size - 1) / part_size
}

fn part_name(randomise: bool, file_name: &str, parts: i64, ordinal: i64) -> String {
    if randomise {
        uuid::Uuid::new_v4().simple().to_string()
    } else if parts > 1 {
        format!("{file_name}.part.{ordinal:03}")
    } else {
        file_name.to_string()
    }
}

pub struct UploadEngine {
    api: Arc<ApiClient>,
    pacer: Arc<Pacer>,
    progress: Arc<Aggregator>,
    config: EngineConfig,
    transfer_slots: Arc<Semaphore>,
    tracker: TaskTracker,
    user_id: i64,
}

impl UploadEngine {
    pub fn new(
        api: Arc<ApiClient>,
        pacer: Arc<Pacer>,
        progress: Arc<Aggregator>,
        config: EngineConfig,
        user_id: i64,
    ) -> Self {
        let transfer_slots = Arc::new(Semaphore::new(config.transfers.max(1)));
        Self {
            api,
            pacer,
            progress,
            config,
            transfer_slots,
            tracker: TaskTracker::new(),
            user_id,
        }
    }

    pub fn part_size(&self) -> i64 {
        self.config.part_size
    }

    /// Wait for every dispatched file task to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn find(&self, path: &str, name: &str, folder: bool) -> Result<(u16, Vec<FileInfo>)> {
        let mut query: Vec<(&str, String)> = vec![
            ("path", path.to_string()),
            ("operation", "find".to_string()),
            ("name", name.to_string()),
        ];
        if folder {
            query.push(("type", "folder".to_string()));
        }

        self.pacer
            .call(|| {
                let query = query.clone();
                async move {
                    let (status, body) =
                        self.api.get_json::<FindResponse>("/api/files", &query).await?;
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        let items = body.map(|b| b.items).unwrap_or_default();
                        Ok((status.as_u16(), items))
                    } else {
                        Err(UploadError::api(status, "/api/files"))
                    }
                }
            })
            .await
    }

    /// Probe whether `name` is already present under `path`.
    pub async fn check_file_exists(&self, name: &str, path: &str) -> Result<bool> {
        let (status, items) = self.find(path, name, false).await?;
        Ok(status != 404 && !items.is_empty())
    }

    /// Resolve the server-side identifier of a remote directory. In dry
    /// run a missing parent resolves to the synthetic id `"0"` so the
    /// fingerprint can still be computed.
    pub async fn resolve_dir_id(&self, path: &str) -> Result<String> {
        let normalised = {
            let p = path.trim_end_matches('/');
            if p.starts_with('/') {
                p.to_string()
            } else {
                format!("/{p}")
            }
        };

        let (parent, leaf) = match normalised.rfind('/') {
            Some(0) => ("/".to_string(), normalised[1..].to_string()),
            Some(idx) => (normalised[..idx].to_string(), normalised[idx + 1..].to_string()),
            None => ("/".to_string(), normalised.clone()),
        };

        let (status, items) = self.find(&parent, &leaf, true).await?;
        if status == 404 || items.is_empty() {
            if self.config.dry_run {
                debug!("directory {normalised} not found, substituting synthetic id");
                return Ok("0".to_string());
            }
            return Err(UploadError::DirNotFound(normalised));
        }
        Ok(items[0].id.clone())
    }

    /// Fetch the parts the server already holds for a fingerprint. Any
    /// failure means "no prior state" and the upload starts from scratch.
    async fn fetch_upload_state(&self, upload_path: &str) -> Vec<PartFile> {
        let result: Result<Vec<PartFile>> = self
            .pacer
            .call(|| {
                let path = upload_path.to_string();
                async move {
                    let (status, body) =
                        self.api.get_json::<UploadStateResponse>(&path, &[]).await?;
                    if status == StatusCode::NOT_FOUND {
                        return Ok(Vec::new());
                    }
                    if !status.is_success() {
                        return Err(UploadError::api(status, path));
                    }
                    Ok(body.map(|b| b.into_parts()).unwrap_or_default())
                }
            })
            .await;

        match result {
            Ok(parts) => parts,
            Err(e) => {
                debug!("resumable state probe failed, starting fresh: {e}");
                Vec::new()
            }
        }
    }

    /// Upload one file into the remote directory `dest_dir` (already
    /// resolved to `dir_id`): probe, fingerprint, schedule parts through
    /// the worker semaphore, commit, retire the resumable state.
    pub async fn upload_file(
        &self,
        file_path: &Path,
        dest_dir: &str,
        dir_id: &str,
    ) -> Result<UploadOutcome> {
        let file_name = file_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
            })?;

        let mut file = tokio::fs::File::open(file_path).await?;
        let size = file.metadata().await?.len() as i64;

        let mut prefix = vec![0u8; MIME_PREFIX_LEN];
        let n = file.read(&mut prefix).await?;
        prefix.truncate(n);
        drop(file);
        let mime_type = detect_mime(&prefix);

        if self.check_file_exists(&file_name, dest_dir).await? {
            info!("file exists: {file_name}");
            self.progress.add_existing(size);
            return Ok(UploadOutcome::AlreadyExists);
        }

        let fp = fingerprint(dir_id, &file_name, size, self.user_id);
        let upload_path = format!("/api/uploads/{fp}");

        if self.config.dry_run {
            info!("dry run: would upload {file_name} ({size} bytes) as {fp}");
            return Ok(UploadOutcome::DryRun);
        }

        let recorded = self.fetch_upload_state(&upload_path).await;

        // a resumed upload must stay consistent with its first parts
        let mut channel_id = self.config.channel_id;
        let mut encrypted = self.config.encrypt_files;
        if let Some(first) = recorded.first() {
            channel_id = first.channel_id;
            encrypted = first.encrypted;
        }
        let existing: HashMap<i64, PartFile> =
            recorded.into_iter().map(|p| (p.part_no, p)).collect();

        let parts_total = total_parts(size, self.config.part_size);

        let bar = Arc::new(Bar::new(size, &file_name));
        self.progress.add_bar(bar.clone());

        let workers = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let (tx, mut rx) = mpsc::channel::<PartFile>(parts_total.max(1) as usize);

        let mut handles = Vec::with_capacity(parts_total as usize);
        for ordinal in 1..=parts_total {
            let start = (ordinal - 1) * self.config.part_size;
            let length = self.config.part_size.min(size - start);
            let name = part_name(self.config.randomise_part, &file_name, parts_total, ordinal);
            let existing_part = existing.get(&ordinal).cloned();

            let api = self.api.clone();
            let pacer = self.pacer.clone();
            let workers = workers.clone();
            let bar = bar.clone();
            let tx = tx.clone();
            let file_path = file_path.to_path_buf();
            let upload_path = upload_path.clone();
            let file_name = file_name.clone();

            handles.push(tokio::spawn(async move {
                let _permit = match workers.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                if let Some(part) = existing_part {
                    bar.inc(part.size);
                    let _ = tx.send(part).await;
                    return;
                }

                let query: Vec<(&str, String)> = vec![
                    ("partName", name),
                    ("fileName", file_name.clone()),
                    ("partNo", ordinal.to_string()),
                    ("channelId", channel_id.to_string()),
                    ("encrypted", encrypted.to_string()),
                ];

                let result = pacer
                    .call(|| {
                        let api = api.clone();
                        let bar = bar.clone();
                        let query = query.clone();
                        let upload_path = upload_path.clone();
                        let file_path = file_path.clone();
                        async move {
                            upload_part_once(
                                &api,
                                &bar,
                                &file_path,
                                &upload_path,
                                &query,
                                ordinal,
                                start,
                                length,
                            )
                            .await
                        }
                    })
                    .await;

                match result {
                    Ok(part) => {
                        let _ = tx.send(part).await;
                    }
                    Err(e) => error!("part {ordinal} of {file_name} failed: {e}"),
                }
            }));
        }
        drop(tx);

        // barrier: the channel closes once every part task has exited
        let barrier = tokio::spawn(async move {
            for handle in handles {
                let _ = handle.await;
            }
        });

        let mut parts: Vec<FilePart> = Vec::new();
        while let Some(part) = rx.recv().await {
            if part.part_id != 0 && part.size != 0 {
                parts.push(FilePart {
                    id: part.part_id,
                    part_no: part.part_no,
                    salt: part.salt,
                });
            }
        }
        let _ = barrier.await;

        if parts.len() as i64 != parts_total {
            bar.abort();
            return Err(UploadError::IncompleteParts(file_name));
        }

        parts.sort_by_key(|p| p.part_no);

        let payload = FilePayload {
            name: file_name.clone(),
            kind: "file".to_string(),
            parts,
            mime_type,
            path: dest_dir.to_string(),
            size,
            channel_id,
            encrypted,
        };

        let commit = self
            .pacer
            .call(|| {
                let payload = payload.clone();
                async move {
                    let status = self.api.post_json("/api/files", &payload).await?;
                    if status.is_success() {
                        Ok(())
                    } else {
                        Err(UploadError::api(status, "/api/files"))
                    }
                }
            })
            .await;
        if let Err(e) = commit {
            // leave the resumable state so a later run resumes
            bar.abort();
            return Err(e);
        }

        let retire = self
            .pacer
            .call(|| {
                let path = upload_path.clone();
                async move {
                    let status = self.api.delete(&path).await?;
                    if status.is_success() || status == StatusCode::NOT_FOUND {
                        Ok(())
                    } else {
                        Err(UploadError::api(status, path))
                    }
                }
            })
            .await;
        if let Err(e) = retire {
            bar.abort();
            return Err(e);
        }

        bar.close();
        info!("uploaded: {file_name}");
        Ok(UploadOutcome::Uploaded)
    }

    /// Create a remote directory (no-op in dry run).
    pub async fn create_remote_dir(&self, path: &str) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }

        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        let request = CreateDirRequest { path };

        self.pacer
            .call(|| {
                let request = request.clone();
                async move {
                    let status = self.api.post_json("/api/files/mkdir", &request).await?;
                    if status.is_success() {
                        Ok(())
                    } else {
                        Err(UploadError::api(status, "/api/files/mkdir"))
                    }
                }
            })
            .await
    }

    async fn read_metadata_page(&self, path: &str, page_token: &str) -> Result<ListResponse> {
        let query: Vec<(&str, String)> = vec![
            ("path", path.to_string()),
            ("perPage", LIST_PAGE_SIZE.to_string()),
            ("sort", "name".to_string()),
            ("order", "asc".to_string()),
            ("op", "list".to_string()),
            ("nextPageToken", page_token.to_string()),
        ];

        self.pacer
            .call(|| {
                let query = query.clone();
                async move {
                    let (status, body) =
                        self.api.get_json::<ListResponse>("/api/files", &query).await?;
                    if status == StatusCode::NOT_FOUND {
                        return Err(UploadError::DirNotFound(query[0].1.clone()));
                    }
                    if !status.is_success() {
                        return Err(UploadError::api(status, "/api/files"));
                    }
                    Ok(body.unwrap_or_default())
                }
            })
            .await
    }

    /// List a remote directory, following pagination to the end.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let mut files = Vec::new();
        let mut page_token = String::new();
        loop {
            let page = self.read_metadata_page(path, &page_token).await?;
            files.extend(page.items);
            page_token = page.next_page_token;
            if page_token.is_empty() {
                break;
            }
        }
        Ok(files)
    }

    /// Mirror a local tree onto the remote side, uploading files through
    /// the transfer semaphore. Subtree failures are logged and skipped;
    /// only failing to open `source` itself is fatal.
    pub async fn upload_directory(self: &Arc<Self>, source: &Path, dest_dir: &str) -> Result<()> {
        self.clone()
            .walk(source.to_path_buf(), dest_dir.replace('\\', "/"))
            .await
    }

    fn walk(self: Arc<Self>, source: PathBuf, dest_dir: String) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(&source).await?;

            let remote = match self.list_dir(&dest_dir).await {
                Ok(files) => files,
                Err(e) => {
                    debug!("listing {dest_dir} failed, assuming empty: {e}");
                    Vec::new()
                }
            };

            let dir_id = match self.resolve_dir_id(&dest_dir).await {
                Ok(id) => id,
                Err(e) => {
                    error!("cannot resolve remote directory {dest_dir}: {e}");
                    return Ok(());
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let full_path = entry.path();

                let is_dir = match entry.file_type().await {
                    Ok(t) => t.is_dir(),
                    Err(e) => {
                        error!("cannot stat {}: {e}", full_path.display());
                        continue;
                    }
                };

                if is_dir {
                    let sub_dir =
                        format!("{}/{}", dest_dir.trim_end_matches('/'), name).replace('\\', "/");
                    if let Err(e) = self.create_remote_dir(&sub_dir).await {
                        error!("mkdir {sub_dir} failed: {e}");
                        continue;
                    }
                    if let Err(e) = self.clone().walk(full_path, sub_dir.clone()).await {
                        error!("walking {sub_dir} failed: {e}");
                    }
                    continue;
                }

                if remote.iter().any(|f| f.name == name) {
                    info!("file exists: {name}");
                    let size = entry.metadata().await.map(|m| m.len() as i64).unwrap_or(0);
                    self.progress.add_existing(size);
                    continue;
                }

                let permit = match self.transfer_slots.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let engine = self.clone();
                let dir_id = dir_id.clone();
                let dest_dir = dest_dir.clone();
                self.tracker.spawn(async move {
                    let _permit = permit;
                    match engine.upload_file(&full_path, &dest_dir, &dir_id).await {
                        Ok(UploadOutcome::Uploaded) | Ok(UploadOutcome::AlreadyExists) => {
                            if engine.config.delete_after_upload {
                                if let Err(e) = tokio::fs::remove_file(&full_path).await {
                                    error!("deleting {} failed: {e}", full_path.display());
                                }
                            }
                        }
                        Ok(UploadOutcome::DryRun) => {}
                        Err(e) => error!("upload failed: {e}"),
                    }
                });
            }

            Ok(())
        })
    }

    /// Offline pre-pass over `path`: file and byte totals for the
    /// aggregator, no network traffic.
    pub async fn summarise(&self, path: &Path) -> Result<TreeSummary> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_dir() {
            return Ok(TreeSummary {
                total_files: 1,
                total_bytes: meta.len() as i64,
            });
        }

        let mut summary = TreeSummary::default();
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    stack.push(entry.path());
                } else {
                    summary.total_files += 1;
                    summary.total_bytes += meta.len() as i64;
                }
            }
        }
        Ok(summary)
    }
}

/// One attempt at streaming a part. Progress reported during a failed
/// attempt is rolled back so retries never double-count.
#[allow(clippy::too_many_arguments)]
async fn upload_part_once(
    api: &ApiClient,
    bar: &Arc<Bar>,
    file_path: &Path,
    upload_path: &str,
    query: &[(&str, String)],
    ordinal: i64,
    start: i64,
    length: i64,
) -> Result<PartFile> {
    let mut file = tokio::fs::File::open(file_path).await?;
    file.seek(SeekFrom::Start(start as u64)).await?;
    let limited = file.take(length as u64);

    let reported = Arc::new(AtomicI64::new(0));
    let reader = ProgressReader::new(limited, {
        let bar = bar.clone();
        let reported = reported.clone();
        move |n| {
            bar.inc(n);
            reported.fetch_add(n, Ordering::Relaxed);
        }
    });
    let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));

    let rollback = |e: UploadError| {
        bar.inc(-reported.load(Ordering::Relaxed));
        e
    };

    let result = api
        .post_stream::<PartFile>(upload_path, query, body, length as u64)
        .await;

    match result {
        Ok((status, Some(part)))
            if (status == StatusCode::OK || status == StatusCode::CREATED)
                && part.part_id != 0 =>
        {
            Ok(part)
        }
        Ok((status, Some(_))) if status == StatusCode::OK || status == StatusCode::CREATED => {
            Err(rollback(UploadError::PartNotPersisted { part_no: ordinal }))
        }
        Ok((status, _)) => Err(rollback(UploadError::api(status, upload_path))),
        Err(e) => Err(rollback(e.into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint("42", "backup.tar", 2500, 7);
        let b = fingerprint("42", "backup.tar", 2500, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_varies_with_inputs() {
        let base = fingerprint("42", "backup.tar", 2500, 7);
        assert_ne!(base, fingerprint("43", "backup.tar", 2500, 7));
        assert_ne!(base, fingerprint("42", "backup2.tar", 2500, 7));
        assert_ne!(base, fingerprint("42", "backup.tar", 2501, 7));
        assert_ne!(base, fingerprint("42", "backup.tar", 2500, 8));
    }

    #[test]
    fn test_total_parts_is_ceiling() {
        assert_eq!(total_parts(1, 1000), 1);
        assert_eq!(total_parts(1000, 1000), 1);
        assert_eq!(total_parts(1001, 1000), 2);
        assert_eq!(total_parts(2500, 1000), 3);
        assert_eq!(total_parts(0, 1000), 0);
    }

    #[test]
    fn test_part_name_single_part_uses_file_name() {
        assert_eq!(part_name(false, "a.bin", 1, 1), "a.bin");
    }

    #[test]
    fn test_part_name_multi_part_is_zero_padded() {
        assert_eq!(part_name(false, "a.bin", 3, 1), "a.bin.part.001");
        assert_eq!(part_name(false, "a.bin", 3, 3), "a.bin.part.003");
        assert_eq!(part_name(false, "a.bin", 120, 100), "a.bin.part.100");
    }

    #[test]
    fn test_part_name_randomised_is_uuid_hex() {
        let name = part_name(true, "a.bin", 3, 1);
        assert_eq!(name.len(), 32);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(name, part_name(true, "a.bin", 3, 1));
    }

    #[test]
    fn test_detect_mime_falls_back_to_octet_stream() {
        assert_eq!(detect_mime(&[0u8; 16]), "application/octet-stream");
        // %PDF magic
        assert_eq!(detect_mime(b"%PDF-1.7 rest"), "application/pdf");
    }
}
