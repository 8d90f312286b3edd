use crate::download;
use crate::extract::{self, normalize_http_url};
use crate::harvest::{self, HarvestOutcome, HarvestRequest};
use crate::paths::AppPaths;
use crate::presets;
use crate::thumbs;
use crate::verify;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

const ERROR_MESSAGE_MAX_CHARS: usize = 200;
const JOB_LOG_ROTATE_BYTES: u64 = 50 * 1024 * 1024;
const JOB_LOG_MAX_BACKUPS: usize = 3;
pub(crate) const HTTP_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Scan,
    DirectDownload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }
}

/// A verified, thumbnailed media candidate. Immutable once built by the
/// thumbnail stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: String,
    pub url: String,
    pub kind: MediaKind,
    pub content_type: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub size_bytes: Option<u64>,
    pub thumb_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub id: String,
    pub status: JobStatus,
    pub message: String,
    pub progress_index: usize,
    pub progress_total: usize,
    pub created_at_ms: i64,
    pub finished_at_ms: Option<i64>,
    pub job_type: JobType,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub ultra: bool,
    pub use_login_profile: bool,
    pub debug_browser: bool,
    pub min_width: u32,
    pub min_height: u32,
    pub want_image: bool,
    pub want_video: bool,
    pub blacklist: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ultra: false,
            use_login_profile: false,
            debug_browser: false,
            min_width: 0,
            min_height: 0,
            want_image: true,
            want_video: true,
            blacklist: extract::DEFAULT_BLACKLIST
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Per-job cancellation flag. Setting is idempotent; every pipeline stage
/// polls it at its unit-of-work boundaries.
#[derive(Debug, Default)]
pub struct CancelFlag {
    flag: AtomicBool,
}

impl CancelFlag {
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

struct JobEntry {
    state: JobState,
    items: Vec<MediaItem>,
    cancel: Arc<CancelFlag>,
}

/// Thread-safe store of job state, accumulated items and cancellation flags.
/// The state, item list and flag for a job are created together and live for
/// the whole job; status transitions are atomic under one registry lock and
/// terminal statuses are never overwritten.
#[derive(Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobEntry>> {
        self.jobs.lock().expect("job registry lock")
    }

    pub fn new_job(&self, job_type: JobType) -> String {
        let mut jobs = self.lock();
        loop {
            let candidate = hash8(&Uuid::new_v4().to_string());
            if jobs.contains_key(&candidate) {
                continue;
            }
            let entry = JobEntry {
                state: JobState {
                    id: candidate.clone(),
                    status: JobStatus::Idle,
                    message: String::new(),
                    progress_index: 0,
                    progress_total: 1,
                    created_at_ms: now_ms(),
                    finished_at_ms: None,
                    job_type,
                },
                items: Vec::new(),
                cancel: Arc::new(CancelFlag::default()),
            };
            jobs.insert(candidate.clone(), entry);
            return candidate;
        }
    }

    pub fn job_state(&self, job_id: &str) -> Result<JobState> {
        self.lock()
            .get(job_id)
            .map(|entry| entry.state.clone())
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    pub fn job_items(&self, job_id: &str) -> Result<Vec<MediaItem>> {
        self.lock()
            .get(job_id)
            .map(|entry| entry.items.clone())
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    pub fn cancel_flag(&self, job_id: &str) -> Result<Arc<CancelFlag>> {
        self.lock()
            .get(job_id)
            .map(|entry| Arc::clone(&entry.cancel))
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))
    }

    /// Requests cancellation. A no-op for jobs that already reached a
    /// terminal status.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let jobs = self.lock();
        let entry = jobs
            .get(job_id)
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        if !entry.state.status.is_terminal() {
            entry.cancel.set();
        }
        Ok(())
    }

    pub fn set_status(&self, job_id: &str, status: JobStatus, message: impl Into<String>) {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        if entry.state.status.is_terminal() {
            return;
        }
        entry.state.status = status;
        entry.state.message = message.into();
        if status.is_terminal() && entry.state.finished_at_ms.is_none() {
            entry.state.finished_at_ms = Some(now_ms());
        }
    }

    pub fn set_progress(&self, job_id: &str, index: usize, total: usize, message: impl Into<String>) {
        let mut jobs = self.lock();
        let Some(entry) = jobs.get_mut(job_id) else {
            return;
        };
        entry.state.progress_index = index;
        entry.state.progress_total = total.max(1);
        let message = message.into();
        if !message.is_empty() {
            entry.state.message = message;
        }
    }

    pub fn add_items(&self, job_id: &str, items: Vec<MediaItem>) {
        let mut jobs = self.lock();
        if let Some(entry) = jobs.get_mut(job_id) {
            entry.items.extend(items);
        }
    }

    /// Opens an item's persisted thumbnail for streaming to the host.
    pub fn open_thumbnail(
        &self,
        paths: &AppPaths,
        job_id: &str,
        item_id: &str,
    ) -> Result<std::fs::File> {
        self.job_state(job_id)?;
        let missing = || EngineError::ThumbnailMissing {
            job_id: job_id.to_string(),
            item_id: item_id.to_string(),
        };
        if item_id.is_empty() || !item_id.chars().all(|ch| ch.is_ascii_hexdigit()) {
            return Err(missing());
        }
        let path = paths.job_thumbs_dir(job_id).join(format!("{item_id}.jpg"));
        std::fs::File::open(path).map_err(|_| missing())
    }

    /// Starts a scan job; returns the job id immediately while the pipeline
    /// runs on its own worker thread.
    pub fn start_scan_job(
        self: &Arc<Self>,
        paths: &AppPaths,
        url: &str,
        options: ScanOptions,
    ) -> Result<String> {
        let url = normalize_http_url(url)?;
        let job_id = self.new_job(JobType::Scan);
        let registry = Arc::clone(self);
        let paths = paths.clone();
        let worker_job_id = job_id.clone();
        thread::spawn(move || {
            run_scan_job(&registry, &paths, &worker_job_id, &url, &options);
        });
        Ok(job_id)
    }

    /// Starts a direct-download job for an explicit URL list.
    pub fn start_direct_download_job(
        self: &Arc<Self>,
        paths: &AppPaths,
        urls: Vec<String>,
        dest_dir: Option<PathBuf>,
    ) -> Result<String> {
        if urls.is_empty() {
            return Err(EngineError::InvalidUrl("no URLs provided".to_string()));
        }
        let mut normalized = Vec::with_capacity(urls.len());
        for url in &urls {
            normalized.push(normalize_http_url(url)?);
        }
        let dest_dir = dest_dir.unwrap_or_else(|| paths.downloads_dir());
        let job_id = self.new_job(JobType::DirectDownload);
        let registry = Arc::clone(self);
        let paths = paths.clone();
        let worker_job_id = job_id.clone();
        thread::spawn(move || {
            run_direct_download_job(&registry, &paths, &worker_job_id, &normalized, &dest_dir);
        });
        Ok(job_id)
    }
}

fn run_scan_job(
    registry: &Arc<JobRegistry>,
    paths: &AppPaths,
    job_id: &str,
    url: &str,
    options: &ScanOptions,
) {
    match scan_job_body(registry, paths, job_id, url, options) {
        Ok(()) => {}
        Err(EngineError::Canceled) => {
            registry.set_status(job_id, JobStatus::Cancelled, "Cancelled.");
        }
        Err(err) => {
            registry.set_status(
                job_id,
                JobStatus::Error,
                truncate_message(&format!("Error: {err}")),
            );
        }
    }
}

fn scan_job_body(
    registry: &Arc<JobRegistry>,
    paths: &AppPaths,
    job_id: &str,
    url: &str,
    options: &ScanOptions,
) -> Result<()> {
    let cancel = registry.cancel_flag(job_id)?;
    let preset = presets::resolve_preset(url);
    let blacklist = {
        let normalized = extract::normalize_keywords(&options.blacklist);
        if normalized.is_empty() {
            extract::DEFAULT_BLACKLIST
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            normalized
        }
    };

    let thumbs_dir = paths.job_thumbs_dir(job_id);
    std::fs::create_dir_all(&thumbs_dir)?;

    registry.set_status(
        job_id,
        JobStatus::Running,
        format!("Scanning... ({})", preset.name),
    );
    log_line(
        paths,
        job_id,
        "info",
        "scan_started",
        serde_json::json!({
            "url": extract::redact_url(url),
            "preset": preset.name,
            "ultra": options.ultra,
        }),
    )?;

    let request = HarvestRequest {
        start_url: url.to_string(),
        ultra: options.ultra,
        use_login_profile: options.use_login_profile,
        debug_browser: options.debug_browser,
        want_image: options.want_image,
        want_video: options.want_video,
        blacklist,
        preset,
        profile_dir: paths.browser_profile_dir(),
    };

    let outcome = {
        let registry = Arc::clone(registry);
        let progress_job_id = job_id.to_string();
        harvest::run_harvest(request, Arc::clone(&cancel), move |index, total, message| {
            registry.set_progress(&progress_job_id, index, total, message);
        })?
    };

    let HarvestOutcome {
        net_candidates,
        dom_candidates,
        navigated,
        ..
    } = outcome;
    let net_count = net_candidates.len();
    let dom_count = dom_candidates.len();
    let merged = dedupe_first_seen(net_candidates.into_iter().chain(dom_candidates));

    log_line(
        paths,
        job_id,
        "info",
        "harvest_finished",
        serde_json::json!({
            "net": net_count,
            "dom": dom_count,
            "merged": merged.len(),
            "navigated": navigated,
        }),
    )?;

    if merged.is_empty() {
        registry.set_status(job_id, JobStatus::Done, "No candidates found (try Ultra).");
        return Ok(());
    }

    registry.set_progress(
        job_id,
        0,
        merged.len(),
        format!("Verifying links... (net={net_count} dom={dom_count})"),
    );
    let verified = {
        let registry = Arc::clone(registry);
        let progress_job_id = job_id.to_string();
        verify::verify_candidates(
            &merged,
            options.want_image,
            options.want_video,
            &cancel,
            move |done, total| {
                registry.set_progress(
                    &progress_job_id,
                    done,
                    total,
                    format!("Verifying... ({done}/{total})"),
                );
            },
        )?
    };

    if verified.is_empty() {
        registry.set_status(job_id, JobStatus::Done, "No media verified (try Ultra).");
        return Ok(());
    }

    registry.set_progress(job_id, 0, verified.len(), "Building thumbnails...");
    let mut items = {
        let registry = Arc::clone(registry);
        let progress_job_id = job_id.to_string();
        thumbs::build_thumbnails(
            verified,
            &thumbs_dir,
            options.min_width,
            options.min_height,
            &cancel,
            move |done, total| {
                registry.set_progress(
                    &progress_job_id,
                    done,
                    total,
                    format!("Thumb... ({done}/{total})"),
                );
            },
        )?
    };

    sort_items(&mut items);

    if let Err(err) = write_manifest(&paths.job_dir(job_id).join("manifest.csv"), &items) {
        log_line(
            paths,
            job_id,
            "warn",
            "manifest_write_failed",
            serde_json::json!({ "error": err.to_string() }),
        )?;
    }

    let item_count = items.len();
    registry.add_items(job_id, items);
    registry.set_status(
        job_id,
        JobStatus::Done,
        format!("Done. {item_count} items. (net={net_count})"),
    );
    log_line(
        paths,
        job_id,
        "info",
        "scan_finished",
        serde_json::json!({ "items": item_count }),
    )?;
    Ok(())
}

fn run_direct_download_job(
    registry: &Arc<JobRegistry>,
    paths: &AppPaths,
    job_id: &str,
    urls: &[String],
    dest_dir: &Path,
) {
    match direct_download_body(registry, paths, job_id, urls, dest_dir) {
        Ok(summary) => {
            registry.set_status(
                job_id,
                JobStatus::Done,
                format!("Done. {} downloaded, {} failed.", summary.ok, summary.failed),
            );
        }
        Err(EngineError::Canceled) => {
            registry.set_status(job_id, JobStatus::Cancelled, "Cancelled.");
        }
        Err(err) => {
            registry.set_status(
                job_id,
                JobStatus::Error,
                truncate_message(&format!("Error: {err}")),
            );
        }
    }
}

fn direct_download_body(
    registry: &Arc<JobRegistry>,
    paths: &AppPaths,
    job_id: &str,
    urls: &[String],
    dest_dir: &Path,
) -> Result<download::DownloadSummary> {
    let cancel = registry.cancel_flag(job_id)?;
    registry.set_status(job_id, JobStatus::Running, "Downloading...");
    registry.set_progress(job_id, 0, urls.len(), "");
    log_line(
        paths,
        job_id,
        "info",
        "download_started",
        serde_json::json!({ "urls": urls.len() }),
    )?;

    let progress_registry = Arc::clone(registry);
    let progress_job_id = job_id.to_string();
    let summary = download::run_direct_download(urls, dest_dir, &cancel, move |done, total| {
        progress_registry.set_progress(
            &progress_job_id,
            done,
            total,
            format!("Downloading... ({done}/{total})"),
        );
    })?;

    log_line(
        paths,
        job_id,
        "info",
        "download_finished",
        serde_json::json!({ "ok": summary.ok, "failed": summary.failed }),
    )?;
    Ok(summary)
}

/// First-seen-order deduplication of the merged candidate stream.
pub(crate) fn dedupe_first_seen<I>(urls: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for url in urls {
        if url.is_empty() {
            continue;
        }
        if seen.insert(url.clone()) {
            out.push(url);
        }
    }
    out
}

/// Images before videos; within a kind, larger pixel area first. Items with
/// unknown dimensions sort last within their kind.
pub(crate) fn sort_items(items: &mut [MediaItem]) {
    items.sort_by_key(|item| {
        let kind_rank = match item.kind {
            MediaKind::Image => 0_u8,
            MediaKind::Video => 1,
        };
        let area = if item.width > 0 && item.height > 0 {
            u64::from(item.width) * u64::from(item.height)
        } else {
            0
        };
        (kind_rank, Reverse(area))
    });
}

fn write_manifest(path: &Path, items: &[MediaItem]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record([
        "id",
        "url",
        "kind",
        "content_type",
        "width",
        "height",
        "format",
        "size_bytes",
        "thumb_path",
    ])?;
    for item in items {
        let width = item.width.to_string();
        let height = item.height.to_string();
        let size = item.size_bytes.map(|v| v.to_string()).unwrap_or_default();
        writer.write_record([
            item.id.as_str(),
            item.url.as_str(),
            item.kind.as_str(),
            item.content_type.as_str(),
            width.as_str(),
            height.as_str(),
            item.format.as_str(),
            size.as_str(),
            item.thumb_path.as_str(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Stable short id: first 8 hex chars of SHA-256.
pub fn hash8(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_MAX_CHARS {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_MAX_CHARS).collect()
    }
}

pub(crate) fn build_http_agent(timeout_secs: u64) -> ureq::Agent {
    let mut config = ureq::Agent::config_builder();
    config = config
        .http_status_as_error(false)
        .timeout_global(Some(Duration::from_secs(timeout_secs.max(1))))
        .user_agent(HTTP_USER_AGENT);
    config.build().into()
}

pub(crate) fn header_string(response: &ureq::http::Response<ureq::Body>, key: &str) -> String {
    response
        .headers()
        .get(key)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase()
}

pub(crate) fn log_line(
    paths: &AppPaths,
    job_id: &str,
    level: &str,
    event: &str,
    data: serde_json::Value,
) -> Result<()> {
    let line = serde_json::json!({
        "ts_ms": now_ms(),
        "job_id": job_id,
        "level": level,
        "event": event,
        "data": data
    })
    .to_string();

    let path = paths.job_logs_dir().join(format!("{job_id}.jsonl"));
    std::fs::create_dir_all(paths.job_logs_dir())?;
    rotate_job_log_if_needed(&path)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(format!("{line}\n").as_bytes())?;
    Ok(())
}

fn rotate_job_log_if_needed(path: &Path) -> Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => return Ok(()),
    };
    if len < JOB_LOG_ROTATE_BYTES {
        return Ok(());
    }
    rotate_file_backups(path, JOB_LOG_MAX_BACKUPS)?;
    Ok(())
}

fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    if max_backups == 0 {
        let _ = std::fs::remove_file(path);
        return Ok(());
    }
    for i in (1..=max_backups).rev() {
        let dst = path_with_suffix(path, &format!(".{i}"));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            path_with_suffix(path, &format!(".{}", i - 1))
        };
        if src.exists() {
            if i == max_backups {
                let _ = std::fs::remove_file(&dst);
            }
            let _ = std::fs::rename(&src, &dst);
        }
    }
    Ok(())
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
