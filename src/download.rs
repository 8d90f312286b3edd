use crate::extract::{
    self, is_image_content_type, is_video_content_type, looks_like_image_url, looks_like_video_url,
};
use crate::jobs::{self, CancelFlag};
use crate::{EngineError, Result};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use url::Url;

const DOWNLOAD_TIMEOUT_SECS: u64 = 90;
const SNIFF_PREFIX_BYTES: usize = 8192;
const COPY_BUF_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct DownloadSummary {
    pub ok: usize,
    pub failed: usize,
}

/// Downloads each URL in sequence into `<dest>/<host>/`. Individual
/// failures only bump the counter; cancellation between units aborts the
/// whole job.
pub fn run_direct_download<F>(
    urls: &[String],
    dest_dir: &Path,
    cancel: &Arc<CancelFlag>,
    mut on_progress: F,
) -> Result<DownloadSummary>
where
    F: FnMut(usize, usize),
{
    std::fs::create_dir_all(dest_dir)?;
    let agent = jobs::build_http_agent(DOWNLOAD_TIMEOUT_SECS);
    let mut summary = DownloadSummary::default();
    let total = urls.len();
    for (index, url) in urls.iter().enumerate() {
        if cancel.is_set() {
            return Err(EngineError::Canceled);
        }
        match download_one(&agent, url, dest_dir) {
            Ok(_) => summary.ok += 1,
            Err(_) => summary.failed += 1,
        }
        on_progress(index + 1, total);
    }
    Ok(summary)
}

/// Streams one URL to disk through a `.part` file, sniffing the first bytes
/// so that HTML/JSON error pages never land as media files.
fn download_one(agent: &ureq::Agent, url: &str, dest_dir: &Path) -> Result<PathBuf> {
    let host = Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| "unknown-host".to_string());
    let out_dir = dest_dir.join(sanitize_name(&host));
    std::fs::create_dir_all(&out_dir)?;

    let mut response = agent.get(url).call().map_err(|err| {
        EngineError::Download(format!(
            "request failed for {}: {err}",
            extract::redact_url(url)
        ))
    })?;
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(EngineError::Download(format!(
            "http {status} for {}",
            extract::redact_url(url)
        )));
    }
    let content_type = jobs::header_string(&response, "content-type");

    let stem = file_stem_for(url, &host);
    let ext = guess_extension(url, &content_type);
    let part_path = out_dir.join(format!("{stem}.part"));
    let mut final_path = out_dir.join(format!("{stem}.{ext}"));
    let mut counter = 1;
    while final_path.exists() {
        final_path = out_dir.join(format!("{stem}_{counter}.{ext}"));
        counter += 1;
    }

    let mut output = std::fs::File::create(&part_path)?;
    let mut reader = response.body_mut().as_reader();
    let mut buf = [0_u8; COPY_BUF_BYTES];
    let mut sniff_prefix: Vec<u8> = Vec::with_capacity(SNIFF_PREFIX_BYTES);
    let mut bytes_written = 0_u64;
    loop {
        let read = match reader.read(&mut buf) {
            Ok(read) => read,
            Err(err) => {
                let _ = std::fs::remove_file(&part_path);
                return Err(EngineError::Download(format!(
                    "failed reading body for {}: {err}",
                    extract::redact_url(url)
                )));
            }
        };
        if read == 0 {
            break;
        }
        if sniff_prefix.len() < SNIFF_PREFIX_BYTES {
            let take = (SNIFF_PREFIX_BYTES - sniff_prefix.len()).min(read);
            sniff_prefix.extend_from_slice(&buf[..take]);
        }
        if let Err(err) = output.write_all(&buf[..read]) {
            let _ = std::fs::remove_file(&part_path);
            return Err(EngineError::Download(format!(
                "failed writing file for {}: {err}",
                extract::redact_url(url)
            )));
        }
        bytes_written = bytes_written.saturating_add(read as u64);
    }
    output.flush()?;
    drop(output);

    if bytes_written == 0 {
        let _ = std::fs::remove_file(&part_path);
        return Err(EngineError::Download(format!(
            "downloaded file is empty for {}",
            extract::redact_url(url)
        )));
    }
    if is_non_media_payload(&content_type, &sniff_prefix) {
        let _ = std::fs::remove_file(&part_path);
        return Err(EngineError::Download(format!(
            "URL did not resolve to a direct media file: {}",
            extract::redact_url(url)
        )));
    }

    std::fs::rename(&part_path, &final_path)?;
    Ok(final_path)
}

/// Extension preference: content-type first, then the URL path, else `bin`.
fn guess_extension(url: &str, content_type: &str) -> String {
    let base = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if is_image_content_type(content_type) {
        if base.contains("jpeg") {
            return "jpg".to_string();
        }
        if let Some(subtype) = base.strip_prefix("image/") {
            if !subtype.is_empty() {
                return subtype.to_string();
            }
        }
    } else if is_video_content_type(content_type) {
        if let Some(subtype) = base.strip_prefix("video/") {
            if !subtype.is_empty() {
                return subtype.to_string();
            }
        }
    } else if looks_like_image_url(url) || looks_like_video_url(url) {
        let path = url
            .split('?')
            .next()
            .unwrap_or("")
            .split('#')
            .next()
            .unwrap_or("");
        if let Some((_, ext)) = path.rsplit_once('.') {
            if !ext.is_empty() && !ext.contains('/') {
                return ext.to_ascii_lowercase();
            }
        }
    }
    "bin".to_string()
}

fn file_stem_for(url: &str, host: &str) -> String {
    let path = url
        .split('?')
        .next()
        .unwrap_or("")
        .split('#')
        .next()
        .unwrap_or("");
    let name = path.rsplit('/').next().unwrap_or("");
    let stem = Path::new(name)
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("");
    let sanitized = sanitize_name(stem);
    if sanitized.is_empty() {
        format!("{}_{}", sanitize_name(host), jobs::hash8(url))
    } else {
        sanitized
    }
}

fn sanitize_name(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches(|ch| ch == '.' || ch == '_').to_string()
}

fn is_non_media_payload(content_type: &str, sniff_prefix: &[u8]) -> bool {
    let ctype = content_type.trim().to_ascii_lowercase();
    if !ctype.is_empty() {
        if ctype.starts_with("image/")
            || ctype.starts_with("video/")
            || ctype.contains("application/octet-stream")
        {
            return false;
        }
        if ctype.starts_with("text/")
            || ctype.contains("html")
            || ctype.contains("json")
            || ctype.contains("xml")
            || ctype.contains("javascript")
        {
            return true;
        }
    }
    looks_like_textual_payload(sniff_prefix)
}

fn looks_like_textual_payload(sniff_prefix: &[u8]) -> bool {
    if sniff_prefix.is_empty() {
        return false;
    }
    let head = String::from_utf8_lossy(sniff_prefix);
    let trimmed = head.trim_start().to_ascii_lowercase();
    trimmed.starts_with("<!doctype html")
        || trimmed.starts_with("<html")
        || trimmed.starts_with("<?xml")
        || trimmed.starts_with('{')
        || trimmed.starts_with('[')
}
