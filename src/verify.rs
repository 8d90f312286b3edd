use crate::extract::{
    is_image_content_type, is_video_content_type, looks_like_image_url, looks_like_video_url,
};
use crate::jobs::{self, CancelFlag};
use crate::thumbs;
use crate::{EngineError, Result};
use std::collections::VecDeque;
use std::io::Read;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

const VERIFY_WORKERS: usize = 20;
const HEAD_TIMEOUT_SECS: u64 = 10;
const SNIFF_GET_TIMEOUT_SECS: u64 = 18;
const SNIFF_BYTES: u64 = 64 * 1024;
const PROGRESS_EVERY: usize = 5;

/// A candidate that passed probing: confirmed image/video content.
#[derive(Debug, Clone)]
pub struct VerifiedCandidate {
    pub url: String,
    pub content_type: String,
    pub size_bytes: Option<u64>,
}

/// Probes every candidate with a bounded worker pool. Rejections are
/// silent; only aggregate progress advances. Observing cancellation between
/// completions abandons the stage — results of still-running probes are
/// discarded.
pub fn verify_candidates<F>(
    candidates: &[String],
    want_image: bool,
    want_video: bool,
    cancel: &Arc<CancelFlag>,
    mut on_progress: F,
) -> Result<Vec<VerifiedCandidate>>
where
    F: FnMut(usize, usize),
{
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let queue: Arc<Mutex<VecDeque<String>>> =
        Arc::new(Mutex::new(candidates.iter().cloned().collect()));
    let (tx, rx) = mpsc::channel::<Option<VerifiedCandidate>>();
    let worker_count = VERIFY_WORKERS.min(candidates.len());
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        let cancel = Arc::clone(cancel);
        thread::spawn(move || {
            let head_agent = jobs::build_http_agent(HEAD_TIMEOUT_SECS);
            let sniff_agent = jobs::build_http_agent(SNIFF_GET_TIMEOUT_SECS);
            loop {
                if cancel.is_set() {
                    break;
                }
                let next = match queue.lock() {
                    Ok(mut queue) => queue.pop_front(),
                    Err(_) => None,
                };
                let Some(url) = next else {
                    break;
                };
                let verdict = verify_one(&head_agent, &sniff_agent, &url, want_image, want_video);
                if tx.send(verdict).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let total = candidates.len();
    let mut done = 0_usize;
    let mut accepted = Vec::new();
    for verdict in rx {
        if cancel.is_set() {
            return Err(EngineError::Canceled);
        }
        done += 1;
        if let Some(candidate) = verdict {
            accepted.push(candidate);
        }
        if done % PROGRESS_EVERY == 0 || done == total {
            on_progress(done, total);
        }
    }
    if cancel.is_set() {
        return Err(EngineError::Canceled);
    }
    Ok(accepted)
}

/// Two-tier probe. The header probe alone accepts when the content-type or
/// the URL extension already matches a wanted kind; otherwise a capped
/// partial-body GET decides. For images the sniffed bytes must parse as a
/// real image header, which catches mislabeled content-types; videos are
/// accepted on type/extension alone since their bytes are never fetched.
fn verify_one(
    head_agent: &ureq::Agent,
    sniff_agent: &ureq::Agent,
    url: &str,
    want_image: bool,
    want_video: bool,
) -> Option<VerifiedCandidate> {
    let (content_type, size_bytes) = head_probe(head_agent, url);
    if want_image && (is_image_content_type(&content_type) || looks_like_image_url(url)) {
        return Some(VerifiedCandidate {
            url: url.to_string(),
            content_type,
            size_bytes,
        });
    }
    if want_video && (is_video_content_type(&content_type) || looks_like_video_url(url)) {
        return Some(VerifiedCandidate {
            url: url.to_string(),
            content_type,
            size_bytes,
        });
    }

    let (prefix, sniffed_type) = sniff_probe(sniff_agent, url)?;
    let content_type = if sniffed_type.is_empty() {
        content_type
    } else {
        sniffed_type
    };
    if want_image && (is_image_content_type(&content_type) || looks_like_image_url(url)) {
        thumbs::probe_image_dimensions(&prefix)?;
        return Some(VerifiedCandidate {
            url: url.to_string(),
            content_type,
            size_bytes,
        });
    }
    if want_video && (is_video_content_type(&content_type) || looks_like_video_url(url)) {
        return Some(VerifiedCandidate {
            url: url.to_string(),
            content_type,
            size_bytes,
        });
    }
    None
}

/// HEAD with redirects followed; any failure degrades to "nothing known".
fn head_probe(agent: &ureq::Agent, url: &str) -> (String, Option<u64>) {
    let response = match agent.head(url).call() {
        Ok(response) => response,
        Err(_) => return (String::new(), None),
    };
    let content_type = jobs::header_string(&response, "content-type");
    let size = response
        .headers()
        .get("content-length")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    (content_type, size)
}

/// Streamed GET capped at `SNIFF_BYTES`.
fn sniff_probe(agent: &ureq::Agent, url: &str) -> Option<(Vec<u8>, String)> {
    let mut response = agent.get(url).call().ok()?;
    if response.status().as_u16() >= 400 {
        return None;
    }
    let content_type = jobs::header_string(&response, "content-type");
    let mut prefix = Vec::new();
    response
        .body_mut()
        .as_reader()
        .take(SNIFF_BYTES)
        .read_to_end(&mut prefix)
        .ok()?;
    Some((prefix, content_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;

    fn start_fixture_server<F>(connections: usize, respond: F) -> String
    where
        F: Fn(&str) -> Vec<u8> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fixture listener");
        let addr = listener.local_addr().expect("fixture addr");
        thread::spawn(move || {
            for _ in 0..connections {
                let Ok((mut stream, _)) = listener.accept() else {
                    break;
                };
                let mut head = Vec::new();
                let mut buf = [0_u8; 4096];
                loop {
                    let Ok(read) = stream.read(&mut buf) else {
                        break;
                    };
                    if read == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..read]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let request = String::from_utf8_lossy(&head).into_owned();
                let response = respond(&request);
                let _ = stream.write_all(&response);
            }
        });
        format!("http://{addr}")
    }

    fn response_with_body(content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            content_type,
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn headers_only(content_type: &str, content_length: usize) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {content_length}\r\nConnection: close\r\n\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn header_probe_alone_accepts_a_declared_image() {
        let base = start_fixture_server(1, |_request| headers_only("image/jpeg", 12345));
        let cancel = Arc::new(CancelFlag::default());
        let accepted = verify_candidates(
            &[format!("{base}/photo")],
            true,
            false,
            &cancel,
            |_done, _total| {},
        )
        .expect("verify");
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].content_type, "image/jpeg");
        assert_eq!(accepted[0].size_bytes, Some(12345));
    }

    #[test]
    fn mislabeled_html_fails_the_sniff_decode_gate() {
        let base = start_fixture_server(2, |request| {
            if request.starts_with("HEAD") {
                headers_only("text/plain", 0)
            } else {
                // 200 OK with an image content-type but HTML bytes.
                response_with_body("image/jpeg", b"<html><body>not found</body></html>")
            }
        });
        let cancel = Arc::new(CancelFlag::default());
        let accepted = verify_candidates(
            &[format!("{base}/page")],
            true,
            false,
            &cancel,
            |_done, _total| {},
        )
        .expect("verify");
        assert!(accepted.is_empty());
    }

    #[test]
    fn video_is_accepted_from_the_sniff_content_type_without_decoding() {
        let base = start_fixture_server(2, |request| {
            if request.starts_with("HEAD") {
                headers_only("text/plain", 0)
            } else {
                response_with_body("video/mp4", b"\x00\x00\x00\x18ftypmp42")
            }
        });
        let cancel = Arc::new(CancelFlag::default());
        let accepted = verify_candidates(
            &[format!("{base}/clip")],
            false,
            true,
            &cancel,
            |_done, _total| {},
        )
        .expect("verify");
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].content_type, "video/mp4");
    }

    #[test]
    fn unwanted_kinds_are_rejected_even_when_well_formed() {
        let base = start_fixture_server(2, |request| {
            if request.starts_with("HEAD") {
                headers_only("video/mp4", 100)
            } else {
                response_with_body("video/mp4", b"\x00\x00\x00\x18ftypmp42")
            }
        });
        let cancel = Arc::new(CancelFlag::default());
        let accepted = verify_candidates(
            &[format!("{base}/clip.mp4")],
            true,
            false,
            &cancel,
            |_done, _total| {},
        )
        .expect("verify");
        assert!(accepted.is_empty());
    }

    #[test]
    fn pre_set_cancellation_aborts_without_probing() {
        let cancel = Arc::new(CancelFlag::default());
        cancel.set();
        // Port 9 (discard) is never listened on here; a probe attempt would
        // block on connect, so the early flag check is what keeps this fast.
        let result = verify_candidates(
            &["http://127.0.0.1:9/a.jpg".to_string()],
            true,
            true,
            &cancel,
            |_done, _total| {},
        );
        assert!(matches!(result, Err(EngineError::Canceled)));
    }

    #[test]
    fn empty_candidate_list_short_circuits() {
        let cancel = Arc::new(CancelFlag::default());
        let accepted =
            verify_candidates(&[], true, true, &cancel, |_done, _total| {}).expect("verify");
        assert!(accepted.is_empty());
    }
}
