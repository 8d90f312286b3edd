use crate::extract;
use crate::jobs::{CancelFlag, HTTP_USER_AGENT};
use crate::presets::{self, SitePreset};
use crate::{EngineError, Result};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use url::Url;

const GOTO_TIMEOUT_MS: u64 = 60_000;
const SETTLE_AFTER_NAV_MS: u64 = 1_500;
const SCROLL_STEP_JS: &str = "window.scrollBy(0, 1800)";
const ULTRA_EXTRA_WAIT_MS: u64 = 500;
const ULTRA_EXTRA_STABLE_ROUNDS: usize = 2;
const NET_STALL_ROUNDS: usize = 2;
const NET_STALL_MIN_ROUND: usize = 10;

#[derive(Debug, Clone)]
pub struct HarvestRequest {
    pub start_url: String,
    pub ultra: bool,
    pub use_login_profile: bool,
    pub debug_browser: bool,
    pub want_image: bool,
    pub want_video: bool,
    pub blacklist: Vec<String>,
    pub preset: SitePreset,
    pub profile_dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct HarvestOutcome {
    /// URLs observed on the wire, first-seen order, already deduplicated.
    pub net_candidates: Vec<String>,
    /// URLs read from the DOM, document order, duplicates allowed.
    pub dom_candidates: Vec<String>,
    pub final_url: String,
    pub navigated: bool,
}

/// Drives one headless-browser session for a job. Runs on the job's worker
/// thread; the tokio runtime it needs lives and dies inside this call.
pub fn run_harvest<F>(
    request: HarvestRequest,
    cancel: Arc<CancelFlag>,
    mut progress: F,
) -> Result<HarvestOutcome>
where
    F: FnMut(usize, usize, String),
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    runtime.block_on(drive_session(request, cancel, &mut progress))
}

async fn drive_session<F>(
    request: HarvestRequest,
    cancel: Arc<CancelFlag>,
    progress: &mut F,
) -> Result<HarvestOutcome>
where
    F: FnMut(usize, usize, String),
{
    let config = browser_config(&request)?;
    let (mut browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|err| EngineError::BrowserLaunch(err.to_string()))?;
    let handler_task = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                break;
            }
        }
    });

    let result = harvest_on_browser(&browser, &request, &cancel, progress).await;

    // The browser is torn down on every exit path, including cancellation
    // and errors raised mid-harvest.
    let _ = browser.close().await;
    let _ = browser.wait().await;
    handler_task.abort();
    result
}

async fn harvest_on_browser<F>(
    browser: &Browser,
    request: &HarvestRequest,
    cancel: &Arc<CancelFlag>,
    progress: &mut F,
) -> Result<HarvestOutcome>
where
    F: FnMut(usize, usize, String),
{
    let page = browser
        .new_page("about:blank")
        .await
        .map_err(|err| EngineError::BrowserLaunch(err.to_string()))?;
    let _ = page.set_user_agent(HTTP_USER_AGENT).await;
    let _ = page.execute(EnableParams::default()).await;

    let sink = Arc::new(Mutex::new(NetSink::default()));
    let listener = spawn_response_listener(&page, request, cancel, &sink).await?;

    let outcome = scroll_and_extract(&page, request, cancel, &sink, progress).await;
    listener.abort();
    outcome
}

#[derive(Default)]
struct NetSink {
    seen: HashSet<String>,
    urls: Vec<String>,
}

impl NetSink {
    fn admit(&mut self, url: &str, blacklist: &[String]) {
        if url.is_empty()
            || url.to_ascii_lowercase().starts_with("data:")
            || extract::is_blacklisted(url, blacklist)
        {
            return;
        }
        if self.seen.insert(url.to_string()) {
            self.urls.push(url.to_string());
        }
    }

    fn len(&self) -> usize {
        self.urls.len()
    }
}

/// Registers the response observer. Must run before navigation so that
/// early responses are not missed.
async fn spawn_response_listener(
    page: &Page,
    request: &HarvestRequest,
    cancel: &Arc<CancelFlag>,
    sink: &Arc<Mutex<NetSink>>,
) -> Result<JoinHandle<()>> {
    let mut events = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(|err| EngineError::BrowserLaunch(err.to_string()))?;
    let page = page.clone();
    let cancel = Arc::clone(cancel);
    let sink = Arc::clone(sink);
    let preset = request.preset.clone();
    let ultra = request.ultra;
    let want_image = request.want_image;
    let want_video = request.want_video;
    let blacklist = request.blacklist.clone();

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if cancel.is_set() {
                break;
            }
            let resp_url = event.response.url.clone();
            let content_type = event.response.mime_type.clone();
            if !presets::should_scan_network_response(&resp_url, &content_type, &preset, ultra) {
                continue;
            }

            if want_image && extract::looks_like_image_url(&resp_url) {
                if let Ok(mut sink) = sink.lock() {
                    sink.admit(&resp_url, &blacklist);
                }
                continue;
            }
            if want_video && extract::looks_like_video_url(&resp_url) {
                if let Ok(mut sink) = sink.lock() {
                    sink.admit(&resp_url, &blacklist);
                }
                continue;
            }

            // Non-direct candidate: mine the JSON body for embedded media
            // URLs. Body fetch and parse failures are skipped silently.
            let Ok(body) = page
                .execute(GetResponseBodyParams::new(event.request_id.clone()))
                .await
            else {
                continue;
            };
            if body.base64_encoded {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&body.body) else {
                continue;
            };
            let Ok(mut sink) = sink.lock() else {
                continue;
            };
            for leaf in extract::string_leaves(&value) {
                if !leaf.starts_with("http") {
                    continue;
                }
                let unescaped = leaf.replace("\\u0026", "&");
                if (want_image && extract::looks_like_image_url(&unescaped))
                    || (want_video && extract::looks_like_video_url(&unescaped))
                {
                    sink.admit(&unescaped, &blacklist);
                }
            }
        }
    }))
}

async fn scroll_and_extract<F>(
    page: &Page,
    request: &HarvestRequest,
    cancel: &Arc<CancelFlag>,
    sink: &Arc<Mutex<NetSink>>,
    progress: &mut F,
) -> Result<HarvestOutcome>
where
    F: FnMut(usize, usize, String),
{
    let navigated = try_navigate(page, &request.start_url).await;
    tokio::time::sleep(Duration::from_millis(SETTLE_AFTER_NAV_MS)).await;

    let preset = &request.preset;
    let (scroll_wait_ms, max_rounds, stable_to_stop) = if request.ultra {
        (
            preset.scroll_wait_ms + ULTRA_EXTRA_WAIT_MS,
            preset.max_scroll_rounds * 2,
            preset.stable_rounds_to_stop + ULTRA_EXTRA_STABLE_ROUNDS,
        )
    } else {
        (
            preset.scroll_wait_ms,
            preset.max_scroll_rounds,
            preset.stable_rounds_to_stop,
        )
    };

    let mut last_height = 0_i64;
    let mut stable_rounds = 0_usize;
    let mut last_net_count = 0_usize;
    let mut stalled_rounds = 0_usize;

    for round in 0..max_rounds {
        if cancel.is_set() {
            return Err(EngineError::Canceled);
        }
        let net_count = net_len(sink);
        progress(
            round,
            max_rounds,
            format!("Scrolling... ({round}/{max_rounds}) net={net_count}"),
        );

        let _ = page.evaluate_expression(SCROLL_STEP_JS).await;
        tokio::time::sleep(Duration::from_millis(scroll_wait_ms)).await;

        let height = read_scroll_height(page).await.unwrap_or(last_height);
        if height == last_height {
            stable_rounds += 1;
            if stable_rounds >= stable_to_stop {
                break;
            }
        } else {
            stable_rounds = 0;
        }
        last_height = height;

        // Pages whose height keeps growing without yielding new network
        // candidates would otherwise scroll to the round cap.
        let net_count = net_len(sink);
        if net_count == last_net_count {
            stalled_rounds += 1;
            if stalled_rounds >= NET_STALL_ROUNDS && round > NET_STALL_MIN_ROUND {
                break;
            }
        } else {
            stalled_rounds = 0;
        }
        last_net_count = net_count;
    }

    let final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| request.start_url.clone());
    let base_url = Url::parse(&final_url)
        .or_else(|_| Url::parse(&request.start_url))
        .map_err(|_| EngineError::InvalidUrl(final_url.clone()))?;

    let mut dom = DomSink {
        blacklist: &request.blacklist,
        urls: Vec::new(),
    };
    collect_img_candidates(page, &base_url, &mut dom).await;
    collect_background_candidates(page, &base_url, &mut dom).await;
    collect_anchor_candidates(page, &base_url, request.ultra, &mut dom).await;
    collect_video_candidates(page, &base_url, &mut dom).await;
    if request.ultra {
        collect_source_candidates(page, &base_url, &mut dom).await;
        collect_preload_candidates(page, &base_url, &mut dom).await;
        collect_global_state_candidates(page, &mut dom).await;
    }

    if cancel.is_set() {
        return Err(EngineError::Canceled);
    }

    let net_candidates = match sink.lock() {
        Ok(sink) => sink.urls.clone(),
        Err(_) => Vec::new(),
    };
    Ok(HarvestOutcome {
        net_candidates,
        dom_candidates: dom.urls,
        final_url,
        navigated,
    })
}

fn net_len(sink: &Arc<Mutex<NetSink>>) -> usize {
    sink.lock().map(|sink| sink.len()).unwrap_or(0)
}

/// Best-effort page load. Navigation failures and timeouts are part of the
/// contract, not errors: the harvester proceeds against whatever loaded.
async fn try_navigate(page: &Page, url: &str) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_millis(GOTO_TIMEOUT_MS), page.goto(url)).await,
        Ok(Ok(_))
    )
}

async fn read_scroll_height(page: &Page) -> Option<i64> {
    page.evaluate_expression("document.body.scrollHeight")
        .await
        .ok()?
        .into_value::<i64>()
        .ok()
}

struct DomSink<'a> {
    blacklist: &'a [String],
    urls: Vec<String>,
}

impl DomSink<'_> {
    fn admit(&mut self, url: String) {
        if url.is_empty() {
            return;
        }
        if url.to_ascii_lowercase().starts_with("data:") {
            return;
        }
        if extract::is_blacklisted(&url, self.blacklist) {
            return;
        }
        self.urls.push(url);
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ImgAttrs {
    src: String,
    current_src: String,
    srcset: String,
    data_src: String,
    data_original: String,
    data_lazy: String,
    data_lazy_src: String,
    data_srcset: String,
    data_lazy_srcset: String,
    data_zoom: String,
    data_large: String,
    data_full_src: String,
    data_hires: String,
    data_original_src: String,
    data_high_res: String,
    data_lightbox: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SourceAttrs {
    src: String,
    srcset: String,
}

const IMG_ATTRS_JS: &str = r#"() => Array.from(document.querySelectorAll('img')).map(e => ({
    src: e.getAttribute('src') || '',
    currentSrc: e.currentSrc || '',
    srcset: e.getAttribute('srcset') || '',
    dataSrc: e.getAttribute('data-src') || '',
    dataOriginal: e.getAttribute('data-original') || '',
    dataLazy: e.getAttribute('data-lazy') || '',
    dataLazySrc: e.getAttribute('data-lazy-src') || '',
    dataSrcset: e.getAttribute('data-srcset') || '',
    dataLazySrcset: e.getAttribute('data-lazy-srcset') || '',
    dataZoom: e.getAttribute('data-zoom-image') || '',
    dataLarge: e.getAttribute('data-large') || '',
    dataFullSrc: e.getAttribute('data-full-src') || '',
    dataHires: e.getAttribute('data-hires') || '',
    dataOriginalSrc: e.getAttribute('data-original-src') || '',
    dataHighRes: e.getAttribute('data-high-res') || '',
    dataLightbox: e.getAttribute('data-lightbox') || ''
}))"#;

const STYLE_ATTRS_JS: &str = "() => Array.from(document.querySelectorAll('[style]')).map(e => e.getAttribute('style') || '').filter(Boolean)";

const ANCHOR_HREFS_JS: &str = "() => Array.from(document.querySelectorAll('a[href]')).map(a => a.getAttribute('href') || '').filter(Boolean)";

const VIDEO_ATTRS_JS: &str = r#"() => Array.from(document.querySelectorAll("video, video source, source[type^='video']")).map(e => ({
    src: e.getAttribute('src') || '',
    srcset: e.getAttribute('srcset') || ''
}))"#;

const SOURCE_ATTRS_JS: &str = r#"() => Array.from(document.querySelectorAll('source[srcset], source[src]')).map(e => ({
    src: e.getAttribute('src') || '',
    srcset: e.getAttribute('srcset') || ''
}))"#;

const PRELOAD_HREFS_JS: &str = "() => Array.from(document.querySelectorAll(\"link[rel='preload'][href]\")).map(l => l.getAttribute('href') || '').filter(Boolean)";

const GLOBAL_STATE_JS: &str = r#"() => {
    const urls = [];
    const roots = [
        window.__INITIAL_DATA__,
        window.__NEXT_DATA__,
        window.__PRELOADED_STATE__,
        window.App,
        window.pageData
    ];
    const mediaPattern = /^https?:\/\/.+\.(jpg|jpeg|png|gif|webp|bmp|mp4|webm)/i;
    function findUrls(obj, depth) {
        if (depth > 5 || !obj) return;
        if (typeof obj === 'string') {
            if (mediaPattern.test(obj)) urls.push(obj);
        } else if (typeof obj === 'object') {
            for (const key in obj) {
                if (Object.prototype.hasOwnProperty.call(obj, key)) {
                    findUrls(obj[key], depth + 1);
                }
            }
        }
    }
    roots.forEach(r => findUrls(r, 0));
    return urls;
}"#;

async fn eval_vec<T>(page: &Page, js: &str) -> Option<Vec<T>>
where
    T: serde::de::DeserializeOwned,
{
    page.evaluate_function(js)
        .await
        .ok()?
        .into_value::<Vec<T>>()
        .ok()
}

/// Per `<img>`, builds the priority-ordered candidate list (best srcset
/// entry first, then currentSrc, src and the lazy-load attribute ladder)
/// and takes the first non-`data:` entry.
fn best_img_candidate(attrs: &ImgAttrs) -> Option<String> {
    let srcset_best = extract::parse_srcset_largest(&attrs.srcset);
    let mut ranked: Vec<&str> = Vec::new();
    if let Some(best) = srcset_best.as_deref() {
        ranked.push(best);
    }
    ranked.extend([
        attrs.current_src.as_str(),
        attrs.src.as_str(),
        attrs.data_src.as_str(),
        attrs.data_original.as_str(),
        attrs.data_lazy.as_str(),
        attrs.data_lazy_src.as_str(),
        attrs.data_srcset.as_str(),
        attrs.data_lazy_srcset.as_str(),
        attrs.data_zoom.as_str(),
        attrs.data_large.as_str(),
        attrs.data_full_src.as_str(),
        attrs.data_hires.as_str(),
        attrs.data_original_src.as_str(),
        attrs.data_high_res.as_str(),
        attrs.data_lightbox.as_str(),
    ]);
    ranked
        .into_iter()
        .find(|candidate| {
            !candidate.is_empty() && !candidate.to_ascii_lowercase().starts_with("data:")
        })
        .map(str::to_string)
}

async fn collect_img_candidates(page: &Page, base_url: &Url, dom: &mut DomSink<'_>) {
    let Some(entries) = eval_vec::<ImgAttrs>(page, IMG_ATTRS_JS).await else {
        return;
    };
    for attrs in &entries {
        let Some(best) = best_img_candidate(attrs) else {
            continue;
        };
        if let Some(resolved) = extract::resolve_against(base_url, &best) {
            dom.admit(resolved);
        }
    }
}

async fn collect_background_candidates(page: &Page, base_url: &Url, dom: &mut DomSink<'_>) {
    let Some(styles) = eval_vec::<String>(page, STYLE_ATTRS_JS).await else {
        return;
    };
    for style in &styles {
        for raw in extract::extract_background_urls(style) {
            if let Some(resolved) = extract::resolve_against(base_url, &raw) {
                dom.admit(resolved);
            }
        }
    }
}

async fn collect_anchor_candidates(page: &Page, base_url: &Url, ultra: bool, dom: &mut DomSink<'_>) {
    let Some(hrefs) = eval_vec::<String>(page, ANCHOR_HREFS_JS).await else {
        return;
    };
    for href in &hrefs {
        let Some(resolved) = extract::resolve_against(base_url, href) else {
            continue;
        };
        if ultra {
            dom.admit(resolved);
            continue;
        }
        let lower = resolved.to_ascii_lowercase();
        if extract::looks_like_image_url(&resolved)
            || extract::looks_like_video_url(&resolved)
            || lower.contains("/attachment")
        {
            dom.admit(resolved);
        }
    }
}

async fn collect_video_candidates(page: &Page, base_url: &Url, dom: &mut DomSink<'_>) {
    let Some(entries) = eval_vec::<SourceAttrs>(page, VIDEO_ATTRS_JS).await else {
        return;
    };
    for attrs in &entries {
        if !attrs.src.is_empty() {
            if let Some(resolved) = extract::resolve_against(base_url, &attrs.src) {
                dom.admit(resolved);
            }
        }
        if let Some(best) = extract::parse_srcset_largest(&attrs.srcset) {
            if let Some(resolved) = extract::resolve_against(base_url, &best) {
                dom.admit(resolved);
            }
        }
    }
}

async fn collect_source_candidates(page: &Page, base_url: &Url, dom: &mut DomSink<'_>) {
    let Some(entries) = eval_vec::<SourceAttrs>(page, SOURCE_ATTRS_JS).await else {
        return;
    };
    for attrs in &entries {
        if let Some(best) = extract::parse_srcset_largest(&attrs.srcset) {
            if let Some(resolved) = extract::resolve_against(base_url, &best) {
                dom.admit(resolved);
            }
        }
        if !attrs.src.is_empty() {
            if let Some(resolved) = extract::resolve_against(base_url, &attrs.src) {
                dom.admit(resolved);
            }
        }
    }
}

async fn collect_preload_candidates(page: &Page, base_url: &Url, dom: &mut DomSink<'_>) {
    let Some(hrefs) = eval_vec::<String>(page, PRELOAD_HREFS_JS).await else {
        return;
    };
    for href in &hrefs {
        if let Some(resolved) = extract::resolve_against(base_url, href) {
            dom.admit(resolved);
        }
    }
}

/// Well-known global state containers are already absolute URLs; they skip
/// base resolution but still go through the admission filter.
async fn collect_global_state_candidates(page: &Page, dom: &mut DomSink<'_>) {
    let Some(urls) = eval_vec::<String>(page, GLOBAL_STATE_JS).await else {
        return;
    };
    for url in urls {
        dom.admit(url);
    }
}

fn browser_config(request: &HarvestRequest) -> Result<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .window_size(1280, 800)
        .args(vec!["--no-first-run", "--no-default-browser-check"]);
    if request.debug_browser {
        builder = builder.with_head();
    }
    if request.use_login_profile {
        std::fs::create_dir_all(&request.profile_dir)?;
        builder = builder.user_data_dir(&request.profile_dir);
    }
    builder.build().map_err(EngineError::BrowserLaunch)
}
