use crate::extract::{looks_like_image_url, looks_like_video_url};
use url::Url;

pub const SCROLL_WAIT_MS_DEFAULT: u64 = 1500;
pub const MAX_SCROLL_ROUNDS_DEFAULT: usize = 50;
pub const STABLE_ROUNDS_TO_STOP_DEFAULT: usize = 3;

/// Per-site scroll/stop tuning plus the keyword allowlist used to decide
/// which JSON network responses are worth deep-scanning.
#[derive(Debug, Clone)]
pub struct SitePreset {
    pub name: &'static str,
    pub scroll_wait_ms: u64,
    pub max_scroll_rounds: usize,
    pub stable_rounds_to_stop: usize,
    pub parse_network_json: bool,
    pub network_url_keywords: &'static [&'static str],
}

impl SitePreset {
    fn generic() -> Self {
        Self {
            name: "generic",
            scroll_wait_ms: SCROLL_WAIT_MS_DEFAULT,
            max_scroll_rounds: MAX_SCROLL_ROUNDS_DEFAULT,
            stable_rounds_to_stop: STABLE_ROUNDS_TO_STOP_DEFAULT,
            parse_network_json: true,
            network_url_keywords: &[],
        }
    }
}

pub fn resolve_preset(start_url: &str) -> SitePreset {
    let host = Url::parse(start_url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|h| h.to_ascii_lowercase()))
        .unwrap_or_default();
    preset_for_host(&host)
}

pub fn preset_for_host(host: &str) -> SitePreset {
    if host.contains("instagram.com") {
        SitePreset {
            name: "instagram",
            scroll_wait_ms: 1800,
            max_scroll_rounds: 80,
            stable_rounds_to_stop: 4,
            parse_network_json: true,
            network_url_keywords: &["graphql", "api", "query", "feed", "reels", "media"],
        }
    } else if host.contains("x.com") || host.contains("twitter.com") {
        SitePreset {
            name: "x",
            scroll_wait_ms: 1700,
            max_scroll_rounds: 90,
            stable_rounds_to_stop: 4,
            parse_network_json: true,
            network_url_keywords: &[
                "graphql",
                "api",
                "timeline",
                "tweet",
                "search",
                "user",
                "hometimeline",
            ],
        }
    } else if host.contains("facebook.com") || host.contains("fb.com") {
        SitePreset {
            name: "facebook",
            scroll_wait_ms: 1900,
            max_scroll_rounds: 80,
            stable_rounds_to_stop: 4,
            parse_network_json: true,
            network_url_keywords: &["graphql", "api", "photo", "video", "stories"],
        }
    } else {
        SitePreset::generic()
    }
}

/// Decides whether a network response is a candidate source: direct media
/// URLs always are; JSON/script payloads only when the preset's keyword
/// allowlist matches (an empty allowlist accepts everything); ultra mode
/// additionally takes anything that smells like an API call.
pub fn should_scan_network_response(
    resp_url: &str,
    content_type: &str,
    preset: &SitePreset,
    ultra: bool,
) -> bool {
    let url = resp_url.to_ascii_lowercase();
    let ct = content_type.to_ascii_lowercase();
    if looks_like_image_url(&url) || looks_like_video_url(&url) {
        return true;
    }
    if ultra && (url.contains("graphql") || url.contains("api")) {
        return true;
    }
    if ct.contains("application/json")
        || ct.contains("text/javascript")
        || ct.contains("application/x-javascript")
    {
        if !preset.parse_network_json {
            return false;
        }
        if preset.network_url_keywords.is_empty() {
            return true;
        }
        return preset
            .network_url_keywords
            .iter()
            .any(|keyword| url.contains(keyword));
    }
    url.contains("graphql")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_hosts_get_the_generic_preset() {
        let preset = resolve_preset("https://forum.example.org/thread/12");
        assert_eq!(preset.name, "generic");
        assert_eq!(preset.scroll_wait_ms, SCROLL_WAIT_MS_DEFAULT);
        assert_eq!(preset.max_scroll_rounds, MAX_SCROLL_ROUNDS_DEFAULT);
        assert!(preset.parse_network_json);
        assert!(preset.network_url_keywords.is_empty());
    }

    #[test]
    fn known_hosts_override_tuning_and_keywords() {
        let preset = resolve_preset("https://www.instagram.com/someone/");
        assert_eq!(preset.name, "instagram");
        assert_eq!(preset.scroll_wait_ms, 1800);
        assert_eq!(preset.max_scroll_rounds, 80);
        assert_eq!(preset.stable_rounds_to_stop, 4);
        assert!(preset.network_url_keywords.contains(&"graphql"));

        assert_eq!(resolve_preset("https://x.com/u/status/1").name, "x");
        assert_eq!(resolve_preset("https://twitter.com/u").name, "x");
        assert_eq!(resolve_preset("https://www.facebook.com/page").name, "facebook");
    }

    #[test]
    fn unparseable_url_still_resolves_to_generic() {
        assert_eq!(resolve_preset("not-a-url").name, "generic");
    }

    #[test]
    fn direct_media_urls_are_always_scanned() {
        let preset = preset_for_host("example.com");
        assert!(should_scan_network_response(
            "https://cdn.example.com/full.jpg",
            "",
            &preset,
            false
        ));
        assert!(should_scan_network_response(
            "https://cdn.example.com/clip.mp4",
            "text/plain",
            &preset,
            false
        ));
    }

    #[test]
    fn json_responses_need_a_keyword_match_when_allowlisted() {
        let preset = preset_for_host("x.com");
        assert!(should_scan_network_response(
            "https://x.com/i/api/graphql/Timeline",
            "application/json",
            &preset,
            false
        ));
        assert!(should_scan_network_response(
            "https://x.com/i/api/HomeTimeline",
            "application/json",
            &preset,
            false
        ));
        assert!(!should_scan_network_response(
            "https://x.com/i/settings.json",
            "application/json",
            &preset,
            false
        ));
    }

    #[test]
    fn empty_allowlist_accepts_all_json_responses() {
        let preset = preset_for_host("example.com");
        assert!(should_scan_network_response(
            "https://example.com/any/endpoint",
            "application/json; charset=utf-8",
            &preset,
            false
        ));
    }

    #[test]
    fn ultra_mode_loosens_acceptance_to_api_like_urls() {
        let preset = preset_for_host("example.com");
        assert!(should_scan_network_response(
            "https://example.com/api/v2/wall",
            "text/html",
            &preset,
            true
        ));
        assert!(!should_scan_network_response(
            "https://example.com/api/v2/wall",
            "text/html",
            &preset,
            false
        ));
    }

    #[test]
    fn graphql_urls_are_scanned_even_without_json_content_type() {
        let preset = preset_for_host("example.com");
        assert!(should_scan_network_response(
            "https://example.com/graphql?op=Feed",
            "text/html",
            &preset,
            false
        ));
        assert!(!should_scan_network_response(
            "https://example.com/static/app.css",
            "text/css",
            &preset,
            false
        ));
    }
}
