use crate::{EngineError, Result};
use regex::Regex;
use serde_json::Value;
use url::Url;

pub const IMAGE_EXTS: &[&str] = &[
    ".jpg", ".jpeg", ".png", ".gif", ".webp", ".bmp", ".tif", ".tiff", ".avif",
];

pub const VIDEO_EXTS: &[&str] = &[".mp4", ".webm", ".mov", ".m4v"];

pub const DEFAULT_BLACKLIST: &[&str] = &[
    "avatar",
    "noavatar",
    "logo",
    "sprite",
    "icon",
    "favicon",
    "emoji",
    "emoticon",
    "blank",
    "spacer",
    "loading",
    "placeholder",
    "banner",
    "tracking",
    "pixel",
];

/// Picks the entry with the largest `w` width descriptor; entries without a
/// width descriptor only win when no widthed entry exists. First seen wins
/// ties.
pub fn parse_srcset_largest(srcset: &str) -> Option<String> {
    let mut best_url: Option<&str> = None;
    let mut best_width = -1_i64;
    for chunk in srcset.split(',') {
        let part = chunk.trim();
        if part.is_empty() {
            continue;
        }
        let mut segments = part.split_whitespace();
        let Some(candidate) = segments.next() else {
            continue;
        };
        let width = segments
            .next()
            .and_then(|descriptor| descriptor.strip_suffix('w'))
            .and_then(|digits| digits.parse::<i64>().ok());
        match width {
            Some(width) if width > best_width => {
                best_width = width;
                best_url = Some(candidate);
            }
            _ => {
                if best_url.is_none() {
                    best_url = Some(candidate);
                }
            }
        }
    }
    best_url.map(str::to_string)
}

/// Extracts every `url(...)` reference from inline CSS text, stripping
/// optional quotes. `data:` URIs are excluded.
pub fn extract_background_urls(style_text: &str) -> Vec<String> {
    if style_text.is_empty() {
        return Vec::new();
    }
    let re = Regex::new(r"(?i)url\(\s*([^)]*?)\s*\)").expect("background url regex");
    let mut out = Vec::new();
    for caps in re.captures_iter(style_text) {
        let mut raw = caps[1].trim();
        if raw.len() >= 2
            && ((raw.starts_with('"') && raw.ends_with('"'))
                || (raw.starts_with('\'') && raw.ends_with('\'')))
        {
            raw = &raw[1..raw.len() - 1];
        }
        let raw = raw.trim();
        if !raw.is_empty() && !raw.to_ascii_lowercase().starts_with("data:") {
            out.push(raw.to_string());
        }
    }
    out
}

/// Lazily walks an arbitrarily nested JSON value, yielding every string leaf
/// in key/element order. Uses an explicit stack so nesting depth is
/// unbounded.
pub fn string_leaves(value: &Value) -> StringLeaves<'_> {
    StringLeaves { stack: vec![value] }
}

pub struct StringLeaves<'a> {
    stack: Vec<&'a Value>,
}

impl<'a> Iterator for StringLeaves<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        while let Some(value) = self.stack.pop() {
            match value {
                Value::String(text) => return Some(text),
                Value::Array(items) => self.stack.extend(items.iter().rev()),
                Value::Object(map) => {
                    let first_child = self.stack.len();
                    self.stack.extend(map.values());
                    self.stack[first_child..].reverse();
                }
                _ => {}
            }
        }
        None
    }
}

fn path_has_suffix(url: &str, exts: &[&str]) -> bool {
    let trimmed = url
        .split('?')
        .next()
        .unwrap_or("")
        .split('#')
        .next()
        .unwrap_or("");
    let lower = trimmed.to_ascii_lowercase();
    exts.iter().any(|ext| lower.ends_with(ext))
}

pub fn looks_like_image_url(url: &str) -> bool {
    path_has_suffix(url, IMAGE_EXTS)
}

pub fn looks_like_video_url(url: &str) -> bool {
    path_has_suffix(url, VIDEO_EXTS)
}

fn content_type_base(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

pub fn is_image_content_type(content_type: &str) -> bool {
    content_type_base(content_type).starts_with("image/")
}

pub fn is_video_content_type(content_type: &str) -> bool {
    content_type_base(content_type).starts_with("video/")
}

pub fn is_blacklisted(url: &str, keywords: &[String]) -> bool {
    let lower = url.to_ascii_lowercase();
    keywords.iter().any(|keyword| lower.contains(keyword.as_str()))
}

pub fn normalize_keywords(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in values {
        for part in raw.split(|ch| matches!(ch, '\n' | '\r' | '\t' | ',' | ';' | ' ')) {
            let trimmed = part.trim().to_ascii_lowercase();
            if trimmed.is_empty() {
                continue;
            }
            if !out.iter().any(|existing| existing == &trimmed) {
                out.push(trimmed);
            }
        }
    }
    out
}

pub fn normalize_http_url(value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::InvalidUrl("empty URL provided".to_string()));
    }
    let parsed =
        Url::parse(trimmed).map_err(|_| EngineError::InvalidUrl("invalid URL format".to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(EngineError::InvalidUrl(format!(
                "unsupported scheme for {}; only http/https are allowed",
                redact_url(trimmed)
            )));
        }
    }
    if parsed.host_str().is_none() {
        return Err(EngineError::InvalidUrl(format!(
            "URL is missing host: {}",
            redact_url(trimmed)
        )));
    }
    Ok(trimmed.to_string())
}

/// Resolves a raw attribute value against a base URL. Returns `None` for
/// non-navigable values (javascript:, mailto:, tel:, data:, bare fragments)
/// and for anything that does not resolve to http(s).
pub fn resolve_against(base_url: &Url, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let lower = raw.to_ascii_lowercase();
    if lower.starts_with("javascript:")
        || lower.starts_with("mailto:")
        || lower.starts_with("tel:")
        || lower.starts_with("data:")
        || lower.starts_with('#')
    {
        return None;
    }

    let mut joined = base_url.join(raw).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    joined.set_fragment(None);
    Some(joined.to_string())
}

pub fn redact_url(value: &str) -> String {
    match Url::parse(value) {
        Ok(parsed) => {
            let scheme = parsed.scheme();
            let authority = parsed.host_str().unwrap_or("unknown-host");
            format!("{scheme}://{authority}/...")
        }
        Err(_) => "[invalid-url]".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn srcset_picks_numerically_largest_width() {
        let best = parse_srcset_largest("a.jpg 100w, b.jpg 400w, c.jpg 200w");
        assert_eq!(best.as_deref(), Some("b.jpg"));
    }

    #[test]
    fn srcset_order_does_not_matter() {
        let best = parse_srcset_largest("b.jpg 400w, c.jpg 200w, a.jpg 100w");
        assert_eq!(best.as_deref(), Some("b.jpg"));
    }

    #[test]
    fn srcset_without_width_descriptors_falls_back_to_first() {
        let best = parse_srcset_largest("a.jpg 1x, b.jpg 2x");
        assert_eq!(best.as_deref(), Some("a.jpg"));
    }

    #[test]
    fn srcset_widthed_entry_beats_earlier_unwidthed_one() {
        let best = parse_srcset_largest("a.jpg, b.jpg 320w");
        assert_eq!(best.as_deref(), Some("b.jpg"));
    }

    #[test]
    fn srcset_empty_input_yields_none() {
        assert_eq!(parse_srcset_largest(""), None);
        assert_eq!(parse_srcset_largest("  ,  "), None);
    }

    #[test]
    fn background_urls_strip_quotes_and_keep_order() {
        let urls = extract_background_urls(
            "background: url(\"x.png\"); background-image:url('y.jpg')",
        );
        assert_eq!(urls, vec!["x.png".to_string(), "y.jpg".to_string()]);
    }

    #[test]
    fn background_urls_exclude_data_uris() {
        let urls = extract_background_urls(
            "background: url(data:image/png;base64,AAAA); background: URL(real.webp)",
        );
        assert_eq!(urls, vec!["real.webp".to_string()]);
    }

    #[test]
    fn string_leaves_walks_nested_values_in_order() {
        let value = json!({
            "a": ["x", {"inner": "y"}],
            "b": "z",
            "c": 7,
            "d": null
        });
        let leaves: Vec<&str> = string_leaves(&value).collect();
        assert_eq!(leaves, vec!["x", "y", "z"]);
    }

    #[test]
    fn string_leaves_handles_deep_nesting() {
        let mut value = json!("leaf");
        for _ in 0..500 {
            value = json!([value]);
        }
        let leaves: Vec<&str> = string_leaves(&value).collect();
        assert_eq!(leaves, vec!["leaf"]);
    }

    #[test]
    fn url_classification_ignores_query_and_fragment() {
        assert!(looks_like_image_url("https://x.test/a.JPG?w=100#frag"));
        assert!(looks_like_video_url("https://x.test/clip.mp4?t=3"));
        assert!(!looks_like_image_url("https://x.test/page?img=a.jpg"));
        assert!(!looks_like_video_url("https://x.test/a.jpg"));
    }

    #[test]
    fn content_type_checks_strip_parameters() {
        assert!(is_image_content_type("image/jpeg; charset=binary"));
        assert!(is_image_content_type(" IMAGE/PNG "));
        assert!(is_video_content_type("video/mp4;codecs=avc1"));
        assert!(!is_image_content_type("text/html"));
        assert!(!is_video_content_type(""));
    }

    #[test]
    fn blacklist_matches_case_insensitive_substrings() {
        let blacklist = vec!["avatar".to_string(), "pixel".to_string()];
        assert!(is_blacklisted("https://cdn.test/AVATARS/u1.jpg", &blacklist));
        assert!(is_blacklisted("https://t.test/track/pixel.gif", &blacklist));
        assert!(!is_blacklisted("https://cdn.test/photo.jpg", &blacklist));
    }

    #[test]
    fn normalize_keywords_splits_trims_and_dedupes() {
        let out = normalize_keywords(&[
            "Avatar, logo".to_string(),
            " avatar ".to_string(),
            "pixel;banner".to_string(),
        ]);
        assert_eq!(out, vec!["avatar", "logo", "pixel", "banner"]);
    }

    #[test]
    fn normalize_http_url_allows_http_https_only() {
        assert!(normalize_http_url("https://example.com/gallery").is_ok());
        assert!(normalize_http_url("http://example.com").is_ok());
        assert!(normalize_http_url("ftp://example.com").is_err());
        assert!(normalize_http_url("").is_err());
        assert!(normalize_http_url("not a url").is_err());
    }

    #[test]
    fn resolve_against_joins_and_filters_schemes() {
        let base = Url::parse("https://example.com/a/page.html").expect("base url");
        assert_eq!(
            resolve_against(&base, "../img/pic.jpg").as_deref(),
            Some("https://example.com/img/pic.jpg")
        );
        assert_eq!(
            resolve_against(&base, "https://other.test/x.png#top").as_deref(),
            Some("https://other.test/x.png")
        );
        assert_eq!(resolve_against(&base, "javascript:void(0)"), None);
        assert_eq!(resolve_against(&base, "data:image/png;base64,AA"), None);
        assert_eq!(resolve_against(&base, "#section"), None);
        assert_eq!(resolve_against(&base, ""), None);
    }

    #[test]
    fn redact_url_keeps_scheme_and_host_only() {
        assert_eq!(
            redact_url("https://example.com/secret/path?token=abc"),
            "https://example.com/..."
        );
        assert_eq!(redact_url("garbage"), "[invalid-url]");
    }
}
