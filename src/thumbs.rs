use crate::extract::{self, is_video_content_type, looks_like_video_url};
use crate::jobs::{self, CancelFlag, MediaItem, MediaKind};
use crate::verify::VerifiedCandidate;
use crate::{EngineError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader, Rgb, RgbImage};
use std::collections::VecDeque;
use std::io::{BufWriter, Cursor, Read};
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

const THUMB_WORKERS: usize = 12;
pub const THUMB_SIZE: u32 = 800;
const MAX_THUMB_BYTES: u64 = 25 * 1024 * 1024;
const GET_TIMEOUT_SECS: u64 = 25;
const JPEG_QUALITY: u8 = 85;
const PROGRESS_EVERY: usize = 3;

const CANVAS_BG: Rgb<u8> = Rgb([30, 30, 30]);
const BORDER_GREY: Rgb<u8> = Rgb([90, 90, 90]);
const LABEL_GREY: Rgb<u8> = Rgb([220, 220, 220]);

/// Renders thumbnails for verified candidates on a bounded worker pool and
/// builds the final `MediaItem` list. Every candidate yields exactly one
/// item — real thumbnail or placeholder — then images below the minimum
/// dimensions are dropped from the result (their thumbnail files stay on
/// disk). Only filesystem failures are fatal here.
pub fn build_thumbnails<F>(
    verified: Vec<VerifiedCandidate>,
    thumbs_dir: &Path,
    min_width: u32,
    min_height: u32,
    cancel: &Arc<CancelFlag>,
    mut on_progress: F,
) -> Result<Vec<MediaItem>>
where
    F: FnMut(usize, usize),
{
    if verified.is_empty() {
        return Ok(Vec::new());
    }
    std::fs::create_dir_all(thumbs_dir)?;

    let total = verified.len();
    let queue: Arc<Mutex<VecDeque<VerifiedCandidate>>> =
        Arc::new(Mutex::new(verified.into_iter().collect()));
    let (tx, rx) = mpsc::channel::<Result<MediaItem>>();
    let worker_count = THUMB_WORKERS.min(total);
    for _ in 0..worker_count {
        let queue = Arc::clone(&queue);
        let tx = tx.clone();
        let cancel = Arc::clone(cancel);
        let thumbs_dir = thumbs_dir.to_path_buf();
        thread::spawn(move || {
            let agent = jobs::build_http_agent(GET_TIMEOUT_SECS);
            loop {
                if cancel.is_set() {
                    break;
                }
                let next = match queue.lock() {
                    Ok(mut queue) => queue.pop_front(),
                    Err(_) => None,
                };
                let Some(candidate) = next else {
                    break;
                };
                let item = thumb_one(&agent, &candidate, &thumbs_dir);
                if tx.send(item).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut kept = Vec::new();
    let mut done = 0_usize;
    for item in rx {
        if cancel.is_set() {
            return Err(EngineError::Canceled);
        }
        done += 1;
        if done % PROGRESS_EVERY == 0 || done == total {
            on_progress(done, total);
        }
        let item = item?;
        if item.kind == MediaKind::Image
            && item.width > 0
            && item.height > 0
            && (item.width < min_width || item.height < min_height)
        {
            continue;
        }
        kept.push(item);
    }
    if cancel.is_set() {
        return Err(EngineError::Canceled);
    }
    Ok(kept)
}

/// One candidate, one item. Videos and oversize images never hit the
/// network for bytes; fetch/decode trouble downgrades to a placeholder.
fn thumb_one(agent: &ureq::Agent, candidate: &VerifiedCandidate, thumbs_dir: &Path) -> Result<MediaItem> {
    let kind = if is_video_content_type(&candidate.content_type)
        || looks_like_video_url(&candidate.url)
    {
        MediaKind::Video
    } else {
        MediaKind::Image
    };
    let item_id = jobs::hash8(&candidate.url);
    let thumb_path = thumbs_dir.join(format!("{item_id}.jpg"));

    let item = |width: u32, height: u32, format: String| MediaItem {
        id: item_id.clone(),
        url: candidate.url.clone(),
        kind,
        content_type: candidate.content_type.clone(),
        width,
        height,
        format,
        size_bytes: candidate.size_bytes,
        thumb_path: thumb_path.to_string_lossy().into_owned(),
    };

    if kind == MediaKind::Video {
        save_thumb(&placeholder_thumb(PlaceholderLabel::Video), &thumb_path)?;
        return Ok(item(0, 0, "VIDEO".to_string()));
    }

    if candidate
        .size_bytes
        .is_some_and(|size| size > MAX_THUMB_BYTES)
    {
        save_thumb(&placeholder_thumb(PlaceholderLabel::Error), &thumb_path)?;
        return Ok(item(0, 0, "BIG".to_string()));
    }

    match fetch_and_render(agent, &candidate.url, &thumb_path) {
        Ok(bytes) => {
            let (width, height, format) =
                probe_image_dimensions(&bytes).unwrap_or((0, 0, String::new()));
            Ok(item(width, height, format))
        }
        Err(_) => {
            save_thumb(&placeholder_thumb(PlaceholderLabel::Error), &thumb_path)?;
            Ok(item(0, 0, "ERR".to_string()))
        }
    }
}

/// Fetches the full image bytes, renders and persists the thumbnail, and
/// hands the original bytes back for the independent dimension probe.
fn fetch_and_render(agent: &ureq::Agent, url: &str, thumb_path: &Path) -> Result<Vec<u8>> {
    let mut response = agent
        .get(url)
        .call()
        .map_err(|err| EngineError::Download(err.to_string()))?;
    let status = response.status().as_u16();
    if status >= 400 {
        return Err(EngineError::Download(format!(
            "http {status} for {}",
            extract::redact_url(url)
        )));
    }
    let mut bytes = Vec::new();
    response.body_mut().as_reader().read_to_end(&mut bytes)?;
    let thumb = image_thumb_from_bytes(&bytes)?;
    save_thumb(&thumb, thumb_path)?;
    Ok(bytes)
}

/// Decodes, downscales to fit the square bound and flattens transparency
/// onto the dark canvas color.
pub(crate) fn image_thumb_from_bytes(bytes: &[u8]) -> Result<RgbImage> {
    let decoded = image::load_from_memory(bytes)?;
    // Downscale only; images already inside the bound keep their size.
    let scaled = if decoded.width() > THUMB_SIZE || decoded.height() > THUMB_SIZE {
        decoded.thumbnail(THUMB_SIZE, THUMB_SIZE)
    } else {
        decoded
    };
    Ok(flatten_onto_canvas(&scaled))
}

fn flatten_onto_canvas(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    let mut out = RgbImage::from_pixel(rgba.width(), rgba.height(), CANVAS_BG);
    for (x, y, pixel) in rgba.enumerate_pixels() {
        let alpha = u32::from(pixel[3]);
        let blend = |fg: u8, bg: u8| -> u8 {
            ((u32::from(fg) * alpha + u32::from(bg) * (255 - alpha)) / 255) as u8
        };
        out.put_pixel(
            x,
            y,
            Rgb([
                blend(pixel[0], CANVAS_BG[0]),
                blend(pixel[1], CANVAS_BG[1]),
                blend(pixel[2], CANVAS_BG[2]),
            ]),
        );
    }
    out
}

pub(crate) fn save_thumb(img: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut writer = BufWriter::new(file);
    let mut encoder = JpegEncoder::new_with_quality(&mut writer, JPEG_QUALITY);
    encoder.encode_image(img)?;
    Ok(())
}

/// Header-level probe of raw image bytes: guessed format plus dimensions,
/// without a full decode. Returns `None` for anything that is not a
/// parseable image, which is exactly what the verifier's decode gate needs.
pub(crate) fn probe_image_dimensions(bytes: &[u8]) -> Option<(u32, u32, String)> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?;
    let format = reader.format()?;
    let (width, height) = reader.into_dimensions().ok()?;
    Some((width, height, format_tag(format)))
}

fn format_tag(format: image::ImageFormat) -> String {
    format!("{format:?}").to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy)]
enum PlaceholderLabel {
    Video,
    Error,
}

impl PlaceholderLabel {
    fn text(self) -> &'static str {
        match self {
            PlaceholderLabel::Video => "VIDEO",
            PlaceholderLabel::Error => "ERR",
        }
    }
}

fn placeholder_thumb(label: PlaceholderLabel) -> RgbImage {
    let mut img = RgbImage::from_pixel(THUMB_SIZE, THUMB_SIZE, CANVAS_BG);
    draw_border(&mut img, 10, 2, BORDER_GREY);
    draw_label(&mut img, label.text(), LABEL_GREY);
    img
}

fn draw_border(img: &mut RgbImage, inset: u32, thickness: u32, color: Rgb<u8>) {
    let (width, height) = img.dimensions();
    if width <= 2 * (inset + thickness) || height <= 2 * (inset + thickness) {
        return;
    }
    for t in 0..thickness {
        let left = inset + t;
        let right = width - 1 - inset - t;
        let top = inset + t;
        let bottom = height - 1 - inset - t;
        for x in left..=right {
            img.put_pixel(x, top, color);
            img.put_pixel(x, bottom, color);
        }
        for y in top..=bottom {
            img.put_pixel(left, y, color);
            img.put_pixel(right, y, color);
        }
    }
}

const GLYPH_SCALE: u32 = 4;
const GLYPH_COLS: u32 = 5;
const GLYPH_ROWS: u32 = 7;

// 5x7 bitmap glyphs, one row per byte, most significant of the low five
// bits is the leftmost column. Only the characters the placeholder labels
// need are defined.
fn glyph_rows(ch: char) -> [u8; 7] {
    match ch {
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        _ => [0; 7],
    }
}

fn draw_label(img: &mut RgbImage, text: &str, color: Rgb<u8>) {
    let advance = (GLYPH_COLS + 1) * GLYPH_SCALE;
    let label_width = advance * text.chars().count() as u32;
    let label_height = GLYPH_ROWS * GLYPH_SCALE;
    let (width, height) = img.dimensions();
    if label_width > width || label_height > height {
        return;
    }
    let mut origin_x = (width - label_width) / 2;
    let origin_y = (height - label_height) / 2;
    for ch in text.chars() {
        let rows = glyph_rows(ch);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_COLS {
                if bits & (0b10000 >> col) == 0 {
                    continue;
                }
                for dy in 0..GLYPH_SCALE {
                    for dx in 0..GLYPH_SCALE {
                        img.put_pixel(
                            origin_x + col * GLYPH_SCALE + dx,
                            origin_y + row as u32 * GLYPH_SCALE + dy,
                            color,
                        );
                    }
                }
            }
        }
        origin_x += advance;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .expect("encode png");
        buf.into_inner()
    }

    #[test]
    fn placeholder_is_a_full_size_dark_canvas() {
        let img = placeholder_thumb(PlaceholderLabel::Video);
        assert_eq!(img.dimensions(), (THUMB_SIZE, THUMB_SIZE));
        assert_eq!(img.get_pixel(0, 0), &CANVAS_BG);
        // Border pixel at the 10px inset.
        assert_eq!(img.get_pixel(10, 10), &BORDER_GREY);
        // The label leaves at least one lit pixel in the center band.
        let lit = img
            .enumerate_pixels()
            .any(|(_, _, pixel)| pixel == &LABEL_GREY);
        assert!(lit);
    }

    #[test]
    fn probe_reads_dimensions_and_format_without_full_decode() {
        let bytes = png_bytes(64, 48);
        let (width, height, format) = probe_image_dimensions(&bytes).expect("probe");
        assert_eq!((width, height), (64, 48));
        assert_eq!(format, "PNG");
    }

    #[test]
    fn probe_rejects_non_image_bytes() {
        assert!(probe_image_dimensions(b"<html><body>nope</body></html>").is_none());
        assert!(probe_image_dimensions(b"").is_none());
    }

    #[test]
    fn thumbnails_fit_the_square_bound_and_keep_aspect() {
        let bytes = png_bytes(1600, 400);
        let thumb = image_thumb_from_bytes(&bytes).expect("thumb");
        assert_eq!(thumb.dimensions(), (THUMB_SIZE, 200));
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let bytes = png_bytes(64, 48);
        let thumb = image_thumb_from_bytes(&bytes).expect("thumb");
        assert_eq!(thumb.dimensions(), (64, 48));
    }

    #[test]
    fn transparency_is_flattened_onto_the_dark_canvas() {
        let img = RgbaImage::from_pixel(10, 10, Rgba([255, 255, 255, 0]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .expect("encode png");
        let thumb = image_thumb_from_bytes(&buf.into_inner()).expect("thumb");
        assert_eq!(thumb.get_pixel(5, 5), &CANVAS_BG);
    }

    #[test]
    fn saved_thumbs_round_trip_as_jpeg() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("t.jpg");
        let img = placeholder_thumb(PlaceholderLabel::Error);
        save_thumb(&img, &path).expect("save");
        let bytes = std::fs::read(&path).expect("read back");
        let (width, height, format) = probe_image_dimensions(&bytes).expect("probe");
        assert_eq!((width, height), (THUMB_SIZE, THUMB_SIZE));
        assert_eq!(format, "JPEG");
    }

    #[test]
    fn video_candidates_get_a_placeholder_without_fetching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = jobs::build_http_agent(1);
        let candidate = VerifiedCandidate {
            url: "https://example.invalid/clip.mp4".to_string(),
            content_type: "video/mp4".to_string(),
            size_bytes: Some(9000),
        };
        let item = thumb_one(&agent, &candidate, dir.path()).expect("item");
        assert_eq!(item.kind, MediaKind::Video);
        assert_eq!(item.format, "VIDEO");
        assert_eq!((item.width, item.height), (0, 0));
        assert!(Path::new(&item.thumb_path).exists());
    }

    #[test]
    fn oversize_images_get_an_error_placeholder_without_fetching() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = jobs::build_http_agent(1);
        let candidate = VerifiedCandidate {
            url: "https://example.invalid/huge.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            size_bytes: Some(MAX_THUMB_BYTES + 1),
        };
        let item = thumb_one(&agent, &candidate, dir.path()).expect("item");
        assert_eq!(item.kind, MediaKind::Image);
        assert_eq!(item.format, "BIG");
        assert!(Path::new(&item.thumb_path).exists());
    }

    #[test]
    fn min_size_filter_drops_items_but_keeps_thumb_files() {
        use std::io::Write;
        use std::net::TcpListener;

        let small_png = png_bytes(10, 10);
        let large_png = png_bytes(100, 60);
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            for _ in 0..2 {
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
                let request = String::from_utf8_lossy(&head);
                let body = if request.contains("/small.png") {
                    &small_png
                } else {
                    &large_png
                };
                let mut response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                )
                .into_bytes();
                response.extend_from_slice(body);
                let _ = stream.write_all(&response);
            }
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let cancel = Arc::new(CancelFlag::default());
        let verified = vec![
            VerifiedCandidate {
                url: format!("http://{addr}/small.png"),
                content_type: "image/png".to_string(),
                size_bytes: None,
            },
            VerifiedCandidate {
                url: format!("http://{addr}/large.png"),
                content_type: "image/png".to_string(),
                size_bytes: None,
            },
        ];
        let thumb_files: Vec<_> = verified
            .iter()
            .map(|candidate| dir.path().join(format!("{}.jpg", jobs::hash8(&candidate.url))))
            .collect();

        let kept = build_thumbnails(verified, dir.path(), 50, 50, &cancel, |_done, _total| {})
            .expect("thumbnails");

        assert_eq!(kept.len(), 1);
        assert_eq!((kept[0].width, kept[0].height), (100, 60));
        assert_eq!(kept[0].format, "PNG");
        for path in thumb_files {
            assert!(path.exists(), "thumbnail missing: {}", path.display());
        }
    }

    #[test]
    fn item_id_is_the_url_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let agent = jobs::build_http_agent(1);
        let url = "https://example.invalid/clip.mp4";
        let candidate = VerifiedCandidate {
            url: url.to_string(),
            content_type: "video/mp4".to_string(),
            size_bytes: None,
        };
        let item = thumb_one(&agent, &candidate, dir.path()).expect("item");
        assert_eq!(item.id, jobs::hash8(url));
        assert!(item.thumb_path.ends_with(&format!("{}.jpg", item.id)));
    }
}
