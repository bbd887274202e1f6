//! Range Streaming Engine (C5).
//!
//! Serves media bytes with single-range HTTP semantics and an optional
//! on-demand H.264 transcode. VR-UA requests are also handed to the DeoVR
//! heartbeat inferrer (C6) before the bytes are streamed.

use std::path::Path;
use std::process::Stdio;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::catalog::MediaItem;
use crate::error::{MediaViewerError, MediaViewerResult};

const CONTENT_TYPE_MAP: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("mkv", "video/x-matroska"),
    ("webm", "video/webm"),
    ("avi", "video/x-msvideo"),
    ("m4v", "video/x-m4v"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("bmp", "image/bmp"),
];

fn content_type_for(ext: &str, path: &Path) -> String {
    let lower = ext.to_ascii_lowercase();
    if let Some((_, mime)) = CONTENT_TYPE_MAP.iter().find(|(e, _)| *e == lower) {
        return (*mime).to_string();
    }
    mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

struct ByteRange {
    start: u64,
    end: u64,
}

/// Parses a single `bytes=start-end?` Range header value. Returns `Err`
/// (caller replies 416) for malformed or multi-range headers, or a range
/// clamped to `[0, size-1]` that starts beyond `size`.
fn parse_range(value: &str, size: u64) -> Result<Option<ByteRange>, ()> {
    let Some(spec) = value.strip_prefix("bytes=") else {
        return Err(());
    };
    if spec.contains(',') {
        return Err(());
    }
    let (start_str, end_str) = spec.split_once('-').ok_or(())?;

    if start_str.is_empty() {
        // suffix-length form `bytes=-N` is not part of this protocol.
        return Err(());
    }

    let start: u64 = start_str.parse().map_err(|_| ())?;
    let end: u64 = if end_str.is_empty() {
        size.saturating_sub(1)
    } else {
        end_str.parse().map_err(|_| ())?
    };

    if start >= size || start > end {
        return Err(());
    }

    Ok(Some(ByteRange {
        start,
        end: end.min(size.saturating_sub(1)),
    }))
}

/// `GET /media/{id}/stream` handler body, shared with the HEAD path by the
/// caller passing `is_head`.
pub async fn serve_range(
    item: &MediaItem,
    absolute_path: &Path,
    ffmpeg_path: &Path,
    headers: &HeaderMap,
    is_head: bool,
    transcode: bool,
) -> MediaViewerResult<Response> {
    if transcode && item.media_type == crate::catalog::MediaType::Video {
        return Ok(serve_transcode(ffmpeg_path, absolute_path));
    }

    let metadata = tokio::fs::metadata(absolute_path).await.map_err(|_| {
        MediaViewerError::NotFound(format!("media file vanished: {}", item.rel_path))
    })?;
    let size = metadata.len();
    let content_type = content_type_for(&item.ext, absolute_path);

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());

    let mut response = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, "inline")
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-store");

    let Some(range_value) = range_header else {
        response = response
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size.to_string());
        let body = if is_head {
            Body::empty()
        } else {
            read_body(absolute_path, 0, size).await?
        };
        return Ok(response.body(body).unwrap());
    };

    match parse_range(range_value, size) {
        Ok(Some(range)) => {
            let len = range.end - range.start + 1;
            response = response
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, size),
                )
                .header(header::CONTENT_LENGTH, len.to_string());
            let body = if is_head {
                Body::empty()
            } else {
                read_body(absolute_path, range.start, len).await?
            };
            Ok(response.body(body).unwrap())
        }
        _ => {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&format!("bytes */{size}")).unwrap(),
            );
            Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers, Body::empty()).into_response())
        }
    }
}

async fn read_body(path: &Path, start: u64, len: u64) -> MediaViewerResult<Body> {
    use tokio::io::AsyncSeekExt;

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| MediaViewerError::Internal(format!("open failed: {e}")))?;
    if start > 0 {
        file.seek(std::io::SeekFrom::Start(start))
            .await
            .map_err(|e| MediaViewerError::Internal(format!("seek failed: {e}")))?;
    }
    let limited = file.take(len);
    Ok(Body::from_stream(ReaderStream::new(limited)))
}

/// Spawns `ffmpeg` and streams its stdout as the response body. The child
/// is killed when the guard wrapping its stdout stream is dropped
/// (response closed early, e.g. client disconnect).
fn serve_transcode(ffmpeg_path: &Path, absolute_path: &Path) -> Response {
    let mut child = match tokio::process::Command::new(ffmpeg_path)
        .arg("-i")
        .arg(absolute_path)
        .args([
            "-c:v", "libx264", "-preset", "veryfast", "-crf", "23", "-pix_fmt", "yuv420p",
            "-c:a", "aac", "-b:a", "160k", "-movflags",
            "frag_keyframe+empty_moov+default_base_moof", "-f", "mp4", "pipe:1",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            log::warn!("[stream] ffmpeg spawn failed: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "transcode unavailable").into_response();
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
        });
    }

    let stream = ReaderStream::new(stdout).chain_drop_guard(TranscodeGuard { child });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .body(Body::from_stream(stream))
        .unwrap()
}

struct TranscodeGuard {
    child: tokio::process::Child,
}

impl Drop for TranscodeGuard {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Wraps a streaming response's body so `on_data` fires for every chunk
/// written to the client and `on_close` fires once, when the body stream
/// is fully drained or the response is dropped early (client disconnect).
/// Used to give the DeoVR heartbeat inferrer (C6) real progress/cleanup
/// signals instead of firing both on request arrival.
pub fn instrument_stream_response<F, C>(response: Response, mut on_data: F, on_close: C) -> Response
where
    F: FnMut() + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    struct CloseGuard<C: FnOnce()> {
        f: Option<C>,
    }

    impl<C: FnOnce()> Drop for CloseGuard<C> {
        fn drop(&mut self) {
            if let Some(f) = self.f.take() {
                f();
            }
        }
    }

    let (parts, body) = response.into_parts();
    let stream = body.into_data_stream();
    let instrumented = futures::StreamExt::map(stream, move |item| {
        if item.is_ok() {
            on_data();
        }
        item
    });
    let guarded = instrumented.chain_drop_guard(CloseGuard { f: Some(on_close) });
    Response::from_parts(parts, Body::from_stream(guarded))
}

/// Wraps a byte stream with a value that is dropped alongside it, without
/// otherwise touching polling behavior.
struct WithDropGuard<S, G> {
    inner: S,
    _guard: G,
}

trait ChainDropGuard: Sized {
    fn chain_drop_guard<G>(self, guard: G) -> WithDropGuard<Self, G>;
}

impl<S> ChainDropGuard for S {
    fn chain_drop_guard<G>(self, guard: G) -> WithDropGuard<Self, G> {
        WithDropGuard {
            inner: self,
            _guard: guard,
        }
    }
}

impl<S: futures::Stream + Unpin, G> futures::Stream for WithDropGuard<S, G> {
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_clamps_open_end() {
        let range = parse_range("bytes=10-", 100).unwrap().unwrap();
        assert_eq!(range.start, 10);
        assert_eq!(range.end, 99);
    }

    #[test]
    fn parse_range_full_file() {
        let range = parse_range("bytes=0-99", 100).unwrap().unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.end, 99);
    }

    #[test]
    fn parse_range_rejects_out_of_bounds_start() {
        assert!(parse_range("bytes=100-100", 100).is_err());
    }

    #[test]
    fn parse_range_rejects_multi_range() {
        assert!(parse_range("bytes=0-10,20-30", 100).is_err());
    }

    #[test]
    fn content_type_falls_back_to_mime_guess_for_unmapped_ext() {
        let path = Path::new("clip.mp3");
        let ct = content_type_for("mp3", path);
        assert!(ct.starts_with("audio/"));
    }
}
