//! Scanner & VR Classifier (C2).
//!
//! Walks the media root, probes video containers via `ffprobe`, classifies
//! VR layout, loads sidecar funscripts, and reconciles the catalog against
//! the filesystem. Exactly one scan runs at a time.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::{Mutex, Semaphore};

use crate::catalog::{MediaCatalog, MediaItem, MediaType, VrStereo};
use crate::error::{MediaViewerError, MediaViewerResult};

const VIDEO_EXTS: &[&str] = &["mp4", "mov", "mkv", "webm", "avi", "m4v"];
const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];
const CLEANUP_CONCURRENCY: usize = 32;
const PROGRESS_EVERY: u64 = 10;

/// Snapshot of the current/last scan, returned by `GET /scan/progress`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScanProgress {
    pub is_scanning: bool,
    pub scanned: u64,
    pub message: String,
}

/// Drives `rescan()` against a catalog and media root; tracks whether a
/// scan is currently in flight so a second request is rejected as busy.
pub struct Scanner {
    media_root: PathBuf,
    ffprobe_path: PathBuf,
    catalog: Arc<MediaCatalog>,
    running: AtomicBool,
    scanned: AtomicU64,
    progress_message: Mutex<String>,
}

impl Scanner {
    #[must_use]
    pub fn new(media_root: PathBuf, ffprobe_path: PathBuf, catalog: Arc<MediaCatalog>) -> Self {
        Self {
            media_root,
            ffprobe_path,
            catalog,
            running: AtomicBool::new(false),
            scanned: AtomicU64::new(0),
            progress_message: Mutex::new(String::new()),
        }
    }

    #[must_use]
    pub async fn progress(&self) -> ScanProgress {
        ScanProgress {
            is_scanning: self.running.load(Ordering::Acquire),
            scanned: self.scanned.load(Ordering::Acquire),
            message: self.progress_message.lock().await.clone(),
        }
    }

    /// Claims the single in-flight scan slot. Returns a Busy error if a
    /// scan is already running; synchronous so two concurrent callers
    /// race cleanly with no window for both to proceed.
    fn try_claim(&self) -> MediaViewerResult<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(MediaViewerError::Busy("scan already in progress".into()));
        }
        self.scanned.store(0, Ordering::Release);
        Ok(())
    }

    /// Walks the media root and reconciles the catalog, awaiting
    /// completion. Returns a Busy error if a scan is already in progress.
    pub async fn rescan(&self) -> MediaViewerResult<()> {
        self.try_claim()?;
        self.set_message("walking media root").await;
        let result = self.do_rescan().await;
        self.running.store(false, Ordering::Release);
        result
    }

    /// Claims the scan slot and runs the walk on a background task,
    /// returning immediately. Used by `POST /scan` (spec: "starts
    /// background rescan if none running, else 409") and by startup.
    pub fn spawn_rescan(self: &Arc<Self>) -> MediaViewerResult<()> {
        self.try_claim()?;
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            scanner.set_message("walking media root").await;
            if let Err(e) = scanner.do_rescan().await {
                log::warn!("[scan] background rescan failed: {e}");
            }
            scanner.running.store(false, Ordering::Release);
        });
        Ok(())
    }

    async fn set_message(&self, message: &str) {
        *self.progress_message.lock().await = message.to_string();
    }

    async fn do_rescan(&self) -> MediaViewerResult<()> {
        let root = self.media_root.clone();
        let entries = tokio::task::spawn_blocking(move || {
            walkdir::WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
                .map(|e| e.path().to_path_buf())
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| MediaViewerError::Internal(format!("scan walk task panicked: {e}")))?;

        for path in entries {
            if let Some(item) = self.index_one(&path).await {
                self.catalog.upsert(item);
            }
            let n = self.scanned.fetch_add(1, Ordering::AcqRel) + 1;
            if n % PROGRESS_EVERY == 0 {
                self.set_message(&format!("scanned {n} files")).await;
            }
        }

        self.cleanup().await;
        self.set_message("scan complete").await;
        log::info!(
            "[scan] complete, {} file(s) walked",
            self.scanned.load(Ordering::Acquire)
        );
        Ok(())
    }

    async fn index_one(&self, path: &Path) -> Option<MediaItem> {
        let rel_path = relative_path(&self.media_root, path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        let media_type = classify_extension(&ext)?;

        let metadata = tokio::fs::metadata(path).await.ok()?;
        let size_bytes = metadata.len();
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let filename = path.file_name()?.to_string_lossy().to_string();
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| filename.clone());

        let id = self
            .catalog
            .get_by_rel_path(&rel_path)
            .map(|existing| existing.id)
            .unwrap_or_else(|| crate::util::fnv1a_32_positive(&rel_path).to_string());

        let mut width = None;
        let mut height = None;
        let mut duration_ms = None;
        let mut is_vr = false;
        let mut vr_fov = None;
        let mut vr_stereo = None;
        let mut vr_projection = None;

        if media_type == MediaType::Video {
            if let Some(probe) = probe_video(&self.ffprobe_path, path).await {
                width = probe.width;
                height = probe.height;
                duration_ms = probe.duration_ms;
                if let Some((fov, stereo, projection)) = probe.vr_hint {
                    is_vr = true;
                    vr_fov = Some(fov);
                    vr_stereo = Some(stereo);
                    vr_projection = projection;
                } else if let Some((w, h)) = width.zip(height) {
                    if let Some(fov) = dimension_heuristic(w, h) {
                        is_vr = true;
                        vr_fov = Some(fov);
                    }
                }
            }

            if !is_vr {
                if let Some((fov, stereo)) = filename_token_heuristic(&rel_path) {
                    is_vr = true;
                    vr_fov = Some(fov);
                    vr_stereo = Some(stereo);
                }
            }
        }

        let (has_funscript, funscript_action_count, funscript_avg_speed) =
            load_funscript_summary(path).await;

        Some(MediaItem {
            id,
            rel_path,
            filename,
            title,
            ext,
            media_type,
            size_bytes,
            modified_ms,
            duration_ms,
            width,
            height,
            has_funscript,
            funscript_action_count,
            funscript_avg_speed,
            is_vr,
            vr_fov,
            vr_stereo,
            vr_projection,
        })
    }

    async fn cleanup(&self) {
        let rows = self.catalog.all_rel_paths();
        let semaphore = Arc::new(Semaphore::new(CLEANUP_CONCURRENCY));
        let root = self.media_root.clone();

        let mut tasks = Vec::with_capacity(rows.len());
        for (id, rel_path) in rows {
            let semaphore = Arc::clone(&semaphore);
            let full_path = root.join(&rel_path);
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await;
                let present = match tokio::fs::metadata(&full_path).await {
                    Ok(_) => true,
                    Err(e) => matches!(
                        e.kind(),
                        std::io::ErrorKind::PermissionDenied
                    ),
                };
                (id, present)
            }));
        }

        for task in tasks {
            if let Ok((id, present)) = task.await {
                if !present {
                    self.catalog.remove(&id);
                    log::debug!("[scan] removed vanished row {id}");
                }
            }
        }
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let rel = rel.to_string_lossy().replace('\\', "/");
    if rel.split('/').any(|segment| segment == "..") {
        return None;
    }
    Some(rel)
}

fn classify_extension(ext: &str) -> Option<MediaType> {
    if VIDEO_EXTS.contains(&ext) {
        Some(MediaType::Video)
    } else if IMAGE_EXTS.contains(&ext) {
        Some(MediaType::Image)
    } else {
        None
    }
}

struct ProbeResult {
    width: Option<u32>,
    height: Option<u32>,
    duration_ms: Option<u64>,
    /// `(fov, stereo, projection)` when explicit spherical/stereo3d
    /// side-data is present.
    vr_hint: Option<(u16, VrStereo, Option<String>)>,
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    side_data_type: Option<String>,
    projection: Option<String>,
    #[serde(rename = "bound_left")]
    bound_left: Option<f64>,
    #[serde(rename = "bound_right")]
    bound_right: Option<f64>,
    stereo3d_type: Option<String>,
}

/// Spawns `ffprobe -print_format json -show_format -show_streams <path>`
/// and parses its stdout. Any failure (missing binary, non-zero exit,
/// malformed JSON) degrades to `None` — a Transient error per spec, never
/// fatal to the scan.
async fn probe_video(ffprobe_path: &Path, path: &Path) -> Option<ProbeResult> {
    let output = Command::new(ffprobe_path)
        .arg("-v")
        .arg("quiet")
        .arg("-print_format")
        .arg("json")
        .arg("-show_format")
        .arg("-show_streams")
        .arg(path)
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        log::debug!("[scan] ffprobe failed for {}", path.display());
        return None;
    }

    let parsed: FfprobeOutput = serde_json::from_slice(&output.stdout).ok()?;
    let video_stream = parsed.streams.iter().find(|s| s.width.is_some())?;

    let duration_ms = parsed
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .map(|secs| (secs * 1000.0).round() as u64);

    let vr_hint = video_stream.side_data_list.iter().find_map(|sd| {
        let is_spherical = sd.side_data_type.as_deref() == Some("Spherical Mapping");
        let is_stereo3d = sd.side_data_type.as_deref() == Some("Stereo 3D");

        if is_spherical {
            let fov = match (sd.bound_left, sd.bound_right) {
                (Some(left), Some(right)) if (right - left) <= 0.75 => 180,
                _ => 360,
            };
            let stereo = stereo_from_ffprobe(sd.stereo3d_type.as_deref());
            Some((fov, stereo, sd.projection.clone()))
        } else if is_stereo3d {
            let stereo = stereo_from_ffprobe(sd.stereo3d_type.as_deref());
            Some((360u16, stereo, sd.projection.clone()))
        } else {
            None
        }
    });

    Some(ProbeResult {
        width: video_stream.width,
        height: video_stream.height,
        duration_ms,
        vr_hint,
    })
}

fn stereo_from_ffprobe(stereo3d_type: Option<&str>) -> VrStereo {
    match stereo3d_type {
        Some("sbs" | "sbsl" | "sbsr") => VrStereo::Sbs,
        Some("tb" | "tbl" | "tbr") => VrStereo::Tb,
        _ => VrStereo::Mono,
    }
}

/// Dimension heuristic per spec.md §4.2: ratio ≈ 2:1 and frame ≥ 3000x1500
/// → 360 (equirect); ratio ≈ 1:1 and frame ≥ 2500x2500 → 180 (dome).
fn dimension_heuristic(width: u32, height: u32) -> Option<u16> {
    if height == 0 {
        return None;
    }
    let ratio = f64::from(width) / f64::from(height);
    if (ratio - 2.0).abs() < 0.05 && width >= 3000 && height >= 1500 {
        Some(360)
    } else if (ratio - 1.0).abs() < 0.05 && width >= 2500 && height >= 2500 {
        Some(180)
    } else {
        None
    }
}

/// Path/filename token heuristic per spec.md §4.2, word-boundary tokens.
fn filename_token_heuristic(rel_path: &str) -> Option<(u16, VrStereo)> {
    let lower = rel_path.to_ascii_lowercase();
    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    if lower.contains("_lrf_full_sbs") {
        return Some((180, VrStereo::Sbs));
    }

    let has_vr_token = tokens.iter().any(|t| *t == "vr") || lower.contains("/vr/");
    let fov = if tokens.iter().any(|t| *t == "180" || *t == "vr180") {
        Some(180)
    } else if tokens.iter().any(|t| *t == "360" || *t == "vr360") {
        Some(360)
    } else if has_vr_token {
        Some(360)
    } else {
        None
    };

    let stereo = if tokens
        .iter()
        .any(|t| matches!(*t, "lr" | "rl" | "sbs" | "3dh"))
    {
        Some(VrStereo::Sbs)
    } else if tokens
        .iter()
        .any(|t| matches!(*t, "tb" | "bt" | "ou" | "overunder" | "3dv"))
    {
        Some(VrStereo::Tb)
    } else {
        None
    };

    match (fov, stereo) {
        (None, None) => None,
        (fov, stereo) => Some((fov.unwrap_or(360), stereo.unwrap_or(VrStereo::Mono))),
    }
}

#[derive(Debug, Deserialize)]
struct FunscriptAction {
    at: i64,
    pos: i64,
}

#[derive(Debug, Deserialize)]
struct FunscriptFile {
    actions: Vec<FunscriptAction>,
}

/// Loads `<stem>.funscript` beside `path`, if present, and derives
/// `(hasFunscript, actionCount, avgSpeed)` — `avgSpeed = Σ|Δpos| / Σ|Δt| ×
/// 1000`, ignoring non-positive `Δt` samples.
async fn load_funscript_summary(path: &Path) -> (bool, Option<u32>, Option<f64>) {
    let funscript_path = path.with_extension("funscript");
    let Ok(content) = tokio::fs::read_to_string(&funscript_path).await else {
        return (false, None, None);
    };

    let Ok(parsed) = serde_json::from_str::<FunscriptFile>(&content) else {
        log::debug!("[scan] malformed funscript {}", funscript_path.display());
        return (true, None, None);
    };

    let action_count = parsed.actions.len() as u32;
    let mut pos_delta_sum = 0.0;
    let mut time_delta_sum = 0.0;
    for pair in parsed.actions.windows(2) {
        let dt = (pair[1].at - pair[0].at) as f64;
        if dt <= 0.0 {
            continue;
        }
        time_delta_sum += dt;
        pos_delta_sum += (pair[1].pos - pair[0].pos).abs() as f64;
    }

    let avg_speed = if time_delta_sum > 0.0 {
        Some(pos_delta_sum / time_delta_sum * 1000.0)
    } else {
        None
    };

    (true, Some(action_count), avg_speed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_heuristic_flags_360_equirect() {
        assert_eq!(dimension_heuristic(3840, 1920), Some(360));
    }

    #[test]
    fn dimension_heuristic_flags_180_dome() {
        assert_eq!(dimension_heuristic(2800, 2800), Some(180));
    }

    #[test]
    fn dimension_heuristic_ignores_standard_16_9() {
        assert_eq!(dimension_heuristic(1920, 1080), None);
    }

    #[test]
    fn filename_token_heuristic_detects_lr_180() {
        let (fov, stereo) = filename_token_heuristic("movie_LR_180.mp4").unwrap();
        assert_eq!(fov, 180);
        assert_eq!(stereo, VrStereo::Sbs);
    }

    #[test]
    fn filename_token_heuristic_rejects_plain_name() {
        assert!(filename_token_heuristic("vacation.mp4").is_none());
    }

    #[test]
    fn relative_path_rejects_parent_traversal() {
        let root = Path::new("/media");
        let bad = Path::new("/media/../etc/passwd");
        assert!(relative_path(root, bad).is_none());
    }
}
