//! Housekeeping sweep - retention, staleness eviction and upload of
//! finished segments in the active output directory.
//!
//! The newest `max(keep_local, 1)` segments are never touched, and neither
//! is any file that still fails the stability probe. Everything else is
//! deleted when stale, otherwise uploaded and deleted on success, or simply
//! deleted when uploading is off.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::config::RecorderConfig;
use super::upload::{UploadRequest, Uploader};
use crate::platform;

/// Interval between sweeps
pub const HOUSEKEEPING_PERIOD: Duration = Duration::from_secs(60);

/// Decides whether a file is finished and safe to touch
pub trait StabilityProbe: Send + Sync {
    fn is_stable(&self, path: &Path) -> bool;
}

/// Stable when the file can be opened exclusively
#[derive(Debug, Default, Clone, Copy)]
pub struct ExclusiveOpenProbe;

impl StabilityProbe for ExclusiveOpenProbe {
    fn is_stable(&self, path: &Path) -> bool {
        platform::is_file_released(path)
    }
}

/// A candidate output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl Segment {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Counters for one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub kept: usize,
    pub skipped_unstable: usize,
    pub expired: usize,
    pub uploaded: usize,
    pub upload_failed: usize,
    pub deleted: usize,
    pub delete_failed: usize,
}

impl SweepReport {
    /// Nothing beyond the retained files was looked at
    pub fn is_idle(&self) -> bool {
        self.skipped_unstable == 0
            && self.expired == 0
            && self.uploaded == 0
            && self.upload_failed == 0
            && self.deleted == 0
            && self.delete_failed == 0
    }
}

pub struct Housekeeper {
    probe: Arc<dyn StabilityProbe>,
    uploader: Arc<dyn Uploader>,
}

impl Housekeeper {
    pub fn new(probe: Arc<dyn StabilityProbe>, uploader: Arc<dyn Uploader>) -> Self {
        Self { probe, uploader }
    }

    /// Run one pass over `dir`. Never fails; problems are logged and counted.
    pub async fn sweep(&self, config: &RecorderConfig, dir: &Path) -> SweepReport {
        let mut report = SweepReport::default();

        let segments = match list_segments(dir, &config.output_extension()).await {
            Ok(segments) => segments,
            Err(e) => {
                debug!("Housekeeping skipped for {}: {}", dir.display(), e);
                return report;
            }
        };

        let keep = config.keep_local.max(1) as usize;
        report.kept = segments.len().min(keep);
        let now = SystemTime::now();

        for segment in segments.into_iter().skip(keep) {
            if !self.probe.is_stable(&segment.path) {
                debug!("Segment still in use: {}", segment.name());
                report.skipped_unstable += 1;
                continue;
            }

            if is_expired(&segment, config.max_failed_upload_age, now) {
                info!(
                    "Deleting stale recording (over max_failed_upload_age): {}",
                    segment.name()
                );
                report.expired += 1;
                if !delete(&segment.path).await {
                    report.delete_failed += 1;
                }
                continue;
            }

            if let Some(url) = &config.upload_url {
                let request = UploadRequest {
                    url: url.clone(),
                    token: Some(config.upload_token.clone()).filter(|t| !t.is_empty()),
                    file: segment.path.clone(),
                    system_name: config.system_name.clone(),
                    recording_user: recording_owner(&config.record_dir, &segment.path),
                };
                match self.uploader.upload(&request).await {
                    Ok(()) => {
                        info!("Uploaded: {}", segment.name());
                        report.uploaded += 1;
                        if !delete(&segment.path).await {
                            report.delete_failed += 1;
                        }
                    }
                    Err(e) => {
                        warn!("Upload failed, keeping file: {} :: {}", segment.name(), e);
                        report.upload_failed += 1;
                    }
                }
                continue;
            }

            if delete(&segment.path).await {
                report.deleted += 1;
            } else {
                report.delete_failed += 1;
            }
        }

        if !report.is_idle() {
            info!("Housekeeping in {}: {:?}", dir.display(), report);
        }
        report
    }
}

/// Regular files in `dir` with the given extension, newest first
pub async fn list_segments(dir: &Path, extension: &str) -> std::io::Result<Vec<Segment>> {
    let wanted = extension.trim_start_matches('.').to_lowercase();
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut segments = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let matches = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase() == wanted)
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        segments.push(Segment { path, modified });
    }

    segments.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(segments)
}

/// Label of whoever made the recording: the last directory component below
/// `record_dir`, else the file's parent directory name
pub fn recording_owner(record_dir: &Path, file: &Path) -> String {
    let Some(parent) = file.parent() else {
        return String::new();
    };
    let name_of = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    match parent.strip_prefix(record_dir) {
        Ok(relative) if relative.as_os_str().is_empty() => name_of(parent),
        Ok(relative) => name_of(relative),
        Err(_) => name_of(parent),
    }
}

fn is_expired(segment: &Segment, max_age: Duration, now: SystemTime) -> bool {
    if max_age.is_zero() {
        return false;
    }
    now.duration_since(segment.modified)
        .map(|age| age > max_age)
        .unwrap_or(false)
}

async fn delete(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Delete failed: {} :: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::upload::{MockUploader, UploadError};
    use std::collections::HashSet;
    use std::fs::{File, FileTimes};
    use std::sync::Mutex;

    /// Everything is unstable except what the test releases
    #[derive(Default)]
    struct HeldFiles {
        held: Mutex<HashSet<PathBuf>>,
    }

    impl HeldFiles {
        fn hold(&self, path: &Path) {
            self.held.lock().unwrap().insert(path.to_path_buf());
        }

        fn release_all(&self) {
            self.held.lock().unwrap().clear();
        }
    }

    impl StabilityProbe for HeldFiles {
        fn is_stable(&self, path: &Path) -> bool {
            !self.held.lock().unwrap().contains(path)
        }
    }

    /// Write `count` segments, oldest first, each an hour apart
    fn write_segments(dir: &Path, count: usize, newest_age: Duration) -> Vec<PathBuf> {
        let now = SystemTime::now();
        (0..count)
            .map(|i| {
                let path = dir.join(format!("desktop_{:02}.mkv", i));
                std::fs::write(&path, format!("segment {}", i)).unwrap();
                let age = newest_age + Duration::from_secs(3600 * (count - 1 - i) as u64);
                let file = File::options().write(true).open(&path).unwrap();
                file.set_times(FileTimes::new().set_modified(now - age)).unwrap();
                path
            })
            .collect()
    }

    fn config(dir: &Path, upload: bool) -> RecorderConfig {
        RecorderConfig {
            record_dir: dir.to_path_buf(),
            keep_local: 2,
            upload_url: upload.then(|| "http://uploads.invalid/api".to_string()),
            system_name: "rec-box".to_string(),
            ..RecorderConfig::default()
        }
    }

    fn no_uploads() -> Arc<MockUploader> {
        let mut uploader = MockUploader::new();
        uploader.expect_upload().never();
        Arc::new(uploader)
    }

    #[tokio::test]
    async fn unstable_files_are_left_alone_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_segments(dir.path(), 5, Duration::from_secs(60));
        let probe = Arc::new(HeldFiles::default());
        for path in &paths[..3] {
            probe.hold(path);
        }
        let cfg = config(dir.path(), false);

        let housekeeper = Housekeeper::new(probe.clone(), no_uploads());
        let report = housekeeper.sweep(&cfg, dir.path()).await;
        assert_eq!(report.skipped_unstable, 3);
        assert_eq!(report.deleted, 0);
        assert!(paths.iter().all(|p| p.exists()));

        probe.release_all();
        let report = housekeeper.sweep(&cfg, dir.path()).await;
        assert_eq!(report.kept, 2);
        assert_eq!(report.deleted, 3);
        assert!(paths[..3].iter().all(|p| !p.exists()));
        assert!(paths[3..].iter().all(|p| p.exists()));
    }

    #[tokio::test]
    async fn stale_file_is_deleted_without_upload() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_segments(dir.path(), 3, Duration::from_secs(60));
        let mut cfg = config(dir.path(), true);
        cfg.max_failed_upload_age = Duration::from_secs(3 * 3600);

        // Oldest is ~2h old; make it older than the limit
        let file = File::options().write(true).open(&paths[0]).unwrap();
        file.set_times(
            FileTimes::new().set_modified(SystemTime::now() - Duration::from_secs(5 * 3600)),
        )
        .unwrap();

        let housekeeper = Housekeeper::new(Arc::new(ExclusiveOpenProbe), no_uploads());
        let report = housekeeper.sweep(&cfg, dir.path()).await;

        assert_eq!(report.expired, 1);
        assert_eq!(report.uploaded, 0);
        assert!(!paths[0].exists());
    }

    #[tokio::test]
    async fn failed_upload_keeps_file_until_a_later_success() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_segments(dir.path(), 3, Duration::from_secs(60));
        let before = std::fs::read(&paths[0]).unwrap();
        let cfg = config(dir.path(), true);

        let mut failing = MockUploader::new();
        failing.expect_upload().times(1).returning(|_| {
            Err(UploadError::Status {
                status: 503,
                body: "busy".to_string(),
            })
        });
        let housekeeper = Housekeeper::new(Arc::new(ExclusiveOpenProbe), Arc::new(failing));
        let report = housekeeper.sweep(&cfg, dir.path()).await;
        assert_eq!(report.upload_failed, 1);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), before);

        let expected = paths[0].clone();
        let mut working = MockUploader::new();
        working
            .expect_upload()
            .withf(move |r| r.file == expected && r.system_name == "rec-box" && r.token.is_none())
            .times(1)
            .returning(|_| Ok(()));
        let housekeeper = Housekeeper::new(Arc::new(ExclusiveOpenProbe), Arc::new(working));
        let report = housekeeper.sweep(&cfg, dir.path()).await;
        assert_eq!(report.uploaded, 1);
        assert!(!paths[0].exists());
    }

    #[tokio::test]
    async fn keep_local_zero_still_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let paths = write_segments(dir.path(), 2, Duration::from_secs(60));
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
        let mut cfg = config(dir.path(), false);
        cfg.keep_local = 0;

        let housekeeper = Housekeeper::new(Arc::new(ExclusiveOpenProbe), no_uploads());
        let report = housekeeper.sweep(&cfg, dir.path()).await;

        assert_eq!(report.kept, 1);
        assert_eq!(report.deleted, 1);
        assert!(paths[1].exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[tokio::test]
    async fn missing_directory_is_a_quiet_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), false);
        let housekeeper = Housekeeper::new(Arc::new(ExclusiveOpenProbe), no_uploads());
        let report = housekeeper.sweep(&cfg, &dir.path().join("absent")).await;
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn owner_is_last_component_below_record_dir() {
        let root = Path::new("/data/rec");
        assert_eq!(
            recording_owner(root, Path::new("/data/rec/alice/s1/a.mkv")),
            "s1"
        );
        assert_eq!(recording_owner(root, Path::new("/data/rec/bob/a.mkv")), "bob");
        assert_eq!(recording_owner(root, Path::new("/data/rec/a.mkv")), "rec");
        assert_eq!(recording_owner(root, Path::new("/elsewhere/carol/a.mkv")), "carol");
    }
}
