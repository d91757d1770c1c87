//! File-count progress for the active job step.
//!
//! One step owns the counters at a time; totals come from a one-time
//! directory walk before the archiver starts. Restore runs indeterminate
//! (no pre-scan of the archive), so the fraction only moves during backup.

use crate::logging::LogThrottle;
use crate::ui::UiAdapter;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct JobProgress {
    ui: Arc<dyn UiAdapter>,
    throttle: LogThrottle,
    files_total: u64,
    files_done: u64,
}

impl JobProgress {
    pub fn new(ui: Arc<dyn UiAdapter>, interval: Duration) -> Self {
        Self {
            ui,
            throttle: LogThrottle::new(interval),
            files_total: 0,
            files_done: 0,
        }
    }

    /// Arm the counters for one partition step.
    pub fn begin_step(&mut self, files_total: u64) {
        self.files_total = files_total;
        self.files_done = 0;
        self.ui.show_progress();
    }

    /// No total known; per-file output is logged but no fraction is shown.
    pub fn indeterminate(&mut self) {
        self.files_total = 0;
        self.files_done = 0;
    }

    /// One line of archiver output, nominally one file.
    pub fn on_file(&mut self, name: &str) {
        if !name.is_empty() {
            debug!(file = name, "processed");
        }
        if self.files_total == 0 {
            return;
        }
        self.files_done += 1;
        if self.throttle.should_log() {
            self.ui.set_progress(self.fraction());
        }
    }

    pub fn fraction(&self) -> f32 {
        if self.files_total == 0 {
            0.0
        } else {
            (self.files_done as f64 / self.files_total as f64) as f32
        }
    }

    pub fn reset(&mut self) {
        self.files_total = 0;
        self.files_done = 0;
        self.ui.reset_progress();
    }
}

/// Count entries under `dir` the way the archiver will visit them: the
/// directory itself, every subdirectory and every file, minus an excluded
/// subtree (emulated storage when archiving the data partition).
pub fn count_files(dir: &Path, exclude: Option<&Path>) -> u64 {
    fn walk(dir: &Path, exclude: Option<&Path>) -> u64 {
        let mut count = 1;
        let Ok(entries) = std::fs::read_dir(dir) else {
            return count;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if exclude.is_some_and(|e| e == path) {
                continue;
            }
            let Ok(meta) = std::fs::symlink_metadata(&path) else {
                continue;
            };
            if meta.is_dir() {
                count += walk(&path, exclude);
            } else {
                count += 1;
            }
        }
        count
    }
    walk(dir, exclude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::SilentUi;

    #[test]
    fn counts_match_a_small_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/x"), b"1").unwrap();
        std::fs::write(dir.path().join("a/b/y"), b"2").unwrap();

        // root + a + a/b + two files
        assert_eq!(count_files(dir.path(), None), 5);
    }

    #[test]
    fn excluded_subtree_is_not_counted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("media")).unwrap();
        std::fs::write(dir.path().join("media/big.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("small"), b"x").unwrap();

        let media = dir.path().join("media");
        assert_eq!(count_files(dir.path(), Some(&media)), 2);
    }

    #[test]
    fn fraction_tracks_processed_files() {
        let mut progress = JobProgress::new(Arc::new(SilentUi), Duration::from_millis(1));
        progress.begin_step(4);
        progress.on_file("system/");
        progress.on_file("system/build.prop");
        assert!((progress.fraction() - 0.5).abs() < f32::EPSILON);

        progress.indeterminate();
        progress.on_file("anything");
        assert_eq!(progress.fraction(), 0.0);
    }
}
