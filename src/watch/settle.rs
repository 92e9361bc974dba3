use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Tracks changing files and decides when they have settled.
///
/// A file copied into the library fires a stream of modification events;
/// it is only worth probing once it has stopped changing for the settle
/// duration.
pub struct FileSettleTracker {
    pending: HashMap<PathBuf, Instant>,
    settle: Duration,
}

impl FileSettleTracker {
    pub fn new(settle: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            settle,
        }
    }

    /// Record a change to a file, restarting its settle clock.
    pub fn touch(&mut self, path: PathBuf) {
        self.pending.insert(path, Instant::now());
    }

    /// Stop tracking a file (it was deleted).
    pub fn forget(&mut self, path: &Path) {
        self.pending.remove(path);
    }

    /// Drain the files that have been quiet since before the settle window.
    pub fn take_settled(&mut self, now: Instant) -> Vec<PathBuf> {
        let settle = self.settle;
        let settled: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, changed)| now.duration_since(**changed) >= settle)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &settled {
            self.pending.remove(path);
        }

        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_settles_after_quiet_period() {
        let mut tracker = FileSettleTracker::new(Duration::from_secs(5));
        tracker.touch(PathBuf::from("/m/a.mkv"));

        let now = Instant::now();
        assert!(tracker.take_settled(now).is_empty());

        let settled = tracker.take_settled(now + Duration::from_secs(6));
        assert_eq!(settled, [PathBuf::from("/m/a.mkv")]);

        // Drained; does not settle twice.
        assert!(tracker
            .take_settled(now + Duration::from_secs(60))
            .is_empty());
    }

    #[test]
    fn touch_restarts_the_clock() {
        let mut tracker = FileSettleTracker::new(Duration::from_secs(5));
        tracker.touch(PathBuf::from("/m/a.mkv"));
        std::thread::sleep(Duration::from_millis(20));
        tracker.touch(PathBuf::from("/m/a.mkv"));

        // Relative to the first touch the file is old enough, but the
        // second touch reset it.
        let now = Instant::now();
        assert!(tracker.take_settled(now + Duration::from_millis(4990)).is_empty());
    }

    #[test]
    fn forgotten_files_never_settle() {
        let mut tracker = FileSettleTracker::new(Duration::ZERO);
        tracker.touch(PathBuf::from("/m/a.mkv"));
        tracker.forget(Path::new("/m/a.mkv"));
        assert!(tracker.take_settled(Instant::now()).is_empty());
    }
}
