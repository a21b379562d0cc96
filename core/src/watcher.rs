/// Source file change detection (polling, no push notifications)
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error};

pub struct SourceWatcher {
    path: PathBuf,
    wal_path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl SourceWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut wal = path.clone().into_os_string();
        wal.push("-wal");
        Self {
            path,
            wal_path: PathBuf::from(wal),
            last_seen: None,
        }
    }

    fn mtime(path: &Path) -> std::io::Result<SystemTime> {
        std::fs::metadata(path)?.modified()
    }

    /// Newest modification time of the store and its write-ahead log
    fn current(&self) -> std::io::Result<SystemTime> {
        let main = Self::mtime(&self.path)?;
        Ok(match Self::mtime(&self.wal_path) {
            Ok(wal) if wal > main => wal,
            _ => main,
        })
    }

    /// True on the first call and whenever the source has been written since
    /// the previous call
    pub fn has_been_modified(&mut self) -> bool {
        match self.current() {
            Ok(modified) => {
                let advanced = self.last_seen.map_or(true, |seen| modified > seen);
                if advanced {
                    debug!("Source {} modified at {:?}", self.path.display(), modified);
                    self.last_seen = Some(modified);
                }
                advanced
            }
            Err(e) => {
                // Let the refresh path surface the real failure
                error!("Cannot stat {}: {}", self.path.display(), e);
                true
            }
        }
    }

    pub fn last_seen(&self) -> Option<SystemTime> {
        self.last_seen
    }
}
