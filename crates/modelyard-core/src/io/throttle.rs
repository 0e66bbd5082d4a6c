//! Per-mount-point throttle for heavy I/O (hashing, copying).
//!
//! One counting semaphore per resolved mount point, sized by drive type:
//! spinning disks serialize, solid-state drives allow higher parallelism.
//! Instances are owned and injected explicitly; there is no process-wide
//! shared throttle, so tests and embedders can isolate their own.

use crate::config::ThrottleConfig;
use crate::platform::{DriveDetector, DriveType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use tracing::debug;

/// Counting semaphore for synchronous callers.
#[derive(Debug)]
struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self
                .available
                .wait(permits)
                .unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
    }

    fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.available.notify_one();
    }
}

/// Throttles heavy operations per physical drive.
#[derive(Debug)]
pub struct IoThrottle {
    detector: Arc<DriveDetector>,
    slots: Mutex<HashMap<PathBuf, Arc<Semaphore>>>,
}

impl Default for IoThrottle {
    fn default() -> Self {
        Self::new(Arc::new(DriveDetector::new()))
    }
}

impl IoThrottle {
    pub fn new(detector: Arc<DriveDetector>) -> Self {
        Self {
            detector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Block until a permit for the mount backing `path` is free.
    ///
    /// The permit is released when the returned guard drops.
    pub fn acquire(&self, path: &Path) -> IoPermit {
        let mount = self.detector.mount_point(path);

        let semaphore = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(mount.clone())
                .or_insert_with(|| {
                    let drive = self.detector.drive_type(path);
                    let permits = permits_for(drive);
                    debug!(
                        "Throttle for {} ({}): {} permits",
                        mount.display(),
                        drive,
                        permits
                    );
                    Arc::new(Semaphore::new(permits))
                })
                .clone()
        };

        semaphore.acquire();
        IoPermit { semaphore }
    }
}

fn permits_for(drive: DriveType) -> usize {
    match drive {
        DriveType::Hdd => ThrottleConfig::HDD_PERMITS,
        DriveType::Ssd => ThrottleConfig::SSD_PERMITS,
        DriveType::Unknown => ThrottleConfig::UNKNOWN_PERMITS,
    }
}

/// RAII guard releasing its permit on drop.
#[derive(Debug)]
pub struct IoPermit {
    semaphore: Arc<Semaphore>,
}

impl Drop for IoPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_permit_released_on_drop() {
        let sem = Semaphore::new(1);
        sem.acquire();
        sem.release();
        sem.acquire();
        sem.release();
    }

    #[test]
    fn test_acquire_and_drop_cycle() {
        let throttle = IoThrottle::default();
        let temp = TempDir::new().unwrap();

        for _ in 0..8 {
            let permit = throttle.acquire(temp.path());
            drop(permit);
        }
    }

    #[test]
    fn test_same_mount_shares_semaphore() {
        let throttle = IoThrottle::default();
        let temp = TempDir::new().unwrap();

        let _a = throttle.acquire(temp.path());
        let slots = throttle.slots.lock().unwrap();
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn test_serializes_across_threads() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // A single-permit semaphore must never admit two holders at once
        let sem = Arc::new(Semaphore::new(1));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sem = sem.clone();
                let active = active.clone();
                let peak = peak.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        sem.acquire();
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        active.fetch_sub(1, Ordering::SeqCst);
                        sem.release();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
