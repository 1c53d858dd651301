//! Background upload of acquired files to the network store.
//!
//! The orchestration never waits on the network. It rebuilds the queue after acquisitions
//! (`check_acquired_data`) and calls `launch_next` from its own poll loops; at most one
//! transfer is in flight, gated by a single-permit semaphore. A transfer failure releases the
//! permit and leaves the file un-uploaded so the next rebuild queues it again. Files rewritten
//! after their upload started (event log, status record) are queued again as well.

pub mod naming;
pub mod network;
pub mod queue;

pub use naming::{stack_name, VendorRenamer};
pub use network::{CopyTransfer, FileTransfer, NetworkProbe, PingProbe};
pub use queue::UploadQueue;

use crate::abort::{poll_until, AbortFlag, Deadline, WaitOutcome};
use crate::config::TransferConfig;
use crate::error::AppResult;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::sync::Semaphore;
use tokio::time::{sleep, Duration, Instant};

/// Every regular file below `dir`, recursively. A missing directory is empty.
pub(crate) fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

/// Size and modification time of a file when its upload was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let metadata = std::fs::metadata(path).ok()?;
        Some(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

/// Uploaded or in-flight files, with their stamp at launch.
type UploadedFiles = HashMap<PathBuf, Option<FileStamp>>;

/// The file was never uploaded, or changed since its upload was launched.
fn needs_upload(uploaded: &UploadedFiles, path: &Path) -> bool {
    uploaded
        .get(path)
        .map_or(true, |stamp| *stamp != FileStamp::of(path))
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Single-flight uploader mirroring the local run directory onto the network store.
pub struct UploadWorkerPool {
    slot: Arc<Semaphore>,
    enabled: AtomicBool,
    queue: Mutex<UploadQueue>,
    uploaded: Arc<Mutex<UploadedFiles>>,
    completed: Arc<AtomicU64>,
    local_root: PathBuf,
    network_root: PathBuf,
    probe: Arc<dyn NetworkProbe>,
    transfer: Arc<dyn FileTransfer>,
    renamer: Option<VendorRenamer>,
    busy_timeout: Duration,
    drain_interval: Duration,
}

impl UploadWorkerPool {
    /// Pool uploading `local_root` to `network_root`.
    pub fn new(
        local_root: impl Into<PathBuf>,
        network_root: impl Into<PathBuf>,
        probe: Arc<dyn NetworkProbe>,
        transfer: Arc<dyn FileTransfer>,
        settings: &TransferConfig,
        renamer: Option<VendorRenamer>,
    ) -> Self {
        Self {
            slot: Arc::new(Semaphore::new(1)),
            enabled: AtomicBool::new(true),
            queue: Mutex::new(UploadQueue::new()),
            uploaded: Arc::new(Mutex::new(HashMap::new())),
            completed: Arc::new(AtomicU64::new(0)),
            local_root: local_root.into(),
            network_root: network_root.into(),
            probe,
            transfer,
            renamer,
            busy_timeout: settings.busy_timeout,
            drain_interval: settings.drain_interval,
        }
    }

    /// Transfer has not been disabled or abandoned.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Stop launching transfers for the rest of the run.
    pub fn disable(&self, reason: &str) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            tracing::error!(reason, "data transfer disabled for the rest of the run");
        }
    }

    /// No transfer in flight.
    pub fn is_idle(&self) -> bool {
        self.slot.available_permits() == 1
    }

    /// Files queued and not yet launched.
    pub fn pending(&self) -> usize {
        locked(&self.queue).len()
    }

    /// Transfers finished successfully.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    /// Queue one file unless it is already uploaded unchanged.
    pub fn enqueue(&self, path: PathBuf) {
        if needs_upload(&locked(&self.uploaded), &path) {
            locked(&self.queue).enqueue(path);
        }
    }

    /// Rebuild the queue from the files present locally minus the files already uploaded
    /// or in flight and unchanged since. Returns the new queue order.
    pub fn check_acquired_data(&self) -> AppResult<Vec<PathBuf>> {
        let mut present: Vec<PathBuf> = list_files(&self.local_root)?
            .into_iter()
            .filter(|p| p.extension().map_or(true, |e| e != "tmp"))
            .collect();
        if let Some(renamer) = &self.renamer {
            present.extend(renamer.vendor_files()?);
        }

        let candidates: Vec<PathBuf> = {
            let uploaded = locked(&self.uploaded);
            present
                .into_iter()
                .filter(|p| needs_upload(&uploaded, p))
                .collect()
        };
        let mut queue = locked(&self.queue);
        queue.rebuild(candidates);
        tracing::debug!(pending = queue.len(), "upload queue rebuilt");
        Ok(queue.iter().cloned().collect())
    }

    fn destination(&self, source: &Path) -> AppResult<Option<PathBuf>> {
        if let Some(renamer) = &self.renamer {
            if source.starts_with(renamer.directory()) {
                return Ok(renamer
                    .resolve(source)?
                    .map(|name| self.network_root.join(name)));
            }
        }
        let relative = source
            .strip_prefix(&self.local_root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| source.file_name().map(PathBuf::from).unwrap_or_default());
        Ok(Some(self.network_root.join(relative)))
    }

    /// Start the next transfer if the slot is free and the network is reachable.
    ///
    /// Never blocks on the transfer itself. Returns whether a transfer was launched.
    pub async fn launch_next(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let Ok(permit) = self.slot.clone().try_acquire_owned() else {
            return false;
        };
        let empty = locked(&self.queue).is_empty();
        if empty || !self.probe.is_reachable().await {
            return false;
        }

        let next = loop {
            let Some(source) = locked(&self.queue).pop_next() else {
                break None;
            };
            match self.destination(&source) {
                Ok(Some(destination)) => break Some((source, destination)),
                Ok(None) => {
                    tracing::debug!(
                        file = %source.display(),
                        "no logical name yet, retrying later"
                    );
                }
                Err(e) => tracing::warn!(
                    file = %source.display(),
                    error = %e,
                    "cannot resolve upload name"
                ),
            }
        };
        let Some((source, destination)) = next else {
            return false;
        };

        locked(&self.uploaded).insert(source.clone(), FileStamp::of(&source));
        tracing::info!(file = %source.display(), to = %destination.display(), "uploading");

        let transfer = self.transfer.clone();
        let uploaded = self.uploaded.clone();
        let completed = self.completed.clone();
        tokio::spawn(async move {
            let _permit = permit;
            match transfer.copy(&source, &destination).await {
                Ok(bytes) => {
                    completed.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(file = %source.display(), bytes, "upload finished");
                }
                Err(e) => {
                    locked(&uploaded).remove(&source);
                    tracing::warn!(
                        file = %source.display(),
                        error = %e,
                        "upload failed, will retry"
                    );
                }
            }
        });
        true
    }

    /// Wait for the in-flight transfer to finish. If it is still running after the busy
    /// timeout, transfer is disabled for the rest of the run.
    pub async fn wait_until_idle(&self, abort: &AbortFlag) -> WaitOutcome {
        if !self.is_enabled() || self.is_idle() {
            return WaitOutcome::Ready;
        }
        let slot = self.slot.clone();
        let outcome = poll_until(
            abort,
            self.drain_interval,
            Deadline::After(self.busy_timeout),
            move || {
                let slot = slot.clone();
                async move { Ok(slot.available_permits() == 1) }
            },
        )
        .await
        .unwrap_or(WaitOutcome::TimedOut);
        if outcome == WaitOutcome::TimedOut {
            self.disable("timeout waiting for an upload to finish");
        }
        outcome
    }

    /// Upload everything still pending. Gives up, disabling transfer, when no upload
    /// completes within the busy timeout. Abandons the queue if an abort is requested.
    pub async fn drain(&self, abort: &AbortFlag) {
        let mut last_progress = Instant::now();
        let mut completed = self.completed();
        loop {
            if abort.is_set() {
                self.abandon();
                return;
            }
            if !self.is_enabled() {
                return;
            }
            if let Err(e) = self.check_acquired_data() {
                tracing::warn!(error = %e, "could not list acquired data");
            }
            if self.pending() == 0 && self.is_idle() {
                tracing::info!(uploaded = self.completed(), "all data uploaded");
                return;
            }
            self.launch_next().await;
            if self.completed() != completed {
                completed = self.completed();
                last_progress = Instant::now();
            } else if last_progress.elapsed() >= self.busy_timeout {
                self.disable("no upload progress while draining");
                return;
            }
            sleep(self.drain_interval).await;
        }
    }

    /// Drop every pending file and stop launching transfers.
    pub fn abandon(&self) {
        let dropped = locked(&self.queue).clear();
        self.enabled.store(false, Ordering::SeqCst);
        tracing::warn!(dropped, "upload queue abandoned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Reachable(AtomicBool);

    #[async_trait]
    impl NetworkProbe for Reachable {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Records copies; each copy takes `delay`. Fails while `fail` is set.
    struct RecordingTransfer {
        delay: Duration,
        fail: AtomicBool,
        active: AtomicUsize,
        max_active: AtomicUsize,
        copies: Mutex<Vec<(PathBuf, PathBuf)>>,
    }

    impl RecordingTransfer {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                copies: Mutex::new(Vec::new()),
            }
        }

        fn sources(&self) -> Vec<String> {
            locked(&self.copies)
                .iter()
                .map(|(s, _)| s.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        }
    }

    #[async_trait]
    impl FileTransfer for RecordingTransfer {
        async fn copy(&self, source: &Path, destination: &Path) -> Result<u64> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("share not mounted");
            }
            locked(&self.copies).push((source.to_path_buf(), destination.to_path_buf()));
            Ok(1)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        local: PathBuf,
        pool: UploadWorkerPool,
        transfer: Arc<RecordingTransfer>,
        network: Arc<Reachable>,
    }

    fn fixture(files: &[&str], delay: Duration) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("001_HiM_s");
        for file in files {
            let path = local.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"x").unwrap();
        }
        let transfer = Arc::new(RecordingTransfer::new(delay));
        let network = Arc::new(Reachable(AtomicBool::new(true)));
        let settings = TransferConfig {
            enabled: true,
            network_path: Some(PathBuf::from("/share")),
            ..TransferConfig::default()
        };
        let pool = UploadWorkerPool::new(
            &local,
            "/share/001_HiM_s",
            network.clone(),
            transfer.clone(),
            &settings,
            None,
        );
        Fixture {
            _dir: dir,
            local,
            pool,
            transfer,
            network,
        }
    }

    #[test]
    fn test_check_acquired_data_order() {
        let f = fixture(&["a.tif", "b.npy", "c.yaml"], Duration::ZERO);
        let order = f.pool.check_acquired_data().unwrap();
        let names: Vec<_> = order.iter().map(|p| p.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["b.npy", "c.yaml", "a.tif"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let f = fixture(&["a.tif", "b.npy", "c.yaml"], Duration::from_secs(10));
        f.pool.check_acquired_data().unwrap();

        assert!(f.pool.launch_next().await);
        assert!(!f.pool.launch_next().await);
        assert!(!f.pool.is_idle());
        assert_eq!(f.pool.pending(), 2);

        sleep(Duration::from_secs(11)).await;
        assert!(f.pool.is_idle());
        assert!(f.pool.launch_next().await);
        sleep(Duration::from_secs(11)).await;
        assert!(f.pool.launch_next().await);
        sleep(Duration::from_secs(11)).await;

        assert_eq!(f.transfer.sources(), vec!["b.npy", "c.yaml", "a.tif"]);
        assert_eq!(f.transfer.max_active.load(Ordering::SeqCst), 1);
        // nothing left once everything is uploaded
        assert!(f.pool.check_acquired_data().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewritten_file_uploaded_again() {
        let f = fixture(&["metadata/events.csv", "ROI_001/a.npy"], Duration::ZERO);
        f.pool.drain(&AbortFlag::new()).await;
        assert_eq!(f.transfer.sources().len(), 2);

        let events = f.local.join("metadata/events.csv");
        std::fs::write(&events, b"x\nTask finished\n").unwrap();
        assert_eq!(f.pool.check_acquired_data().unwrap(), vec![events.clone()]);

        f.pool.drain(&AbortFlag::new()).await;
        assert_eq!(
            f.transfer.sources(),
            vec!["a.npy", "events.csv", "events.csv"]
        );
        assert!(f.pool.check_acquired_data().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destination_mirrors_run_directory() {
        let f = fixture(&["ROI_001/scan_HiM_RT1_001_ROI.npy"], Duration::ZERO);
        f.pool.check_acquired_data().unwrap();
        assert!(f.pool.launch_next().await);
        sleep(Duration::from_millis(1)).await;
        let copies = locked(&f.transfer.copies).clone();
        assert_eq!(copies[0].0, f.local.join("ROI_001/scan_HiM_RT1_001_ROI.npy"));
        assert_eq!(
            copies[0].1,
            PathBuf::from("/share/001_HiM_s/ROI_001/scan_HiM_RT1_001_ROI.npy")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_network_is_a_no_op() {
        let f = fixture(&["a.npy"], Duration::ZERO);
        f.pool.check_acquired_data().unwrap();
        f.network.0.store(false, Ordering::SeqCst);
        assert!(!f.pool.launch_next().await);
        assert_eq!(f.pool.pending(), 1);
        assert!(f.pool.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_upload_is_requeued() {
        let f = fixture(&["a.npy"], Duration::from_secs(1));
        f.transfer.fail.store(true, Ordering::SeqCst);
        f.pool.check_acquired_data().unwrap();
        assert!(f.pool.launch_next().await);
        sleep(Duration::from_secs(2)).await;
        assert!(f.pool.is_idle());
        assert_eq!(f.pool.check_acquired_data().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_timeout_disables_transfer() {
        let f = fixture(&["big.tif", "small.npy"], Duration::from_secs(3600));
        f.pool.check_acquired_data().unwrap();
        assert!(f.pool.launch_next().await);

        let abort = AbortFlag::new();
        let start = Instant::now();
        let outcome = f.pool.wait_until_idle(&abort).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(300));
        assert!(start.elapsed() < Duration::from_secs(302));
        assert!(!f.pool.is_enabled());
        assert!(!f.pool.launch_next().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_uploads_everything() {
        let f = fixture(&["a.tif", "b.npy", "c.yaml", "movie_name.txt"], Duration::from_secs(2));
        f.pool.drain(&AbortFlag::new()).await;
        assert_eq!(f.transfer.sources().len(), 4);
        assert!(f.pool.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_abandons_queue() {
        let f = fixture(&["a.tif", "b.npy"], Duration::from_secs(2));
        f.pool.check_acquired_data().unwrap();
        let abort = AbortFlag::new();
        abort.request();
        f.pool.drain(&abort).await;
        assert_eq!(f.pool.pending(), 0);
        assert!(!f.pool.is_enabled());
        assert!(f.transfer.sources().is_empty());
    }
}
