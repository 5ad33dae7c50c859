//! Scan state machine
//!
//! `Idle -> Scanning -> {Found, TimedOut} -> Done`. A scanner runs exactly
//! one scan; create a new one to scan again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::DeviceDescriptor;
use crate::error::DiscoveryError;

/// Descriptors buffered between the backend task and the scan stream
const RESULT_BUFFER: usize = 64;

/// Source of raw discovery results
#[async_trait]
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Send every device seen to `tx` until `cancel` fires.
    ///
    /// Duplicates are fine; the scan stream filters them.
    async fn query(
        &self,
        tx: mpsc::Sender<DeviceDescriptor>,
        cancel: CancellationToken,
    ) -> Result<(), DiscoveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScanState {
    Idle,
    Scanning,
    Found,
    TimedOut,
    Done,
}

pub struct DeviceScanner {
    backend: Arc<dyn DiscoveryBackend>,
    timeout: Duration,
    state: Arc<Mutex<ScanState>>,
}

impl DeviceScanner {
    pub fn new(backend: Arc<dyn DiscoveryBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            timeout,
            state: Arc::new(Mutex::new(ScanState::Idle)),
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    /// Start the scan. Fails unless the scanner is still idle.
    pub fn start(&self) -> Result<ScanStream, DiscoveryError> {
        {
            let mut state = self.state.lock();
            if *state != ScanState::Idle {
                return Err(DiscoveryError::ScannerUsed);
            }
            *state = ScanState::Scanning;
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let backend = self.backend.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { backend.query(tx, token).await });

        tracing::debug!(timeout = ?self.timeout, "Device scan started");

        Ok(ScanStream {
            rx,
            seen: HashSet::new(),
            deadline: Instant::now() + self.timeout,
            cancel,
            state: self.state.clone(),
            task: Some(task),
            error: None,
        })
    }

    /// Scan until a device named exactly `name` shows up
    pub async fn find_device(&self, name: &str) -> Result<DeviceDescriptor, DiscoveryError> {
        let mut scan = self.start()?;

        while let Some(device) = scan.next().await {
            if device.name == name {
                scan.confirm(&device);
                tracing::info!(
                    "Found device {} at {}:{}",
                    device.name,
                    device.address,
                    device.port
                );
                return Ok(device);
            }
            tracing::info!("Skipping device {} at {}", device.name, device.address);
        }

        match scan.take_error() {
            Some(e) => Err(e),
            None => Err(DiscoveryError::DeviceNotFound(name.to_string())),
        }
    }
}

/// Deduplicated results of one scan
pub struct ScanStream {
    rx: mpsc::Receiver<DeviceDescriptor>,
    seen: HashSet<String>,
    deadline: Instant,
    cancel: CancellationToken,
    state: Arc<Mutex<ScanState>>,
    task: Option<JoinHandle<Result<(), DiscoveryError>>>,
    error: Option<DiscoveryError>,
}

impl ScanStream {
    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    /// Next device not seen before in this scan, or `None` once the scan is over
    pub async fn next(&mut self) -> Option<DeviceDescriptor> {
        loop {
            if self.state() != ScanState::Scanning {
                // drain what the backend already produced
                while let Ok(device) = self.rx.try_recv() {
                    if self.seen.insert(device.name.clone()) {
                        return Some(device);
                    }
                }
                self.finish();
                return None;
            }

            let backend_running = self.task.is_some();
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(self.deadline) => {
                    self.transition(ScanState::TimedOut);
                    tracing::debug!("Device scan timed out");
                }
                device = self.rx.recv(), if backend_running => match device {
                    Some(device) => {
                        if self.seen.insert(device.name.clone()) {
                            return Some(device);
                        }
                        tracing::trace!("Duplicate answer from {}", device.name);
                    }
                    None => self.reap_backend().await,
                },
            }
        }
    }

    /// Stop scanning; `device` is the one the caller wanted
    pub fn confirm(&mut self, device: &DeviceDescriptor) {
        tracing::debug!("Confirmed device {}", device.name);
        self.transition(ScanState::Found);
    }

    /// Error the backend failed with, if any
    pub fn take_error(&mut self) -> Option<DiscoveryError> {
        self.error.take()
    }

    fn transition(&mut self, to: ScanState) {
        let mut state = self.state.lock();
        if *state == ScanState::Scanning {
            *state = to;
        }
        drop(state);
        self.cancel.cancel();
    }

    fn finish(&mut self) {
        self.cancel.cancel();
        let mut state = self.state.lock();
        if *state != ScanState::Idle {
            *state = ScanState::Done;
        }
    }

    /// The backend closed its sender; collect how it ended
    async fn reap_backend(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        match task.await {
            Ok(Ok(())) => tracing::debug!("Discovery backend finished early"),
            Ok(Err(e)) => {
                tracing::warn!("Discovery backend failed: {}", e);
                self.error = Some(e);
                self.transition(ScanState::TimedOut);
            }
            Err(e) => {
                tracing::warn!("Discovery backend task failed: {}", e);
                self.transition(ScanState::TimedOut);
            }
        }
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Answers with `(delay, name)` pairs, then idles until cancelled
    struct FakeBackend {
        answers: Vec<(Duration, &'static str)>,
        cancelled: Arc<AtomicBool>,
    }

    impl FakeBackend {
        fn new(answers: Vec<(u64, &'static str)>) -> Self {
            Self {
                answers: answers
                    .into_iter()
                    .map(|(ms, name)| (Duration::from_millis(ms), name))
                    .collect(),
                cancelled: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl DiscoveryBackend for FakeBackend {
        async fn query(
            &self,
            tx: mpsc::Sender<DeviceDescriptor>,
            cancel: CancellationToken,
        ) -> Result<(), DiscoveryError> {
            let start = Instant::now();
            for (at, name) in &self.answers {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep_until(start + *at) => {}
                }
                let device = DeviceDescriptor::new(*name, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), 8009);
                if tx.send(device).await.is_err() {
                    break;
                }
            }
            cancel.cancelled().await;
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl DiscoveryBackend for FailingBackend {
        async fn query(
            &self,
            _tx: mpsc::Sender<DeviceDescriptor>,
            _cancel: CancellationToken,
        ) -> Result<(), DiscoveryError> {
            Err(DiscoveryError::NoInterface)
        }
    }

    fn scanner(backend: impl DiscoveryBackend) -> DeviceScanner {
        DeviceScanner::new(Arc::new(backend), Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_match_times_out_at_deadline() {
        let scanner = scanner(FakeBackend::new(vec![(100, "Kitchen")]));
        let start = Instant::now();

        let result = scanner.find_device("Living Room").await;
        assert!(matches!(result, Err(DiscoveryError::DeviceNotFound(ref n)) if n == "Living Room"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_millis(5050));
        assert_eq!(scanner.state(), ScanState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_match_returns_before_deadline() {
        let backend = FakeBackend::new(vec![(100, "Kitchen"), (300, "Living Room")]);
        let cancelled = backend.cancelled.clone();
        let scanner = scanner(backend);
        let start = Instant::now();

        let device = scanner.find_device("Living Room").await.unwrap();
        assert_eq!(device.name, "Living Room");
        assert_eq!(device.port, 8009);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300) && elapsed < Duration::from_secs(1));
        assert_eq!(scanner.state(), ScanState::Done);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_name_match_is_exact() {
        let scanner = scanner(FakeBackend::new(vec![(100, "living room")]));
        assert!(matches!(
            scanner.find_device("Living Room").await,
            Err(DiscoveryError::DeviceNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicates_suppressed() {
        let scanner = scanner(FakeBackend::new(vec![
            (10, "Kitchen"),
            (20, "Kitchen"),
            (30, "Office"),
            (40, "Kitchen"),
        ]));
        let mut scan = scanner.start().unwrap();

        let mut names = Vec::new();
        while let Some(device) = scan.next().await {
            names.push(device.name);
        }
        assert_eq!(names, vec!["Kitchen", "Office"]);
        assert_eq!(scan.state(), ScanState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_ends_scan_but_drains_buffered() {
        let scanner = scanner(FakeBackend::new(vec![(10, "Kitchen"), (10, "Office")]));
        let mut scan = scanner.start().unwrap();

        let first = scan.next().await.unwrap();
        // let the backend deliver the second answer into the buffer
        tokio::time::sleep(Duration::from_millis(1)).await;
        scan.confirm(&first);
        assert_eq!(scan.state(), ScanState::Found);

        assert_eq!(scan.next().await.map(|d| d.name), Some("Office".to_string()));
        assert!(scan.next().await.is_none());
        assert_eq!(scan.state(), ScanState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scanner_is_single_use() {
        let scanner = scanner(FakeBackend::new(vec![]));
        let scan = scanner.start().unwrap();
        assert!(matches!(scanner.start(), Err(DiscoveryError::ScannerUsed)));
        drop(scan);
        assert!(matches!(scanner.start(), Err(DiscoveryError::ScannerUsed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_error_surfaces() {
        let scanner = scanner(FailingBackend);
        assert!(matches!(
            scanner.find_device("Kitchen").await,
            Err(DiscoveryError::NoInterface)
        ));
    }
}
