//! Shared run counters and the throttled progress display.
//!
//! Workers update atomic counters at every state transition; a dedicated
//! spinner task renders a single status line at a bounded rate and the
//! orchestrator prints the final multi-line summary. The display is purely
//! informational and may observe transitions slightly out of order.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};

/// Render interval for the status line; also the effective throttle.
const RENDER_INTERVAL: Duration = Duration::from_millis(120);

/// UIDs longer than this are truncated in the status line.
const DISPLAY_UID_CHARS: usize = 30;

/// A counter set the spinner task can render.
pub trait ProgressSource {
    /// Current single-line status.
    fn status_line(&self) -> String;
    /// True once every unit of work has reached a terminal state.
    fn is_done(&self) -> bool;
}

/// Progress of the metadata resolution phase.
///
/// ETA is computed from the *fetched* rate only; cache hits are effectively
/// free and would skew the estimate.
#[derive(Debug)]
pub struct MetadataStats {
    total: usize,
    fetched: AtomicUsize,
    cached: AtomicUsize,
    failed: AtomicUsize,
    current: Mutex<String>,
    started: Instant,
}

impl MetadataStats {
    /// Creates a tracker for `total` series UIDs.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            fetched: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            current: Mutex::new(String::new()),
            started: Instant::now(),
        }
    }

    /// Records a successful fetch from the archive.
    pub fn record_fetched(&self, series_uid: &str) {
        self.fetched.fetch_add(1, Ordering::SeqCst);
        self.set_current(series_uid);
    }

    /// Records a cache hit.
    pub fn record_cached(&self, series_uid: &str) {
        self.cached.fetch_add(1, Ordering::SeqCst);
        self.set_current(series_uid);
    }

    /// Records a per-series failure.
    pub fn record_failed(&self, series_uid: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.set_current(series_uid);
    }

    /// Number of records fetched from the archive.
    #[must_use]
    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::SeqCst)
    }

    /// Number of cache hits.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.cached.load(Ordering::SeqCst)
    }

    /// Number of failed UIDs.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Total series UIDs in the manifest.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// UIDs that have reached a terminal state.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.fetched() + self.cached() + self.failed()
    }

    fn set_current(&self, series_uid: &str) {
        if let Ok(mut current) = self.current.lock() {
            *current = series_uid.to_string();
        }
    }

    fn eta(&self) -> Option<Duration> {
        let fetched = self.fetched();
        if fetched == 0 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let remaining = self.total.checked_sub(self.completed())?;
        if remaining == 0 {
            return None;
        }
        let rate = fetched as f64 / elapsed;
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

impl ProgressSource for MetadataStats {
    fn status_line(&self) -> String {
        let completed = self.completed();
        let percentage = percentage(completed, self.total);
        let eta = self
            .eta()
            .map(|eta| format!(" | ETA: {}", format_duration(eta)))
            .unwrap_or_default();
        let current = self
            .current
            .lock()
            .map(|c| truncate_uid(&c))
            .unwrap_or_default();
        format!(
            "[{completed}/{}] {percentage:.1}% | Fetched: {} | Cached: {} | Failed: {}{eta} | Current: {current}",
            self.total,
            self.fetched(),
            self.cached(),
            self.failed(),
        )
    }

    fn is_done(&self) -> bool {
        self.completed() >= self.total
    }
}

/// Process-wide counters for the download phase.
#[derive(Debug)]
pub struct DownloadStats {
    total: usize,
    downloaded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    current: Mutex<String>,
    started: Instant,
}

impl DownloadStats {
    /// Creates a tracker for `total` series.
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            downloaded: AtomicUsize::new(0),
            skipped: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            current: Mutex::new(String::new()),
            started: Instant::now(),
        }
    }

    /// Records a completed download.
    pub fn record_downloaded(&self, series_uid: &str) {
        self.downloaded.fetch_add(1, Ordering::SeqCst);
        self.set_current(series_uid);
    }

    /// Records a skipped series (precondition said present and correct).
    pub fn record_skipped(&self, series_uid: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        self.set_current(series_uid);
    }

    /// Records a series that failed after retries were exhausted.
    pub fn record_failed(&self, series_uid: &str) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        self.set_current(series_uid);
    }

    /// Number of downloaded series.
    #[must_use]
    pub fn downloaded(&self) -> usize {
        self.downloaded.load(Ordering::SeqCst)
    }

    /// Number of skipped series.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Number of failed series.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Total series dispatched to the engine.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Series that have reached a terminal state.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.downloaded() + self.skipped() + self.failed()
    }

    /// Elapsed time since the tracker was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Renders the final multi-line run summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let elapsed = self.elapsed();
        let mut summary = format!(
            "\n=== Download Summary ===\n\
             Total series: {}\n\
             Downloaded: {}\n\
             Skipped: {}\n\
             Failed: {}\n\
             Total time: {}\n",
            self.total,
            self.downloaded(),
            self.skipped(),
            self.failed(),
            format_duration(elapsed),
        );
        if self.total > 0 && elapsed.as_secs_f64() > 0.0 {
            let rate = (self.downloaded() + self.skipped()) as f64 / elapsed.as_secs_f64();
            summary.push_str(&format!("Average rate: {rate:.1} series/second\n"));
        }
        summary
    }

    fn set_current(&self, series_uid: &str) {
        if let Ok(mut current) = self.current.lock() {
            *current = series_uid.to_string();
        }
    }

    fn eta(&self) -> Option<Duration> {
        let downloaded = self.downloaded();
        if downloaded == 0 {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        let remaining = self.total.checked_sub(self.completed())?;
        if remaining == 0 {
            return None;
        }
        let rate = downloaded as f64 / elapsed;
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }
}

impl ProgressSource for DownloadStats {
    fn status_line(&self) -> String {
        let completed = self.completed();
        let percentage = percentage(completed, self.total);
        let eta = self
            .eta()
            .map(|eta| format!(" | ETA: {}", format_duration(eta)))
            .unwrap_or_default();
        let current = self
            .current
            .lock()
            .map(|c| truncate_uid(&c))
            .unwrap_or_default();
        format!(
            "[{completed}/{}] {percentage:.1}% | Downloaded: {} | Skipped: {} | Failed: {}{eta} | Current: {current}",
            self.total,
            self.downloaded(),
            self.skipped(),
            self.failed(),
        )
    }

    fn is_done(&self) -> bool {
        self.completed() >= self.total
    }
}

/// Spawns the single-line progress renderer.
///
/// Returns (handle, stop) so the caller can signal stop and await the
/// handle. When `enabled` is false, returns (None, stop) with stop already
/// set.
pub fn spawn_progress<S>(
    enabled: bool,
    source: Arc<S>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>)
where
    S: ProgressSource + Send + Sync + 'static,
{
    if !enabled {
        return (None, Arc::new(AtomicBool::new(true)));
    }

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = Arc::clone(&stop);
    let handle = tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop_flag.load(Ordering::SeqCst) && !source.is_done() {
            spinner.set_message(source.status_line());
            tokio::time::sleep(RENDER_INTERVAL).await;
        }

        spinner.set_message(source.status_line());
        spinner.finish_and_clear();
    });
    (Some(handle), stop)
}

#[allow(clippy::cast_precision_loss)]
fn percentage(completed: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        completed as f64 * 100.0 / total as f64
    }
}

fn truncate_uid(series_uid: &str) -> String {
    if series_uid.chars().count() > DISPLAY_UID_CHARS {
        let prefix: String = series_uid.chars().take(DISPLAY_UID_CHARS).collect();
        format!("{prefix}...")
    } else {
        series_uid.to_string()
    }
}

/// Formats a duration as `1h2m3s` / `4m5s` / `6s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_stats_counts_transitions() {
        let stats = MetadataStats::new(3);
        stats.record_fetched("1.1");
        stats.record_cached("1.2");
        stats.record_failed("1.3");

        assert_eq!(stats.fetched(), 1);
        assert_eq!(stats.cached(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.completed(), 3);
        assert!(stats.is_done());
    }

    #[test]
    fn test_download_stats_counter_identity() {
        let stats = DownloadStats::new(5);
        stats.record_downloaded("a");
        stats.record_downloaded("b");
        stats.record_skipped("c");
        stats.record_failed("d");
        stats.record_skipped("e");

        assert_eq!(
            stats.downloaded() + stats.skipped() + stats.failed(),
            stats.total()
        );
        assert!(stats.is_done());
    }

    #[test]
    fn test_download_stats_thread_safe() {
        use std::thread;

        let stats = Arc::new(DownloadStats::new(300));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let stats = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    stats.record_downloaded("uid");
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.downloaded(), 300);
    }

    #[test]
    fn test_status_line_includes_counters_and_current_uid() {
        let stats = DownloadStats::new(2);
        stats.record_downloaded("1.2.3");
        let line = stats.status_line();
        assert!(line.contains("[1/2]"));
        assert!(line.contains("Downloaded: 1"));
        assert!(line.contains("Skipped: 0"));
        assert!(line.contains("Failed: 0"));
        assert!(line.contains("Current: 1.2.3"));
    }

    #[test]
    fn test_status_line_truncates_long_uids() {
        let stats = MetadataStats::new(1);
        let long_uid = "1.3.6.1.4.1.14519.5.2.1.6279.6001.298806137288633453246975630178";
        stats.record_fetched(long_uid);
        let line = stats.status_line();
        assert!(line.contains("1.3.6.1.4.1.14519.5.2.1.6279.6..."));
        assert!(!line.contains(long_uid));
    }

    #[test]
    fn test_summary_contains_all_counters() {
        let stats = DownloadStats::new(3);
        stats.record_downloaded("a");
        stats.record_skipped("b");
        stats.record_failed("c");

        let summary = stats.summary();
        assert!(summary.contains("Total series: 3"));
        assert!(summary.contains("Downloaded: 1"));
        assert!(summary.contains("Skipped: 1"));
        assert!(summary.contains("Failed: 1"));
        assert!(summary.contains("Total time:"));
    }

    #[test]
    fn test_empty_run_is_done_immediately() {
        let stats = DownloadStats::new(0);
        assert!(stats.is_done());
        assert_eq!(stats.completed(), 0);
    }

    #[test]
    fn test_eta_absent_before_first_fetch() {
        let stats = MetadataStats::new(10);
        stats.record_cached("1.1");
        assert!(stats.eta().is_none());
    }

    #[test]
    fn test_format_duration_styles() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[tokio::test]
    async fn test_spawn_progress_disabled_returns_stopped() {
        let stats = Arc::new(DownloadStats::new(1));
        let (handle, stop) = spawn_progress(false, stats);
        assert!(handle.is_none());
        assert!(stop.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_spawn_progress_stops_on_signal() {
        let stats = Arc::new(DownloadStats::new(100));
        let (handle, stop) = spawn_progress(true, stats);
        stop.store(true, Ordering::SeqCst);
        handle.unwrap().await.unwrap();
    }
}
