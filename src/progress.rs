//! Progress reporting for inference runs
//!
//! Keeps progress display out of the driver so each frontend can choose its
//! own rendering.

use instant::Instant;

/// Label shown while a dataset is being embedded
pub const INFERENCE_MESSAGE: &str = "Inferring DINOv2...";

/// Progress after one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub batches_completed: usize,
    pub batches_total: usize,
    /// Instances embedded so far
    pub instances: usize,
    pub elapsed_ms: u64,
}

impl BatchProgress {
    #[must_use]
    pub fn new(
        batches_completed: usize,
        batches_total: usize,
        instances: usize,
        start_time: Instant,
    ) -> Self {
        Self {
            batches_completed,
            batches_total,
            instances,
            elapsed_ms: start_time.elapsed().as_millis() as u64,
        }
    }

    /// Completion percentage (0-100)
    #[must_use]
    pub fn percentage(&self) -> u8 {
        if self.batches_total == 0 {
            return 100;
        }
        ((self.batches_completed.min(self.batches_total) * 100) / self.batches_total) as u8
    }

    /// Remaining time extrapolated from the mean batch time
    #[must_use]
    pub fn eta_ms(&self) -> Option<u64> {
        if self.batches_completed == 0 {
            return None;
        }
        let remaining = self.batches_total.saturating_sub(self.batches_completed) as u64;
        Some(self.elapsed_ms / self.batches_completed as u64 * remaining)
    }
}

/// Receives progress of an inference run
pub trait ProgressReporter: Send + Sync {
    /// Called once before the first batch
    fn start(&self, batches_total: usize);

    /// Called after every completed batch
    fn report_batch(&self, update: BatchProgress);

    /// Called once after the last batch
    fn finish(&self, update: BatchProgress);

    /// Called when the run aborts
    fn report_error(&self, error: &str);
}

/// Discards every update
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    fn start(&self, _batches_total: usize) {}

    fn report_batch(&self, _update: BatchProgress) {}

    fn finish(&self, _update: BatchProgress) {}

    fn report_error(&self, _error: &str) {}
}

/// Logs progress through `log`
pub struct ConsoleProgressReporter {
    verbose: bool,
}

impl ConsoleProgressReporter {
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl ProgressReporter for ConsoleProgressReporter {
    fn start(&self, batches_total: usize) {
        log::info!("{} {} batches", INFERENCE_MESSAGE, batches_total);
    }

    fn report_batch(&self, update: BatchProgress) {
        if !self.verbose {
            return;
        }
        match update.eta_ms() {
            Some(eta) => log::info!(
                "[{}%] batch {}/{} ({}ms elapsed, ~{}ms remaining)",
                update.percentage(),
                update.batches_completed,
                update.batches_total,
                update.elapsed_ms,
                eta
            ),
            None => log::info!(
                "[{}%] batch {}/{}",
                update.percentage(),
                update.batches_completed,
                update.batches_total
            ),
        }
    }

    fn finish(&self, update: BatchProgress) {
        log::info!(
            "Embedded {} instances from {} batches in {}ms",
            update.instances,
            update.batches_completed,
            update.elapsed_ms
        );
    }

    fn report_error(&self, error: &str) {
        log::error!("Inference aborted: {}", error);
    }
}

/// Terminal progress bar
#[cfg(feature = "cli")]
pub struct IndicatifProgressReporter {
    bar: indicatif::ProgressBar,
}

#[cfg(feature = "cli")]
impl IndicatifProgressReporter {
    #[must_use]
    pub fn new() -> Self {
        let bar = indicatif::ProgressBar::new(0);
        if let Ok(style) = indicatif::ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} batches ({eta})")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(INFERENCE_MESSAGE);
        Self { bar }
    }
}

#[cfg(feature = "cli")]
impl Default for IndicatifProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cli")]
impl ProgressReporter for IndicatifProgressReporter {
    fn start(&self, batches_total: usize) {
        self.bar.set_length(batches_total as u64);
        self.bar.set_position(0);
    }

    fn report_batch(&self, update: BatchProgress) {
        self.bar.set_position(update.batches_completed as u64);
    }

    fn finish(&self, update: BatchProgress) {
        self.bar.finish_with_message(format!(
            "Embedded {} instances",
            update.instances
        ));
    }

    fn report_error(&self, error: &str) {
        self.bar.abandon_with_message(format!("Failed: {}", error));
    }
}
