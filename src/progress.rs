//! Terminal progress reporting.
//!
//! A single-line bar over stderr, throttled by indicatif's draw-rate
//! limiter so per-part updates never flood a slow terminal. The bar is
//! parked just short of full while parts upload and during finalisation;
//! it only completes once the backend has durably assembled the archive.
//! In quiet mode (or when stderr is not a terminal) nothing renders, but
//! `log` lines still reach stderr.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Progress reporter for one upload run.
pub struct Progress {
    bar: ProgressBar,
    quiet: bool,
}

impl Progress {
    /// `parts_needed` sets the bar length; `quiet` disables rendering.
    pub fn new(parts_needed: u64, quiet: bool) -> Self {
        // Draw at most a few frames per second regardless of how fast
        // parts complete.
        let target = if quiet {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stderr_with_hz(4)
        };
        let bar = ProgressBar::with_draw_target(Some(parts_needed), target);
        if !quiet {
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg:<12} [{bar:40.cyan/blue}] {pos}/{len} parts ({percent}%)",
                )
                .expect("static template is valid")
                .progress_chars("=> "),
            );
        }
        Self { bar, quiet }
    }

    /// Record completed-part count. Never shows 100% — the last percent
    /// belongs to finalisation.
    pub fn parts_done(&self, done: u64) {
        let capped = done.min(self.bar.length().unwrap_or(done).saturating_sub(1));
        self.bar.set_position(capped.max(self.bar.position()));
        self.bar.set_message("uploading");
    }

    /// Entering the finalise step.
    pub fn finalising(&self) {
        self.bar.set_message("finalising");
    }

    /// Terminal success: complete the bar and leave it on screen.
    pub fn finish(&self) {
        if let Some(len) = self.bar.length() {
            self.bar.set_position(len);
        }
        self.bar.finish_with_message("done");
    }

    /// Clear the bar (error path) so diagnostics print on a clean line.
    pub fn clear(&self) {
        self.bar.finish_and_clear();
    }

    /// Write a line without tearing the bar.
    pub fn log(&self, msg: &str) {
        if self.quiet {
            eprintln!("{msg}");
        } else {
            self.bar.println(msg);
        }
    }
}
