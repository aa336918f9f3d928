//! Progress reporting with TTY detection, for CLI front-ends driving a
//! build. Shows a progress bar over a build's stages in TTY mode and falls
//! back to line-at-a-time text output otherwise.

use std::time::Instant;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Progress reporter over a build's stages: a progress bar in TTY mode,
/// `[n/total] <message>` lines otherwise.
pub struct StageProgress {
    is_tty: bool,
    total_stages: usize,
    current_stage: usize,
    current_name: String,
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
}

impl StageProgress {
    pub fn new(total_stages: usize) -> Self {
        let is_tty = is_tty();
        let progress_bar = if is_tty {
            let pb = ProgressBar::new(total_stages as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self { is_tty, total_stages, current_stage: 0, current_name: String::new(), progress_bar, start_time: Instant::now() }
    }

    /// A reporter that always uses non-TTY mode, regardless of the actual
    /// terminal — for `--no-progress` and non-interactive invocations.
    pub fn silent(total_stages: usize) -> Self {
        Self { is_tty: false, total_stages, current_stage: 0, current_name: String::new(), progress_bar: None, start_time: Instant::now() }
    }

    /// Marks `name` as the current stage. `index` is 1-indexed.
    pub fn set_stage(&mut self, index: usize, name: &str) {
        self.current_stage = index;
        self.current_name = name.to_string();

        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!("[{}/{}] Running {}... ({elapsed:?})", self.current_stage, self.total_stages, self.current_name);
                pb.set_message(msg);
                pb.set_position((self.current_stage - 1) as u64);
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!("[{}/{}] Running {}... ({elapsed:?})", self.current_stage, self.total_stages, self.current_name);
        }
    }

    /// Marks the current stage as completed.
    pub fn finish_stage(&mut self) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                pb.inc(1);
            }
        }
    }

    /// Sets a status message under the current stage (e.g. "waiting for approval").
    pub fn set_status(&self, status: &str) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let current = pb.position();
                pb.set_message(format!("[{}/{}] {status}", current + 1, self.total_stages));
            }
        } else {
            eprintln!("[status] {status}");
        }
    }

    pub fn finish(self) {
        if self.is_tty {
            if let Some(pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                pb.set_message(format!("Completed {} stages in {elapsed:?}", self.total_stages));
                pb.finish();
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!("Completed {}/{} stages in {elapsed:?}", self.total_stages, self.total_stages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_tty_returns_bool() {
        let result = is_tty();
        assert!(matches!(result, true | false));
    }

    #[test]
    fn silent_reporter_disables_tty() {
        let reporter = StageProgress::silent(3);
        assert!(!reporter.is_tty);
        assert!(reporter.progress_bar.is_none());
    }

    #[test]
    fn set_stage_updates_state() {
        let mut reporter = StageProgress::silent(3);
        reporter.set_stage(1, "build");
        assert_eq!(reporter.current_stage, 1);
        assert_eq!(reporter.current_name, "build");
    }

    #[test]
    fn finish_stage_is_callable_in_silent_mode() {
        let mut reporter = StageProgress::silent(3);
        reporter.set_stage(1, "build");
        reporter.finish_stage();
    }

    #[test]
    fn finish_completes_without_panic() {
        let reporter = StageProgress::silent(3);
        reporter.finish();
    }
}
