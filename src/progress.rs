//! Terminal progress: the "working" spinner and runtime setup rendering.
//!
//! Everything draws to stderr; indicatif hides itself when stderr is not a
//! terminal, so piped output stays clean.

use crate::runtime::RuntimeProgress;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::Duration;

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .tick_strings(TICKS)
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg} [{bar:30.cyan/blue}] {pos:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

/// A steady spinner that is cleared when dropped, whatever the outcome of
/// the work it covers.
pub struct Spinner {
    bar: ProgressBar,
}

impl Spinner {
    pub fn start(message: &str) -> Self {
        Self::with_target(message, ProgressDrawTarget::stderr())
    }

    fn with_target(message: &str, target: ProgressDrawTarget) -> Self {
        let bar = ProgressBar::with_draw_target(None, target);
        bar.set_style(spinner_style());
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        self.bar.finish_and_clear();
    }
}

/// Turns [`RuntimeProgress`] updates into a bar (when a percentage is known)
/// or a spinner line (when it is not).
pub struct ProgressRenderer {
    bar: Option<ProgressBar>,
    percent_mode: bool,
    hidden: bool,
}

impl ProgressRenderer {
    pub fn new() -> Self {
        Self {
            bar: None,
            percent_mode: false,
            hidden: false,
        }
    }

    #[cfg(test)]
    fn hidden() -> Self {
        Self {
            bar: None,
            percent_mode: false,
            hidden: true,
        }
    }

    fn target(&self) -> ProgressDrawTarget {
        if self.hidden {
            ProgressDrawTarget::hidden()
        } else {
            ProgressDrawTarget::stderr()
        }
    }

    pub fn update(&mut self, progress: RuntimeProgress) {
        let wants_bar = progress.percent.is_some();
        if self.bar.is_none() || wants_bar != self.percent_mode {
            self.finish();
            let bar = if wants_bar {
                let bar = ProgressBar::with_draw_target(Some(100), self.target());
                bar.set_style(bar_style());
                bar
            } else {
                let bar = ProgressBar::with_draw_target(None, self.target());
                bar.set_style(spinner_style());
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            };
            self.bar = Some(bar);
            self.percent_mode = wants_bar;
        }

        if let Some(bar) = &self.bar {
            bar.set_message(progress.status);
            if let Some(percent) = progress.percent {
                bar.set_position(percent.clamp(0.0, 100.0) as u64);
            }
        }
    }

    pub fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn position(&self) -> Option<u64> {
        self.bar.as_ref().filter(|_| self.percent_mode).map(|b| b.position())
    }
}

impl Default for ProgressRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProgressRenderer {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_renderer_switches_between_bar_and_spinner() {
        let mut renderer = ProgressRenderer::hidden();

        renderer.update(RuntimeProgress::status("Starting runtime"));
        assert_eq!(renderer.position(), None);

        renderer.update(RuntimeProgress::percent("Downloading", 50, 200));
        assert_eq!(renderer.position(), Some(25));

        renderer.update(RuntimeProgress::percent("Downloading", 200, 200));
        assert_eq!(renderer.position(), Some(100));

        renderer.update(RuntimeProgress::status("verifying"));
        assert_eq!(renderer.position(), None);

        renderer.finish();
        assert!(renderer.bar.is_none());
    }

    #[test]
    fn test_spinner_clears_on_drop() {
        let spinner = Spinner::with_target("Thinking...", ProgressDrawTarget::hidden());
        spinner.set_message("Still thinking...");
        let bar = spinner.bar.clone();
        drop(spinner);
        assert!(bar.is_finished());
    }
}
