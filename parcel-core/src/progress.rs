//! Progress reporting for transfers
//!
//! [`ProgressTracker`] folds download events into a bounded, monotonic
//! percentage. It does no I/O; rendering is left to observers.

use std::fmt;
use tracing::warn;

use crate::events::DownloadEvent;

const KB: f64 = 1024.0;
const MB: f64 = 1024.0 * 1024.0;

/// Width of the bar drawn by [`ProgressState::render`]
pub const BAR_WIDTH: usize = 30;

/// What a display should show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// No total size yet
    Indeterminate { transferred: u64 },
    Percent(u8),
}

impl ProgressState {
    /// One-line bar such as `[###############---------------]  50%`
    pub fn render(&self) -> String {
        match self {
            ProgressState::Indeterminate { transferred } => {
                format!("[{}] {}", "?".repeat(BAR_WIDTH), human_size(*transferred))
            }
            ProgressState::Percent(percent) => {
                let filled = BAR_WIDTH * (*percent as usize) / 100;
                format!(
                    "[{}{}] {:>3}%",
                    "#".repeat(filled),
                    "-".repeat(BAR_WIDTH - filled),
                    percent
                )
            }
        }
    }
}

/// Accumulated transfer progress
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    transferred: u64,
    total: Option<u64>,
    last_percent: u8,
    anomalies: u64,
    finished: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event and return the state to display, if it changed meaningfully
    pub fn observe(&mut self, event: &DownloadEvent) -> Option<ProgressState> {
        match event {
            DownloadEvent::Found { total_size } => Some(self.set_total(*total_size)),
            DownloadEvent::Progress { offset } => Some(self.advance(*offset)),
            DownloadEvent::AllDone { bytes_written } => Some(self.complete(*bytes_written)),
            DownloadEvent::Abort { .. } => None,
        }
    }

    pub fn set_total(&mut self, total: u64) -> ProgressState {
        self.total = Some(total);
        if self.transferred > total {
            self.note_anomaly(self.transferred, "offset beyond announced total");
            self.transferred = total;
        }
        self.state()
    }

    /// Record a reported byte offset
    ///
    /// Offsets that go backwards or overshoot the total are clamped.
    pub fn advance(&mut self, offset: u64) -> ProgressState {
        if offset < self.transferred {
            self.note_anomaly(offset, "offset went backwards");
        } else {
            self.transferred = offset;
        }

        if let Some(total) = self.total {
            if self.transferred > total {
                self.note_anomaly(offset, "offset beyond announced total");
                self.transferred = total;
            }
        }

        self.state()
    }

    /// Record terminal success; the written byte count is authoritative
    pub fn complete(&mut self, bytes_written: u64) -> ProgressState {
        self.transferred = bytes_written;
        self.total = Some(self.total.map_or(bytes_written, |t| t.max(bytes_written)));
        self.finished = true;
        self.last_percent = 100;
        ProgressState::Percent(100)
    }

    pub fn state(&mut self) -> ProgressState {
        match self.total {
            None => ProgressState::Indeterminate {
                transferred: self.transferred,
            },
            Some(total) => {
                let percent = if self.finished || total == 0 {
                    100
                } else {
                    (self.transferred.saturating_mul(100) / total).min(100) as u8
                };
                self.last_percent = self.last_percent.max(percent);
                ProgressState::Percent(self.last_percent)
            }
        }
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    /// Number of clamped offsets seen so far
    pub fn anomalies(&self) -> u64 {
        self.anomalies
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Human-readable size of everything transferred
    pub fn summary(&self) -> String {
        human_size(self.transferred)
    }

    fn note_anomaly(&mut self, offset: u64, what: &str) {
        self.anomalies += 1;
        warn!(
            offset,
            transferred = self.transferred,
            total = ?self.total,
            "Progress anomaly: {}",
            what
        );
    }
}

impl fmt::Display for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.total {
            Some(total) => write!(f, "{} / {}", human_size(self.transferred), human_size(total)),
            None => write!(f, "{}", human_size(self.transferred)),
        }
    }
}

/// Format a byte count, scaling by 1024 per step up to MB
pub fn human_size(bytes: u64) -> String {
    let value = bytes as f64;
    if value < KB {
        format!("{} B", bytes)
    } else if value < MB {
        format!("{:.2} KB", value / KB)
    } else {
        format!("{:.2} MB", value / MB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indeterminate_until_found() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(
            tracker.advance(500),
            ProgressState::Indeterminate { transferred: 500 }
        );
        assert_eq!(tracker.set_total(1000), ProgressState::Percent(50));
    }

    #[test]
    fn test_half_then_complete() {
        let mut tracker = ProgressTracker::new();
        let states: Vec<_> = [
            DownloadEvent::Found {
                total_size: 2_000_000,
            },
            DownloadEvent::Progress { offset: 1_000_000 },
            DownloadEvent::AllDone {
                bytes_written: 2_000_000,
            },
        ]
        .iter()
        .filter_map(|e| tracker.observe(e))
        .collect();

        assert_eq!(
            states,
            vec![
                ProgressState::Percent(0),
                ProgressState::Percent(50),
                ProgressState::Percent(100)
            ]
        );
        assert_eq!(tracker.summary(), "1.91 MB");
    }

    #[test]
    fn test_percentage_floors() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total(3);
        assert_eq!(tracker.advance(1), ProgressState::Percent(33));
        assert_eq!(tracker.advance(2), ProgressState::Percent(66));
    }

    #[test]
    fn test_backwards_offset_is_clamped() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total(100);
        tracker.advance(80);
        assert_eq!(tracker.advance(20), ProgressState::Percent(80));
        assert_eq!(tracker.transferred(), 80);
        assert_eq!(tracker.anomalies(), 1);
    }

    #[test]
    fn test_overshoot_is_clamped() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total(100);
        assert_eq!(tracker.advance(150), ProgressState::Percent(100));
        assert_eq!(tracker.transferred(), 100);
        assert_eq!(tracker.anomalies(), 1);
    }

    #[test]
    fn test_zero_total_is_complete() {
        let mut tracker = ProgressTracker::new();
        assert_eq!(tracker.set_total(0), ProgressState::Percent(100));
        assert_eq!(tracker.summary(), "0 B");
    }

    #[test]
    fn test_abort_changes_nothing() {
        let mut tracker = ProgressTracker::new();
        tracker.set_total(10);
        tracker.advance(5);
        assert_eq!(
            tracker.observe(&DownloadEvent::Abort {
                reason: "peer gone".into()
            }),
            None
        );
        assert_eq!(tracker.transferred(), 5);
        assert!(!tracker.is_finished());
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(1023), "1023 B");
        assert_eq!(human_size(1024), "1.00 KB");
        assert_eq!(human_size(1536), "1.50 KB");
        assert_eq!(human_size(1_048_576), "1.00 MB");
    }

    #[test]
    fn test_render() {
        assert_eq!(
            ProgressState::Percent(50).render(),
            format!("[{}{}]  50%", "#".repeat(15), "-".repeat(15))
        );
        assert!(ProgressState::Indeterminate { transferred: 10 }
            .render()
            .ends_with("10 B"));
    }
}
