//! Partial-transcript preview filter.
//!
//! The tmux status line redraws on a polling interval and has room for one
//! short line, so partials are collapsed to single-line text, truncated
//! with an ellipsis, and rate-limited to one emission per throttle window.
//! Intermediate partials inside a window are dropped, never reordered.

use std::time::{Duration, Instant};

/// Maximum preview length in characters before ellipsis truncation.
const PREVIEW_MAX_CHARS: usize = 60;

/// Throttled, normalizing gate in front of the partial-emission channel.
/// Owned by the engine under the state lock; `reset` is called on every
/// `start` so the first partial of an utterance is never swallowed.
#[derive(Debug)]
pub struct PreviewFilter {
    throttle: Duration,
    last_emit: Option<Instant>,
}

impl PreviewFilter {
    pub fn new(throttle_ms: u64) -> Self {
        Self {
            throttle: Duration::from_millis(throttle_ms),
            last_emit: None,
        }
    }

    /// Returns the normalized preview text if this emission is inside its
    /// own throttle window, or `None` if it should be dropped.
    pub fn admit(&mut self, text: &str) -> Option<String> {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < self.throttle {
                return None;
            }
        }
        self.last_emit = Some(now);
        Some(normalize_preview(text))
    }

    /// Forget the last emission timestamp (called on `start`).
    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

/// Collapse all whitespace runs (including newlines) to single spaces and
/// truncate to [`PREVIEW_MAX_CHARS`] characters with a trailing ellipsis.
pub fn normalize_preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_MAX_CHARS {
        return flat;
    }
    let mut truncated: String = flat.chars().take(PREVIEW_MAX_CHARS).collect();
    truncated.push('…');
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn collapses_whitespace_and_newlines() {
        assert_eq!(normalize_preview("hello   world\nagain\t "), "hello world again");
    }

    #[test]
    fn truncates_long_text_with_ellipsis() {
        let long = "a".repeat(80);
        let out = normalize_preview(&long);
        assert_eq!(out.chars().count(), PREVIEW_MAX_CHARS + 1);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(70);
        let out = normalize_preview(&long);
        assert!(out.ends_with('…'));
        assert_eq!(out.chars().count(), PREVIEW_MAX_CHARS + 1);
    }

    #[test]
    fn emissions_inside_one_window_collapse_to_one() {
        let mut filter = PreviewFilter::new(50);
        assert_eq!(filter.admit("one").as_deref(), Some("one"));
        assert_eq!(filter.admit("two"), None);
        assert_eq!(filter.admit("three"), None);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(filter.admit("four").as_deref(), Some("four"));
    }

    #[test]
    fn reset_reopens_the_window_immediately() {
        let mut filter = PreviewFilter::new(10_000);
        assert!(filter.admit("one").is_some());
        assert!(filter.admit("two").is_none());
        filter.reset();
        assert_eq!(filter.admit("two").as_deref(), Some("two"));
    }

    #[test]
    fn zero_throttle_admits_everything() {
        let mut filter = PreviewFilter::new(0);
        assert!(filter.admit("a").is_some());
        assert!(filter.admit("b").is_some());
    }
}
