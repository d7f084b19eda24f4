use scene_narrator_common::frame::Frame;
use tracing::{debug, warn};

/// Pixel-difference scene change detector.
///
/// Compares each frame against the one seen immediately before it and
/// reports a change when the fraction of differing pixels reaches the
/// threshold. The baseline advances on every call, so this measures
/// frame-to-frame change rather than change since the last narration:
/// slow drift that never crosses the threshold between two consecutive
/// frames is never reported.
#[derive(Debug, Clone)]
pub struct ChangeDetector {
    previous: Option<Frame>,
    threshold: f64,
}

impl ChangeDetector {
    pub fn new(threshold: f64) -> Self {
        Self {
            previous: None,
            threshold,
        }
    }

    /// Returns `true` if `current` differs from the previous frame by at
    /// least the threshold. The first frame always counts as a change.
    pub fn changed(&mut self, current: &Frame) -> bool {
        let previous = match self.previous.replace(current.clone()) {
            Some(p) => p,
            None => {
                debug!("first frame, treating as changed");
                return true;
            }
        };

        match change_ratio(&previous, current) {
            Some(ratio) => {
                let changed = ratio >= self.threshold;
                debug!(
                    ratio = format!("{:.4}", ratio),
                    threshold = format!("{:.4}", self.threshold),
                    changed,
                    "frame comparison"
                );
                changed
            }
            None if previous.dimensions() != current.dimensions() => {
                warn!(
                    previous = ?previous.dimensions(),
                    current = ?current.dimensions(),
                    "frame dimensions changed, treating as scene change"
                );
                true
            }
            None => false,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn previous(&self) -> Option<&Frame> {
        self.previous.as_ref()
    }
}

/// Fraction of pixels in `b` that differ from `a` in any channel.
///
/// Returns `None` when the frames have different dimensions or contain no
/// pixels.
pub fn change_ratio(a: &Frame, b: &Frame) -> Option<f64> {
    if a.dimensions() != b.dimensions() || a.is_empty() {
        return None;
    }
    let changed = a.pixels().zip(b.pixels()).filter(|(p, q)| p != q).count();
    Some(changed as f64 / a.pixel_count() as f64)
}
