use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scene_narrator_common::frame::Frame;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::capture::FrameSource;
use crate::detection::coordinator::RequestCoordinator;
use crate::filter::change::ChangeDetector;
use crate::filter::gate::{self, NEVER};
use crate::speech::NarrationSink;
use crate::stop::StopSignal;

const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(100);

/// Everything the loop carries from one iteration to the next.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub detector: ChangeDetector,
    /// Unix ms of the last narration, [`NEVER`] before the first.
    pub last_update_ms: i64,
}

impl LoopState {
    pub fn new(change_threshold: f64) -> Self {
        Self {
            detector: ChangeDetector::new(change_threshold),
            last_update_ms: NEVER,
        }
    }
}

/// What one iteration did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// No usable frame was captured.
    Skipped,
    /// The scene did not change enough.
    Unchanged,
    /// The scene changed but the last narration is too recent.
    Throttled,
    /// A description was produced and narrated.
    Narrated(String),
    /// The coordinator refused the request.
    Rejected,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoopStats {
    pub frames: u64,
    pub skipped: u64,
    pub narrations: u64,
}

pub struct Narrator {
    coordinator: Arc<RequestCoordinator>,
    sink: Box<dyn NarrationSink>,
    update_interval_ms: u64,
    jpeg_quality: u8,
}

impl Narrator {
    pub fn new(
        coordinator: Arc<RequestCoordinator>,
        sink: Box<dyn NarrationSink>,
        update_interval_ms: u64,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            coordinator,
            sink,
            update_interval_ms,
            jpeg_quality,
        }
    }

    /// Run one iteration against `frame` captured at `now_ms`.
    ///
    /// The change detector is always consulted first so its baseline
    /// advances even while the update gate is closed.
    pub async fn step(
        &self,
        mut state: LoopState,
        frame: Option<Frame>,
        now_ms: i64,
    ) -> (LoopState, StepOutcome) {
        let Some(frame) = frame.filter(|f| !f.is_empty()) else {
            return (state, StepOutcome::Skipped);
        };

        if !state.detector.changed(&frame) {
            return (state, StepOutcome::Unchanged);
        }

        if !gate::allowed(now_ms, state.last_update_ms, self.update_interval_ms) {
            debug!(
                now_ms,
                last_update_ms = state.last_update_ms,
                interval_ms = self.update_interval_ms,
                "scene changed but narration interval not reached"
            );
            return (state, StepOutcome::Throttled);
        }

        debug!(
            captured_at = %frame.captured_at().format("%H:%M:%S%.3f"),
            "scene changed, requesting description"
        );
        let image_bytes = frame.to_jpeg(self.jpeg_quality).unwrap_or_else(|e| {
            warn!(error = %e, "failed to encode frame");
            Vec::new()
        });

        match self.coordinator.detect(&image_bytes).await {
            Ok(description) => {
                self.sink.narrate(&description).await;
                state.last_update_ms = now_ms;
                (state, StepOutcome::Narrated(description))
            }
            Err(e) => {
                warn!(error = %e, "detection request rejected");
                (state, StepOutcome::Rejected)
            }
        }
    }

    /// Poll `source` at `fps` until `stop` fires.
    pub async fn run(
        &self,
        source: &mut dyn FrameSource,
        mut state: LoopState,
        stop: &mut StopSignal,
        fps: f64,
    ) -> LoopStats {
        let mut ticker = tokio::time::interval(poll_period(fps));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats = LoopStats::default();

        info!(
            source = source.name(),
            sink = self.sink.name(),
            max_concurrent_requests = self.coordinator.capacity(),
            fps,
            interval_ms = self.update_interval_ms,
            threshold = state.detector.threshold(),
            "entering capture loop"
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = ticker.tick() => {}
            }

            let frame = source.grab().await;
            let now_ms = Utc::now().timestamp_millis();
            let (next, outcome) = self.step(state, frame, now_ms).await;
            state = next;

            stats.frames += 1;
            match outcome {
                StepOutcome::Skipped => stats.skipped += 1,
                StepOutcome::Narrated(_) => stats.narrations += 1,
                _ => {}
            }
            if stats.frames % 100 == 0 {
                debug!(frames = stats.frames, narrations = stats.narrations, "frames processed");
            }

            if stop.is_stopped() {
                break;
            }
        }

        info!(
            frames = stats.frames,
            skipped = stats.skipped,
            narrations = stats.narrations,
            "capture loop stopped"
        );
        stats
    }
}

/// Tick period for `fps`, falling back to [`DEFAULT_POLL_PERIOD`] when the
/// rate does not give a usable non-zero period.
fn poll_period(fps: f64) -> Duration {
    match Duration::try_from_secs_f64(1.0 / fps) {
        Ok(period) if !period.is_zero() => period,
        _ => {
            warn!(fps, "unusable polling rate, using default period");
            DEFAULT_POLL_PERIOD
        }
    }
}
