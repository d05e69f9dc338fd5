//! Rolling per-frame timing and periodic snapshots.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const MAX_SAMPLES: usize = 120;
/// One display refresh at 60 Hz
pub const FRAME_BUDGET_MS: f64 = 1000.0 / 60.0;

const FPS_WINDOW: Duration = Duration::from_millis(1000);
const EMIT_INTERVAL: Duration = Duration::from_millis(250);

/// Bounded FIFO of timing samples in milliseconds.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<f64>,
    cap: usize,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, sample: f64) {
        if self.samples.len() == self.cap {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn peak(&self) -> f64 {
        self.samples.iter().copied().fold(0.0, f64::max)
    }

    pub fn oldest(&self) -> Option<f64> {
        self.samples.front().copied()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Stopped,
}

/// What listeners receive, at most four times a second.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub backend: String,
    pub fps: u32,
    pub cpu_avg: f64,
    pub cpu_peak: f64,
    pub gpu_avg: f64,
    pub gpu_peak: f64,
    /// Last successful inference, milliseconds
    pub latency_ms: f64,
    pub status: SessionStatus,
}

impl MetricsSnapshot {
    pub fn log(&self) {
        tracing::info!(
            backend = %self.backend,
            fps = self.fps,
            cpu_avg_ms = format_args!("{:.1}", self.cpu_avg),
            cpu_peak_ms = format_args!("{:.1}", self.cpu_peak),
            gpu_avg_ms = format_args!("{:.1}", self.gpu_avg),
            gpu_peak_ms = format_args!("{:.1}", self.gpu_peak),
            latency_ms = format_args!("{:.1}", self.latency_ms),
            status = ?self.status,
            "metrics"
        );
    }
}

/// Frame timing aggregator owned by the render loop.
///
/// `cpu` samples are the time spent producing a frame; `gpu` samples are
/// how far the display interval overran the 16.7 ms budget.
#[derive(Debug)]
pub struct MetricsAggregator {
    cpu: SampleWindow,
    gpu: SampleWindow,
    fps: u32,
    frames: u32,
    window_start: Instant,
    last_emit: Option<Instant>,
    latency_ms: f64,
    backend: String,
    status: SessionStatus,
}

impl MetricsAggregator {
    pub fn new(now: Instant) -> Self {
        Self {
            cpu: SampleWindow::new(MAX_SAMPLES),
            gpu: SampleWindow::new(MAX_SAMPLES),
            fps: 0,
            frames: 0,
            window_start: now,
            last_emit: None,
            latency_ms: 0.0,
            backend: "-".to_string(),
            status: SessionStatus::Stopped,
        }
    }

    /// Clear all samples and start a fresh FPS window.
    pub fn reset(&mut self, now: Instant, backend: &str, status: SessionStatus) {
        self.cpu.clear();
        self.gpu.clear();
        self.fps = 0;
        self.frames = 0;
        self.window_start = now;
        self.latency_ms = 0.0;
        self.backend = backend.to_string();
        self.status = status;
    }

    pub fn record_frame(&mut self, cpu_ms: f64, over_budget_ms: f64) {
        self.cpu.push(cpu_ms);
        self.gpu.push(over_budget_ms.max(0.0));
    }

    pub fn record_latency(&mut self, ms: f64) {
        self.latency_ms = ms;
    }

    pub fn set_status(&mut self, status: SessionStatus) {
        self.status = status;
    }

    /// Count one rendered frame. Returns the new FPS value when the window
    /// closes.
    pub fn tick(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < FPS_WINDOW {
            return None;
        }
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        self.fps = (self.frames as f64 * 1000.0 / elapsed_ms).round() as u32;
        self.frames = 0;
        self.window_start = now;
        Some(self.fps)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backend: self.backend.clone(),
            fps: self.fps,
            cpu_avg: self.cpu.avg(),
            cpu_peak: self.cpu.peak(),
            gpu_avg: self.gpu.avg(),
            gpu_peak: self.gpu.peak(),
            latency_ms: self.latency_ms,
            status: self.status,
        }
    }

    /// Snapshot for listeners, or `None` if one went out less than 250 ms ago.
    pub fn poll_emit(&mut self, now: Instant) -> Option<MetricsSnapshot> {
        if let Some(last) = self.last_emit {
            if now.saturating_duration_since(last) < EMIT_INTERVAL {
                return None;
            }
        }
        self.last_emit = Some(now);
        Some(self.snapshot())
    }

    /// How long until `poll_emit` would hand out a snapshot again.
    pub fn until_next_emit(&self, now: Instant) -> Duration {
        match self.last_emit {
            Some(last) => EMIT_INTERVAL.saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }
}

/// How far a display interval of `dt` overran the frame budget.
pub fn over_budget_ms(dt: Duration) -> f64 {
    (dt.as_secs_f64() * 1000.0 - FRAME_BUDGET_MS).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_capped_and_fifo() {
        let mut w = SampleWindow::new(MAX_SAMPLES);
        for i in 0..MAX_SAMPLES {
            w.push(i as f64);
        }
        assert_eq!(w.len(), 120);
        assert_eq!(w.oldest(), Some(0.0));

        w.push(999.0);
        assert_eq!(w.len(), 120);
        assert_eq!(w.oldest(), Some(1.0));
        assert_eq!(w.peak(), 999.0);
    }

    #[test]
    fn thirty_frames_in_one_second_is_thirty_fps() {
        let t0 = Instant::now();
        let mut m = MetricsAggregator::new(t0);
        let mut reported = None;
        for i in 1..=30u64 {
            let now = t0 + Duration::from_millis(i * 1000 / 30);
            if let Some(fps) = m.tick(now) {
                reported = Some(fps);
            }
        }
        assert_eq!(reported, Some(30));
        assert_eq!(m.snapshot().fps, 30);
    }

    #[test]
    fn fps_uses_measured_window() {
        let t0 = Instant::now();
        let mut m = MetricsAggregator::new(t0);
        for _ in 0..59 {
            assert_eq!(m.tick(t0 + Duration::from_millis(500)), None);
        }
        assert_eq!(m.tick(t0 + Duration::from_millis(2000)), Some(30));
    }

    #[test]
    fn emission_is_rate_limited() {
        let t0 = Instant::now();
        let mut m = MetricsAggregator::new(t0);
        assert!(m.poll_emit(t0).is_some());
        assert!(m.poll_emit(t0 + Duration::from_millis(100)).is_none());
        assert!(m.poll_emit(t0 + Duration::from_millis(249)).is_none());
        assert!(m.poll_emit(t0 + Duration::from_millis(250)).is_some());
    }

    #[test]
    fn reset_keeps_the_emission_clock() {
        let t0 = Instant::now();
        let mut m = MetricsAggregator::new(t0);
        assert_eq!(m.until_next_emit(t0), Duration::ZERO);
        assert!(m.poll_emit(t0).is_some());

        m.reset(t0 + Duration::from_millis(50), "software", SessionStatus::Running);
        assert!(m.poll_emit(t0 + Duration::from_millis(100)).is_none());
        assert_eq!(
            m.until_next_emit(t0 + Duration::from_millis(100)),
            Duration::from_millis(150)
        );
    }

    #[test]
    fn snapshot_reports_avg_and_peak() {
        let mut m = MetricsAggregator::new(Instant::now());
        m.record_frame(2.0, 0.0);
        m.record_frame(4.0, 3.0);
        m.record_frame(6.0, -1.0);
        let s = m.snapshot();
        assert_eq!(s.cpu_avg, 4.0);
        assert_eq!(s.cpu_peak, 6.0);
        assert_eq!(s.gpu_avg, 1.0);
        assert_eq!(s.gpu_peak, 3.0);
    }

    #[test]
    fn over_budget_clamps_at_zero() {
        assert_eq!(over_budget_ms(Duration::from_millis(10)), 0.0);
        let over = over_budget_ms(Duration::from_millis(20));
        assert!((over - (20.0 - FRAME_BUDGET_MS)).abs() < 1e-9);
    }
}
