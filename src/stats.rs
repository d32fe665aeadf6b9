//! Rolling-window receive statistics
//!
//! Throughput counts snapshot bytes plus transport bytes. Frame rate and
//! render quality come from the decoded-frame counter of the inbound video.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Number of samples kept in the window
pub const STATS_WINDOW: usize = 10;

/// Samples closer together than this are ignored
const MIN_SAMPLE_SPACING: Duration = Duration::from_millis(500);

/// Quality ratios at or above this are reported as 1
const QUALITY_CLAMP: f64 = 0.995;

/// Cumulative counters read from the negotiation layer
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransportCounters {
    pub bytes_received: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    /// Total freeze duration in seconds
    pub freeze_duration: f64,
    pub frame_width: u32,
    pub frame_height: u32,
}

#[derive(Debug, Clone)]
struct Sample {
    timestamp: Instant,
    bytes: u64,
    frames_decoded: u64,
    fps: Option<u32>,
    fps_mode: Option<u32>,
}

/// Derived figures of the latest accepted sample
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsReport {
    pub bytes_per_sec: f64,
    pub fps: Option<u32>,
    /// Configured or inferred frame rate, known once the window is full
    pub expected_fps: Option<u32>,
    /// Decoded ÷ expected frames over the window
    pub quality: Option<f64>,
    pub frames_dropped: u64,
    pub freeze_duration: f64,
}

impl StatisticsReport {
    /// One-line summary, e.g. `recv: 1.5 MB/s fps: 25 render quality: 98.0%`
    pub fn summary(&self) -> String {
        let mut line = format!("recv: {}/s", format_bytes(self.bytes_per_sec, 2));
        if let Some(fps) = self.fps {
            line.push_str(&format!(" fps: {}", fps));
        }
        if let Some(quality) = self.quality {
            line.push_str(&format!(" render quality: {:.1}%", quality * 100.0));
        }
        line
    }
}

/// Rolling statistics of one session
#[derive(Debug)]
pub struct StatisticsAggregator {
    history: VecDeque<Sample>,
    image_bytes: u64,
    counters: TransportCounters,
    video: bool,
    fps_hint: Option<u32>,
    report: Option<StatisticsReport>,
}

impl StatisticsAggregator {
    pub fn new(video: bool, fps_hint: Option<u32>) -> Self {
        Self {
            history: VecDeque::with_capacity(STATS_WINDOW + 1),
            image_bytes: 0,
            counters: TransportCounters::default(),
            video,
            fps_hint,
            report: None,
        }
    }

    /// Clear counters, history and the last report
    pub fn reset(&mut self) {
        self.history.clear();
        self.image_bytes = 0;
        self.counters = TransportCounters::default();
        self.report = None;
    }

    /// Account bytes of a fetched snapshot
    pub fn record_image_bytes(&mut self, bytes: usize) {
        self.image_bytes += bytes as u64;
    }

    /// Replace the transport counters with a fresh reading
    pub fn update_counters(&mut self, counters: TransportCounters) {
        self.counters = counters;
    }

    /// Take a sample at `now`
    ///
    /// Returns the new report when the sample was accepted and enough history
    /// exists to derive rates.
    pub fn sample(&mut self, now: Instant) -> Option<&StatisticsReport> {
        let current = Sample {
            timestamp: now,
            bytes: self.image_bytes + self.counters.bytes_received,
            frames_decoded: self.counters.frames_decoded,
            fps: None,
            fps_mode: None,
        };

        let prev = match self.history.back() {
            Some(prev) if now.saturating_duration_since(prev.timestamp) < MIN_SAMPLE_SPACING => {
                return None;
            }
            Some(prev) => Some(prev.clone()),
            None => None,
        };

        let Some(prev) = prev else {
            self.history.push_back(current);
            return None;
        };

        let delta_time = now.saturating_duration_since(prev.timestamp).as_secs_f64();
        if current.frames_decoded < prev.frames_decoded
            || current.bytes < prev.bytes
            || delta_time <= 0.0
        {
            self.restart_window(current);
            return None;
        }

        let delta_bytes = (current.bytes - prev.bytes) as f64;
        let delta_frames = (current.frames_decoded - prev.frames_decoded) as f64;

        let mut report = StatisticsReport {
            bytes_per_sec: delta_bytes / delta_time,
            fps: None,
            expected_fps: None,
            quality: None,
            frames_dropped: self.counters.frames_dropped,
            freeze_duration: self.counters.freeze_duration,
        };

        self.history.push_back(current);
        if self.history.len() > STATS_WINDOW {
            self.history.pop_front();
        }

        if self.video {
            let fps = (delta_frames / delta_time).round() as u32;
            report.fps = Some(fps);
            if let Some(last) = self.history.back_mut() {
                last.fps = Some(fps);
            }

            if self.history.len() >= STATS_WINDOW {
                let expected = match self.fps_hint {
                    Some(hint) => hint,
                    None => {
                        let fps_mode = mode(self.history.iter().map(|s| s.fps));
                        if let Some(last) = self.history.back_mut() {
                            last.fps_mode = fps_mode;
                        }
                        mode(self.history.iter().map(|s| s.fps_mode))
                            .unwrap_or(1)
                            .max(1)
                    }
                };
                report.expected_fps = Some(expected);

                let (first, last) = (&self.history[0], &self.history[self.history.len() - 1]);
                let play_time = last.timestamp.saturating_duration_since(first.timestamp).as_secs_f64();
                let frames_expected = play_time * expected as f64;
                if last.frames_decoded < first.frames_decoded || frames_expected <= 0.0 {
                    let last = last.clone();
                    self.restart_window(last);
                    return None;
                }

                let ratio = (last.frames_decoded - first.frames_decoded) as f64 / frames_expected;
                report.quality = Some(if ratio >= QUALITY_CLAMP { 1.0 } else { ratio });
            }
        }

        self.report = Some(report);
        self.report.as_ref()
    }

    fn restart_window(&mut self, current: Sample) {
        self.history.clear();
        self.history.push_back(current);
    }

    /// Latest report, if any
    pub fn report(&self) -> Option<&StatisticsReport> {
        self.report.as_ref()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Most frequent value, first to reach the top count wins ties
fn mode(values: impl Iterator<Item = Option<u32>>) -> Option<u32> {
    let mut counts: Vec<(u32, usize)> = Vec::new();
    let mut best: Option<(u32, usize)> = None;
    for value in values.flatten() {
        let count = match counts.iter_mut().find(|(v, _)| *v == value) {
            Some((_, c)) => {
                *c += 1;
                *c
            }
            None => {
                counts.push((value, 1));
                1
            }
        };
        if best.map(|(_, c)| c < count).unwrap_or(true) {
            best = Some((value, count));
        }
    }
    best.map(|(v, _)| v)
}

/// Format a byte count with binary units, e.g. `1.5 KB`
pub fn format_bytes(bytes: f64, decimals: usize) -> String {
    const UNITS: [&str; 9] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    if !bytes.is_finite() || bytes <= 0.0 {
        return "0 Bytes".to_string();
    }

    let exp = ((bytes.ln() / 1024f64.ln()).floor().max(0.0) as usize).min(UNITS.len() - 1);
    let value = bytes / 1024f64.powi(exp as i32);
    let mut text = format!("{:.*}", decimals, value);
    if text.contains('.') {
        text = text.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{} {}", text, UNITS[exp])
}
