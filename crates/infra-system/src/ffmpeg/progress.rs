//! `-progress pipe:2` parsing.
//!
//! ffmpeg prints `key=value` lines and closes every block with
//! `progress=continue` or `progress=end`.

/// Turns progress blocks into a completed fraction
#[derive(Debug, Clone)]
pub struct ProgressParser {
    total_us: i64,
    total_frames: u64,
    out_time_us: Option<i64>,
    frame: Option<u64>,
}

impl ProgressParser {
    pub fn new(duration_secs: f64, total_frames: u64) -> Self {
        Self {
            total_us: (duration_secs * 1_000_000.0) as i64,
            total_frames,
            out_time_us: None,
            frame: None,
        }
    }

    /// Feed one stderr line. Returns the fraction in `0.0..=1.0` when a
    /// block completes and there is something to measure against.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();

        match key.trim() {
            // ffmpeg reports out_time_ms in microseconds as well
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    self.out_time_us = Some(us);
                }
                None
            }
            "frame" => {
                if let Ok(frame) = value.parse::<u64>() {
                    self.frame = Some(frame);
                }
                None
            }
            "progress" if value == "end" => Some(1.0),
            "progress" => self.fraction(),
            _ => None,
        }
    }

    fn fraction(&self) -> Option<f64> {
        let by_time = self
            .out_time_us
            .filter(|us| *us > 0 && self.total_us > 0)
            .map(|us| us as f64 / self.total_us as f64);
        let by_frames = self
            .frame
            .filter(|_| self.total_frames > 0)
            .map(|f| f as f64 / self.total_frames as f64);

        by_time.or(by_frames).map(|f| f.clamp(0.0, 1.0))
    }
}

/// Whether a stderr line belongs to the progress stream rather than a diagnostic
pub fn is_progress_line(line: &str) -> bool {
    match line.split_once('=') {
        Some((key, _)) => !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'),
        None => false,
    }
}
