use size::{Size, Style};
use std::{
    collections::VecDeque,
    fmt::{self, Display},
};
use tokio::time::Instant;

const SAMPLE_WINDOW: usize = 4;

#[derive(Clone, Copy)]
struct Sample {
    taken_at: Instant,
    uploaded_bytes: u64,   // total uploaded bytes when the sample was taken
    downloaded_bytes: u64, // total downloaded bytes when the sample was taken
}

/// Per-transfer byte counters, sampled on every tick to derive recent rates.
/// Only verified pieces count as downloaded.
pub struct BandwidthTracker {
    samples: VecDeque<Sample>, // most recent first
    uploaded_bytes: u64,
    downloaded_bytes: u64,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        BandwidthTracker {
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            uploaded_bytes: 0,
            downloaded_bytes: 0,
        }
    }

    pub fn update(&mut self) {
        self.samples.push_front(Sample {
            taken_at: Instant::now(),
            uploaded_bytes: self.uploaded_bytes,
            downloaded_bytes: self.downloaded_bytes,
        });
        self.samples.truncate(SAMPLE_WINDOW);
    }

    pub fn add_uploaded_bytes(&mut self, bytes: u64) {
        self.uploaded_bytes += bytes;
    }

    pub fn add_downloaded_bytes(&mut self, bytes: u64) {
        self.downloaded_bytes += bytes;
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded_bytes
    }

    /// B/s downloaded over the sample window.
    pub fn rate_down(&self) -> f64 {
        self.rate(|s| s.downloaded_bytes)
    }

    /// B/s uploaded over the sample window.
    pub fn rate_up(&self) -> f64 {
        self.rate(|s| s.uploaded_bytes)
    }

    fn rate(&self, counter: impl Fn(&Sample) -> u64) -> f64 {
        let (Some(newest), Some(oldest)) = (self.samples.front(), self.samples.back()) else {
            return 0.;
        };
        let elapsed_s = newest.taken_at.duration_since(oldest.taken_at).as_secs_f64();
        if elapsed_s <= 0. {
            return 0.;
        }
        (counter(newest) - counter(oldest)) as f64 / elapsed_s
    }
}

impl Display for BandwidthTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Down: {down_band}/s, Up: {up_band}/s (tot.: {tot_down}, {tot_up})",
            down_band = Size::from_bytes(self.rate_down())
                .format()
                .with_style(Style::Abbreviated),
            up_band = Size::from_bytes(self.rate_up())
                .format()
                .with_style(Style::Abbreviated),
            tot_down = Size::from_bytes(self.downloaded_bytes)
                .format()
                .with_style(Style::Abbreviated),
            tot_up = Size::from_bytes(self.uploaded_bytes)
                .format()
                .with_style(Style::Abbreviated),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn rates_are_computed_over_the_window() {
        let mut tracker = BandwidthTracker::new();
        assert_eq!(tracker.rate_down(), 0.);
        tracker.update();
        for _ in 0..3 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tracker.add_downloaded_bytes(1000);
            tracker.add_uploaded_bytes(500);
            tracker.update();
        }
        assert_eq!(tracker.rate_down(), 1000.);
        assert_eq!(tracker.rate_up(), 500.);
        assert_eq!(tracker.downloaded_bytes(), 3000);

        // old samples fall out of the window
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tracker.update();
        }
        assert_eq!(tracker.rate_down(), 0.);
    }
}
