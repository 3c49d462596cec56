// Copyright (c) 2024 The PriFi Authors

//! Relay-side statistics, reported as experiment result strings.

use std::{collections::BTreeMap, fmt::Write, time::Duration};

/// Number of samples kept per statistic.
pub const MAX_SAMPLES: usize = 100;

/// Round duration samples, in milliseconds.
#[derive(Clone, Debug, Default)]
pub struct TimeStatistics {
    samples: Vec<u64>,
    total_added: usize,
}

impl TimeStatistics {
    /// Add a sample, dropping the oldest past [`MAX_SAMPLES`].
    pub fn add(&mut self, duration: Duration) {
        self.samples.push(duration.as_millis() as u64);
        self.total_added += 1;
        if self.samples.len() > MAX_SAMPLES {
            let excess = self.samples.len() - MAX_SAMPLES;
            self.samples.drain(..excess);
        }
    }

    /// Mean of the kept samples.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }

    /// Half-width of the 95% confidence interval of the kept samples.
    pub fn confidence_95(&self) -> Option<f64> {
        let mean = self.mean()?;
        let variance = self
            .samples
            .iter()
            .map(|&s| (s as f64 - mean).powi(2))
            .sum::<f64>()
            / self.samples.len() as f64;
        Some(variance.sqrt() * 1.96)
    }

    /// Samples added since creation.
    pub fn total_added(&self) -> usize {
        self.total_added
    }

    /// One-line report, e.g. `round-duration: 12.5 ms +- 1.2 (over 40, happened 40)`.
    pub fn report(&self, name: &str) -> String {
        match (self.mean(), self.confidence_95()) {
            (Some(mean), Some(margin)) => format!(
                "{name}: {mean:.2} ms +- {margin:.2} (over {}, happened {})",
                self.samples.len(),
                self.total_added
            ),
            _ => format!("{name}: no samples"),
        }
    }
}

/// Cell and byte counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitrateStatistics {
    /// Decoded upstream cells
    pub upstream_cells: u64,
    /// Bytes in decoded upstream cells
    pub upstream_bytes: u64,
    /// Unicast downstream cells, counted once per cell
    pub downstream_cells: u64,
    /// Bytes in unicast downstream cells
    pub downstream_bytes: u64,
    /// Broadcast downstream cells
    pub downstream_udp_cells: u64,
    /// Re-broadcast downstream cells
    pub retransmitted_cells: u64,
}

impl BitrateStatistics {
    /// One-line report of the counters.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "bitrate: {} cells / {} B up, {} cells / {} B down, {} udp cells, {} retransmitted",
            self.upstream_cells,
            self.upstream_bytes,
            self.downstream_cells,
            self.downstream_bytes,
            self.downstream_udp_cells,
            self.retransmitted_cells
        );
        out
    }
}

/// Statistics names collected by the relay.
pub const ROUND_DURATION: &str = "round-duration";
/// Rounds completed by the last client cipher.
pub const WAITING_ON_CLIENTS: &str = "waiting-on-clients";
/// Rounds completed by the last trustee cipher.
pub const WAITING_ON_TRUSTEES: &str = "waiting-on-trustees";

/// Everything the relay measures during a session.
#[derive(Clone, Debug, Default)]
pub struct RelayStatistics {
    times: BTreeMap<&'static str, TimeStatistics>,
    /// Cell counters
    pub bitrate: BitrateStatistics,
}

impl RelayStatistics {
    /// Add a sample to statistic `name`.
    pub fn add_time(&mut self, name: &'static str, duration: Duration) {
        self.times.entry(name).or_default().add(duration);
    }

    /// Statistic `name`, if it has samples.
    pub fn time(&self, name: &str) -> Option<&TimeStatistics> {
        self.times.get(name)
    }

    /// Report lines, bitrate first, then one per time statistic by name.
    pub fn reports(&self) -> Vec<String> {
        std::iter::once(self.bitrate.report())
            .chain(self.times.iter().map(|(name, stats)| stats.report(name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_confidence() {
        let mut stats = TimeStatistics::default();
        assert_eq!(stats.report("x"), "x: no samples");

        for ms in [10, 20, 30] {
            stats.add(Duration::from_millis(ms));
        }
        assert_eq!(stats.mean(), Some(20.0));
        let margin = stats.confidence_95().unwrap();
        assert!((margin - 1.96 * (200.0f64 / 3.0).sqrt()).abs() < 1e-9);
        assert!(stats.report("round-duration").starts_with("round-duration: 20.00 ms +- "));
    }

    #[test]
    fn test_only_recent_samples_are_kept() {
        let mut stats = TimeStatistics::default();
        for _ in 0..MAX_SAMPLES {
            stats.add(Duration::from_millis(1000));
        }
        for _ in 0..MAX_SAMPLES {
            stats.add(Duration::from_millis(2));
        }
        assert_eq!(stats.mean(), Some(2.0));
        assert_eq!(stats.total_added(), 2 * MAX_SAMPLES);
    }

    #[test]
    fn test_reports_are_sorted_by_name() {
        let mut stats = RelayStatistics::default();
        stats.add_time(WAITING_ON_TRUSTEES, Duration::from_millis(3));
        stats.add_time(ROUND_DURATION, Duration::from_millis(5));
        stats.bitrate.upstream_cells = 2;

        let reports = stats.reports();
        assert_eq!(reports.len(), 3);
        assert!(reports[0].starts_with("bitrate: 2 cells"));
        assert!(reports[1].starts_with(ROUND_DURATION));
        assert!(reports[2].starts_with(WAITING_ON_TRUSTEES));
    }
}
