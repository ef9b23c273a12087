use crate::error::AdmmError;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::OpenOptions,
    future::Future,
    io::Write,
    path::Path,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

/// A record of timing information for one coordinator step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingRecord {
    /// Name of the step (e.g., "ptycho_step", "tomo_step")
    pub step_name: String,
    /// The iteration number when this step was executed, 0 for setup
    pub iteration: usize,
    /// Duration of the step in milliseconds
    pub duration_ms: f64,
    /// Unix timestamp when the step was recorded
    pub timestamp: u64,
}

/// A record of timing information for one collective call.
///
/// Durations include the time spent waiting for the slowest peer, so the
/// spread across ranks shows load imbalance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectiveTimingRecord {
    /// Collective operation (e.g., "scatter", "get_tomo_slice")
    pub collective: String,
    /// What was moved (e.g., "phi", "hobj")
    pub payload: String,
    pub iteration: usize,
    pub duration_ms: f64,
    pub timestamp: u64,
}

/// Performance tracking for an ADMM run.
///
/// `TimingTracker` collects timings for the coordinator's steps and for the
/// collectives it issues. Each rank keeps its own tracker.
#[derive(Debug, Clone, Default)]
pub struct TimingTracker {
    step_timings: Vec<TimingRecord>,
    collective_timings: Vec<CollectiveTimingRecord>,
    current_iteration: usize,
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TimingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_iteration(&mut self) {
        self.current_iteration += 1;
    }

    pub fn current_iteration(&self) -> usize {
        self.current_iteration
    }

    pub fn record_step(&mut self, step_name: &str, duration: Duration) {
        self.step_timings.push(TimingRecord {
            step_name: step_name.to_string(),
            iteration: self.current_iteration,
            duration_ms: duration.as_secs_f64() * 1000.0,
            timestamp: unix_timestamp(),
        });
    }

    pub fn record_collective(&mut self, collective: &str, payload: &str, duration: Duration) {
        self.collective_timings.push(CollectiveTimingRecord {
            collective: collective.to_string(),
            payload: payload.to_string(),
            iteration: self.current_iteration,
            duration_ms: duration.as_secs_f64() * 1000.0,
            timestamp: unix_timestamp(),
        });
    }

    pub fn step_timings(&self) -> &[TimingRecord] {
        &self.step_timings
    }

    pub fn collective_timings(&self) -> &[CollectiveTimingRecord] {
        &self.collective_timings
    }

    pub fn write_step_timings_to_csv(&self, filename: &Path) -> Result<(), AdmmError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(filename)?;

        writeln!(file, "step_name,iteration,duration_ms,timestamp")?;
        for record in &self.step_timings {
            writeln!(
                file,
                "{},{},{:.3},{}",
                record.step_name, record.iteration, record.duration_ms, record.timestamp
            )?;
        }
        Ok(())
    }

    pub fn write_collective_timings_to_csv(&self, filename: &Path) -> Result<(), AdmmError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(filename)?;

        writeln!(file, "collective,payload,iteration,duration_ms,timestamp")?;
        for record in &self.collective_timings {
            writeln!(
                file,
                "{},{},{},{:.3},{}",
                record.collective,
                record.payload,
                record.iteration,
                record.duration_ms,
                record.timestamp
            )?;
        }
        Ok(())
    }

    /// Returns `(average_ms, max_ms, count)` per step name.
    pub fn get_step_statistics(&self) -> HashMap<String, (f64, f64, usize)> {
        summarize(
            self.step_timings
                .iter()
                .map(|r| (r.step_name.clone(), r.duration_ms)),
        )
    }

    /// Returns `(average_ms, max_ms, count)` per `collective:payload` key.
    pub fn get_collective_statistics(&self) -> HashMap<String, (f64, f64, usize)> {
        summarize(
            self.collective_timings
                .iter()
                .map(|r| (format!("{}:{}", r.collective, r.payload), r.duration_ms)),
        )
    }
}

fn summarize(records: impl Iterator<Item = (String, f64)>) -> HashMap<String, (f64, f64, usize)> {
    let mut stats = HashMap::new();
    for (key, duration_ms) in records {
        let entry = stats.entry(key).or_insert((0.0f64, 0.0f64, 0));
        entry.0 += duration_ms;
        entry.1 = entry.1.max(duration_ms);
        entry.2 += 1;
    }

    // Convert to (average, max, count)
    for (_, stats) in stats.iter_mut() {
        stats.0 /= stats.2 as f64;
    }
    stats
}

/// Awaits the collective `f` and records its wall time against `collective` and `payload`.
pub async fn time_collective<F, R>(
    tracker: &mut TimingTracker,
    collective: &str,
    payload: &str,
    f: F,
) -> Result<R, AdmmError>
where
    F: Future<Output = Result<R, AdmmError>>,
{
    let start = Instant::now();
    let result = f.await;
    tracker.record_collective(collective, payload, start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_average_and_max() {
        let mut tracker = TimingTracker::new();
        tracker.start_iteration();
        tracker.record_step("tomo_step", Duration::from_millis(10));
        tracker.start_iteration();
        tracker.record_step("tomo_step", Duration::from_millis(30));
        tracker.record_collective("get_tomo_slice", "phi", Duration::from_millis(4));

        let (avg, max, count) = tracker.get_step_statistics()["tomo_step"];
        assert!((avg - 20.0).abs() < 1e-9);
        assert!((max - 30.0).abs() < 1e-9);
        assert_eq!(count, 2);
        assert_eq!(tracker.get_collective_statistics()["get_tomo_slice:phi"].2, 1);
        assert_eq!(tracker.collective_timings()[0].iteration, 2);
    }

    #[test]
    fn csv_export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = TimingTracker::new();
        tracker.record_step("setup", Duration::from_millis(1));
        tracker.record_collective("scatter", "data", Duration::from_millis(2));

        let steps = dir.path().join("steps.csv");
        let collectives = dir.path().join("collectives.csv");
        tracker.write_step_timings_to_csv(&steps).unwrap();
        tracker.write_collective_timings_to_csv(&collectives).unwrap();

        let steps = std::fs::read_to_string(steps).unwrap();
        assert!(steps.starts_with("step_name,iteration,duration_ms,timestamp\nsetup,0,"));
        let collectives = std::fs::read_to_string(collectives).unwrap();
        assert_eq!(collectives.lines().count(), 2);
        assert!(collectives.lines().nth(1).unwrap().starts_with("scatter,data,0,"));
    }

    #[tokio::test]
    async fn time_collective_records_even_on_error() {
        let mut tracker = TimingTracker::new();
        let result: Result<(), AdmmError> =
            time_collective(&mut tracker, "all_gather", "x", async {
                Err(AdmmError::Disconnected { rank: 3 })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(tracker.collective_timings().len(), 1);
        assert_eq!(tracker.collective_timings()[0].payload, "x");
    }
}
