use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::protocol::{CrankData, CscMeasurement, EVENT_TIME_TICKS_PER_SECOND};

/// How a sample with elapsed time but no new crank revolutions is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ZeroRevolutionPolicy {
    /// The crank has stopped: report 0 RPM
    #[default]
    ForceZero,
    /// Keep the previous cadence and report the sample as stalled
    HoldPrevious,
}

/// Outcome of feeding one measurement to the [`CadenceEstimator`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CadenceUpdate {
    /// Packet had no crank data; nothing changed
    NoCrankData,
    /// First crank sample stored as the baseline; cadence stays 0
    FirstSample,
    /// No crank event time elapsed since the baseline
    Unchanged,
    /// A new cadence value was computed
    Updated(f64),
    /// Time advanced with no revolutions and the previous cadence was kept
    Stalled(f64),
}

impl CadenceUpdate {
    /// Whether this update observed distinct new data
    ///
    /// Distinct updates re-arm the staleness watchdog.
    #[must_use]
    pub const fn is_distinct(&self) -> bool {
        matches!(self, Self::FirstSample | Self::Updated(_) | Self::Stalled(_))
    }
}

/// Snapshot of the estimator's baseline and output
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CadenceState {
    previous: Option<CrankData>,
    current_cadence_rpm: f64,
}

impl CadenceState {
    /// Cumulative revolutions of the stored baseline
    #[must_use]
    pub fn previous_revolutions(&self) -> Option<u16> {
        self.previous.map(|p| p.cumulative_revolutions)
    }

    /// Crank event time of the stored baseline
    #[must_use]
    pub fn previous_event_time(&self) -> Option<u16> {
        self.previous.map(|p| p.last_event_time)
    }

    /// Current cadence in revolutions per minute, never negative
    #[must_use]
    pub const fn current_cadence_rpm(&self) -> f64 {
        self.current_cadence_rpm
    }
}

/// Derives crank cadence from successive cumulative counter samples
///
/// Counters and event times are 16-bit and wrap; deltas are taken modulo
/// 65536 so a rollover such as `65534 -> 2` reads as 4 revolutions.
#[derive(Debug, Clone, Default)]
pub struct CadenceEstimator {
    state: CadenceState,
    policy: ZeroRevolutionPolicy,
}

impl CadenceEstimator {
    /// Create an estimator using [`ZeroRevolutionPolicy::ForceZero`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an estimator with an explicit zero-revolution policy
    #[must_use]
    pub fn with_policy(policy: ZeroRevolutionPolicy) -> Self {
        Self {
            state: CadenceState::default(),
            policy,
        }
    }

    /// Current cadence in RPM
    #[must_use]
    pub const fn cadence_rpm(&self) -> f64 {
        self.state.current_cadence_rpm
    }

    /// Current baseline and cadence
    #[must_use]
    pub const fn state(&self) -> CadenceState {
        self.state
    }

    /// Forget the baseline and report 0 RPM
    pub fn reset(&mut self) {
        self.state = CadenceState::default();
    }

    /// Report 0 RPM without touching the baseline
    pub fn force_zero(&mut self) {
        self.state.current_cadence_rpm = 0.0;
    }

    /// Feed one decoded measurement
    ///
    /// The baseline only moves on distinct data. A sample with no elapsed
    /// event time is `Unchanged` even if revolutions advanced, so the next
    /// rate is measured from the last sample whose timestamp moved.
    pub fn update(&mut self, measurement: &CscMeasurement) -> CadenceUpdate {
        let Some(current) = measurement.crank else {
            return CadenceUpdate::NoCrankData;
        };

        let Some(previous) = self.state.previous else {
            self.state.previous = Some(current);
            debug!(
                revolutions = current.cumulative_revolutions,
                event_time = current.last_event_time,
                "Stored first crank sample"
            );
            return CadenceUpdate::FirstSample;
        };

        let rev_delta = current
            .cumulative_revolutions
            .wrapping_sub(previous.cumulative_revolutions);
        let time_delta = current.last_event_time.wrapping_sub(previous.last_event_time);

        if time_delta == 0 {
            if rev_delta > 0 {
                warn!(
                    rev_delta,
                    "Crank revolutions advanced with zero elapsed event time; sample ignored"
                );
            }
            return CadenceUpdate::Unchanged;
        }

        let update = if rev_delta == 0 {
            match self.policy {
                ZeroRevolutionPolicy::ForceZero => {
                    self.state.current_cadence_rpm = 0.0;
                    CadenceUpdate::Updated(0.0)
                }
                ZeroRevolutionPolicy::HoldPrevious => {
                    CadenceUpdate::Stalled(self.state.current_cadence_rpm)
                }
            }
        } else {
            let rpm = cadence_rpm(rev_delta, time_delta);
            self.state.current_cadence_rpm = rpm;
            CadenceUpdate::Updated(rpm)
        };

        if current != previous {
            self.state.previous = Some(current);
        }

        debug!(rev_delta, time_delta, ?update, "Cadence sample processed");
        update
    }
}

/// Cadence in RPM from revolution and 1/1024 s time deltas
///
/// `time_delta` must be non-zero.
#[must_use]
pub fn cadence_rpm(rev_delta: u16, time_delta: u16) -> f64 {
    let seconds = f64::from(time_delta) / EVENT_TIME_TICKS_PER_SECOND;
    (f64::from(rev_delta) / seconds) * 60.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f64 = 1e-9;

    fn crank(revolutions: u16, event_time: u16) -> CscMeasurement {
        CscMeasurement {
            wheel_data_present: false,
            crank: Some(CrankData {
                cumulative_revolutions: revolutions,
                last_event_time: event_time,
            }),
        }
    }

    #[test]
    fn test_first_sample_sets_baseline() {
        let mut estimator = CadenceEstimator::new();
        assert_eq!(estimator.update(&crank(5, 1024)), CadenceUpdate::FirstSample);

        let state = estimator.state();
        assert_eq!(state.previous_revolutions(), Some(5));
        assert_eq!(state.previous_event_time(), Some(1024));
        assert!(estimator.cadence_rpm().abs() < EPSILON);
    }

    #[test]
    fn test_two_revolutions_in_one_second() {
        let mut estimator = CadenceEstimator::new();
        estimator.update(&crank(5, 1024));

        match estimator.update(&crank(7, 2048)) {
            CadenceUpdate::Updated(rpm) => assert!((rpm - 120.0).abs() < EPSILON),
            other => panic!("unexpected update: {other:?}"),
        }
        assert!((estimator.cadence_rpm() - 120.0).abs() < EPSILON);
    }

    #[test]
    fn test_cadence_formula() {
        let cases = [(1u16, 1024u16), (3, 1500), (90, 65535), (1, 1)];

        for (rev_delta, time_delta) in cases {
            let expected = f64::from(rev_delta) * 60.0 * 1024.0 / f64::from(time_delta);
            let actual = cadence_rpm(rev_delta, time_delta);
            assert!(
                (actual - expected).abs() < 1e-6,
                "rev_delta={rev_delta} time_delta={time_delta}: {actual} != {expected}"
            );
        }
    }

    #[test]
    fn test_counter_rollover() {
        let mut estimator = CadenceEstimator::new();
        estimator.update(&crank(65534, 64000));

        // revolutions 65534 -> 2 is 4 revolutions, time 64000 -> 2464 is 4000 ticks
        match estimator.update(&crank(2, 2464)) {
            CadenceUpdate::Updated(rpm) => {
                let expected = 4.0 * 60.0 * 1024.0 / 4000.0;
                assert!((rpm - expected).abs() < EPSILON);
            }
            other => panic!("unexpected update: {other:?}"),
        }
        assert_eq!(estimator.state().previous_revolutions(), Some(2));
    }

    #[test]
    fn test_no_crank_data_leaves_state() {
        let mut estimator = CadenceEstimator::new();
        estimator.update(&crank(5, 1024));
        let before = estimator.state();

        let wheel_only = CscMeasurement {
            wheel_data_present: true,
            crank: None,
        };
        assert_eq!(estimator.update(&wheel_only), CadenceUpdate::NoCrankData);
        assert_eq!(estimator.state(), before);
    }

    #[test]
    fn test_zero_time_delta_is_unchanged() {
        let mut estimator = CadenceEstimator::new();
        estimator.update(&crank(5, 1024));
        estimator.update(&crank(7, 2048));

        // Repeated packet
        assert_eq!(estimator.update(&crank(7, 2048)), CadenceUpdate::Unchanged);
        // Revolutions moved but time did not
        assert_eq!(estimator.update(&crank(9, 2048)), CadenceUpdate::Unchanged);

        assert!((estimator.cadence_rpm() - 120.0).abs() < EPSILON);
        assert_eq!(estimator.state().previous_revolutions(), Some(7));
    }

    #[test]
    fn test_stop_forces_zero() {
        let mut estimator = CadenceEstimator::new();
        estimator.update(&crank(5, 1024));
        estimator.update(&crank(7, 2048));

        assert_eq!(estimator.update(&crank(7, 3072)), CadenceUpdate::Updated(0.0));
        assert!(estimator.cadence_rpm().abs() < EPSILON);
        assert_eq!(estimator.state().previous_event_time(), Some(3072));
    }

    #[test]
    fn test_stop_with_hold_previous_policy() {
        let mut estimator = CadenceEstimator::with_policy(ZeroRevolutionPolicy::HoldPrevious);
        estimator.update(&crank(5, 1024));
        estimator.update(&crank(7, 2048));

        match estimator.update(&crank(7, 3072)) {
            CadenceUpdate::Stalled(rpm) => assert!((rpm - 120.0).abs() < EPSILON),
            other => panic!("unexpected update: {other:?}"),
        }
        assert!((estimator.cadence_rpm() - 120.0).abs() < EPSILON);
    }

    #[test]
    fn test_reset_and_force_zero() {
        let mut estimator = CadenceEstimator::new();
        estimator.update(&crank(5, 1024));
        estimator.update(&crank(7, 2048));

        estimator.force_zero();
        assert!(estimator.cadence_rpm().abs() < EPSILON);
        assert_eq!(estimator.state().previous_revolutions(), Some(7));

        estimator.reset();
        let state = estimator.state();
        assert_eq!(state.previous_revolutions(), None);
        assert_eq!(state.previous_event_time(), None);
        assert_eq!(estimator.update(&crank(7, 2048)), CadenceUpdate::FirstSample);
    }

    #[test]
    fn test_distinct_classification() {
        assert!(CadenceUpdate::FirstSample.is_distinct());
        assert!(CadenceUpdate::Updated(0.0).is_distinct());
        assert!(CadenceUpdate::Stalled(60.0).is_distinct());
        assert!(!CadenceUpdate::Unchanged.is_distinct());
        assert!(!CadenceUpdate::NoCrankData.is_distinct());
    }
}
