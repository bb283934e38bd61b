/// Offline Reporter: sliding-window aggregation of assignments and misses
/// per validator, emitting an `OfflineValidator` event once the miss ratio
/// crosses a threshold.
use std::collections::{HashMap, VecDeque};

use crate::error::MonitorError;
use crate::types::{Address, ReportEvent};
use crate::validators::PrimaryOracle;

struct ValidatorWindow {
    missed_steps: VecDeque<u64>,
    already_reported: bool,
}

impl ValidatorWindow {
    fn new() -> Self {
        Self { missed_steps: VecDeque::new(), already_reported: false }
    }
}

pub struct OfflineReporter {
    window_size: u64,
    allowed_skip_rate: f64,
    validators: HashMap<Address, ValidatorWindow>,
}

impl OfflineReporter {
    pub fn new(window_size: u64, allowed_skip_rate: f64) -> Self {
        Self { window_size, allowed_skip_rate, validators: HashMap::new() }
    }

    /// Rebuilds state from a checkpoint snapshot.
    pub fn restore(window_size: u64, allowed_skip_rate: f64, records: Vec<(Address, Vec<u64>, bool)>) -> Self {
        let mut validators = HashMap::with_capacity(records.len());
        for (validator, missed_steps, already_reported) in records {
            validators.insert(
                validator,
                ValidatorWindow { missed_steps: missed_steps.into_iter().collect(), already_reported },
            );
        }
        Self { window_size, allowed_skip_rate, validators }
    }

    /// Snapshot suitable for persisting in a checkpoint.
    pub fn snapshot(&self) -> Vec<(Address, Vec<u64>, bool)> {
        self.validators
            .iter()
            .map(|(v, w)| (*v, w.missed_steps.iter().copied().collect(), w.already_reported))
            .collect()
    }

    /// Records a step the skip reporter found missed.
    pub fn on_skip(&mut self, validator: Address, step: u64) {
        self.validators
            .entry(validator)
            .or_insert_with(ValidatorWindow::new)
            .missed_steps
            .push_back(step);
    }

    /// Re-evaluates every validator that has ever missed a step against
    /// the window ending at `current_step`, emitting `OfflineValidator`
    /// for any that newly cross the threshold.
    pub fn check(
        &mut self,
        current_step: u64,
        height: u64,
        oracle: &PrimaryOracle,
    ) -> Result<Vec<ReportEvent>, MonitorError> {
        let lo = current_step.saturating_sub(self.window_size);
        let mut events = Vec::new();

        for (validator, window) in self.validators.iter_mut() {
            while let Some(&front) = window.missed_steps.front() {
                if front < lo {
                    window.missed_steps.pop_front();
                    window.already_reported = false;
                } else {
                    break;
                }
            }

            let assigned = match oracle.get_assigned_steps(validator, lo, current_step, height) {
                Ok(steps) => steps.len() as u64,
                Err(e) if e.is_transient() => continue,
                Err(e) => return Err(e),
            };
            if assigned == 0 {
                continue;
            }
            let missed = window.missed_steps.len() as u64;
            let ratio = missed as f64 / assigned as f64;
            if ratio > self.allowed_skip_rate && !window.already_reported {
                events.push(ReportEvent::OfflineValidator {
                    validator: *validator,
                    missed_steps: window.missed_steps.iter().copied().collect(),
                });
                window.already_reported = true;
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Epoch;

    fn oracle(n: usize, max_height: u64) -> PrimaryOracle {
        let mut o = PrimaryOracle::new();
        let validators: Vec<[u8; 20]> = (0..n).map(|i| [i as u8 + 1; 20]).collect();
        o.add_epoch(Epoch { start_height: 0, validators });
        o.set_max_height(max_height);
        o
    }

    #[test]
    fn emits_when_ratio_exceeds_threshold() {
        let o = oracle(1, 1000); // one validator, assigned every step
        let mut reporter = OfflineReporter::new(100, 0.5);
        let v = Address([1; 20]);
        // Miss half+1 of the last 100 assignments.
        for s in 900..951 {
            reporter.on_skip(v, s);
        }
        let events = reporter.check(1000, 10, &o).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ReportEvent::OfflineValidator { validator, missed_steps } => {
                assert_eq!(*validator, v);
                assert_eq!(missed_steps.len(), 51);
            }
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn does_not_report_twice_for_same_window() {
        let o = oracle(1, 1000);
        let mut reporter = OfflineReporter::new(100, 0.5);
        let v = Address([1; 20]);
        for s in 900..951 {
            reporter.on_skip(v, s);
        }
        let first = reporter.check(1000, 10, &o).unwrap();
        assert_eq!(first.len(), 1);
        let second = reporter.check(1001, 10, &o).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn flag_clears_once_oldest_miss_ages_out() {
        let o = oracle(1, 2000);
        let mut reporter = OfflineReporter::new(100, 0.5);
        let v = Address([1; 20]);
        for s in 900..951 {
            reporter.on_skip(v, s);
        }
        reporter.check(1000, 10, &o).unwrap();
        // Advance far enough that every previously missed step falls out
        // of the window, then miss enough again to re-cross the ratio.
        for s in 1900..1951 {
            reporter.on_skip(v, s);
        }
        let events = reporter.check(2000, 10, &o).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn no_report_below_threshold() {
        let o = oracle(1, 1000);
        let mut reporter = OfflineReporter::new(100, 0.5);
        let v = Address([1; 20]);
        for s in 900..920 {
            reporter.on_skip(v, s);
        }
        let events = reporter.check(1000, 10, &o).unwrap();
        assert!(events.is_empty());
    }
}
