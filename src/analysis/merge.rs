//! Folding collaborator measurements into refined exposure records.
//!
//! Pass 0 establishes the set of exposures for a batch. Every later pass
//! refines the records it already has by intersecting bounds; nothing is
//! ever summed across passes.

use super::bounds::{Anomaly, BoundedValue};
use super::passes::PassLadder;
use super::profile::{DurationProfile, BUCKET_NAMES};
use crate::models::{ExposureRecord, Fingerprint, RawExposure};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// An anomaly together with where it was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnomalyEvent {
    pub fingerprint: Fingerprint,
    pub pass: usize,
    /// Name of the refined quantity (`duration`, a bucket name, ...).
    pub field: String,
    pub anomaly: Anomaly,
}

/// Outcome of merging one pass into a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Records created (pass 0 only).
    pub created: usize,
    /// Existing records refined by this pass.
    pub refined: usize,
    /// Existing records the collaborator reported nothing for.
    pub untouched: usize,
    /// Measurements with no existing record to refine.
    pub unmatched: usize,
    pub anomalies: Vec<AnomalyEvent>,
}

/// All measurements of one fingerprint within a single pass.
#[derive(Debug, Clone)]
struct Observation {
    date: DateTime<Utc>,
    duration: BoundedValue,
    profile: DurationProfile,
    total_risk_score: u32,
    /// Attenuation value of the latest window; only meaningful when
    /// `windows` is 1.
    attenuation_value: u32,
    windows: usize,
}

/// Merges raw measurements into a batch's records.
pub struct MergeEngine<'a> {
    ladder: &'a PassLadder,
}

impl<'a> MergeEngine<'a> {
    pub fn new(ladder: &'a PassLadder) -> Self {
        Self { ladder }
    }

    /// Merge `incoming` measurements from `pass` into `records`.
    ///
    /// Only measurements carrying `risk_level` are considered; results for
    /// other batches are never merged across.
    pub fn merge_batch(
        &self,
        records: &mut BTreeMap<Fingerprint, ExposureRecord>,
        incoming: &[RawExposure],
        risk_level: u8,
        pass: usize,
    ) -> MergeReport {
        let observations = self.group(incoming, risk_level, pass);
        let mut report = MergeReport::default();

        if pass == 0 {
            records.clear();
            for (fingerprint, obs) in observations {
                let record = ExposureRecord {
                    date: obs.date,
                    transmission_risk_level: fingerprint.transmission_risk_level,
                    total_risk_score: obs.total_risk_score,
                    attenuation_value: obs.attenuation_value,
                    duration: obs.duration,
                    profile: obs.profile,
                    classified_level: None,
                    pass_count: 1,
                };
                let record = self.settle(record, fingerprint, pass, obs.windows, &mut report);
                records.insert(fingerprint, record);
                report.created += 1;
            }
            return report;
        }

        for (fingerprint, obs) in observations {
            let Some(existing) = records.get(&fingerprint) else {
                debug!(%fingerprint, pass, "No earlier record to refine; ignoring measurement");
                report.unmatched += 1;
                continue;
            };

            let (profile, bucket_anomalies) = existing.profile.merge(&obs.profile);
            for b in bucket_anomalies {
                report.record(fingerprint, pass, BUCKET_NAMES[b.bucket], b.anomaly);
            }

            let duration = existing.duration.intersect(obs.duration);
            if let Some(anomaly) = duration.anomaly {
                report.record(fingerprint, pass, "duration", anomaly);
            }

            let refined = ExposureRecord {
                date: existing.date,
                transmission_risk_level: existing.transmission_risk_level,
                total_risk_score: existing.total_risk_score.max(obs.total_risk_score),
                attenuation_value: obs.attenuation_value,
                duration: duration.value,
                profile,
                classified_level: existing.classified_level,
                pass_count: existing.pass_count.max(pass + 1),
            };
            let refined = self.settle(refined, fingerprint, pass, obs.windows, &mut report);
            records.insert(fingerprint, refined);
            report.refined += 1;
        }

        report.untouched = records.len().saturating_sub(report.refined);
        report
    }

    /// Group measurements of one pass by fingerprint, summing within the pass.
    fn group(
        &self,
        incoming: &[RawExposure],
        risk_level: u8,
        pass: usize,
    ) -> BTreeMap<Fingerprint, Observation> {
        let mut grouped: BTreeMap<Fingerprint, Observation> = BTreeMap::new();

        for raw in incoming
            .iter()
            .filter(|r| r.transmission_risk_level == risk_level)
        {
            let profile = DurationProfile::from_minutes(self.ladder, pass, raw.attenuation_durations);
            let duration = self.ladder.bound_for(pass, raw.duration);

            grouped
                .entry(raw.fingerprint())
                .and_modify(|obs| {
                    obs.date = obs.date.min(raw.date);
                    obs.duration = obs.duration.add(duration);
                    obs.profile = obs.profile.add(&profile);
                    obs.total_risk_score = obs.total_risk_score.max(raw.total_risk_score);
                    obs.attenuation_value = raw.attenuation_value;
                    obs.windows += 1;
                })
                .or_insert(Observation {
                    date: raw.date,
                    duration,
                    profile,
                    total_risk_score: raw.total_risk_score,
                    attenuation_value: raw.attenuation_value,
                    windows: 1,
                });
        }

        grouped
    }

    /// Reconcile the duration with the profile and recompute derived fields.
    ///
    /// The reported attenuation value is checked against the classification
    /// only when the pass saw a single window for the fingerprint; summed
    /// windows carry no single value to compare.
    fn settle(
        &self,
        mut record: ExposureRecord,
        fingerprint: Fingerprint,
        pass: usize,
        windows: usize,
        report: &mut MergeReport,
    ) -> ExposureRecord {
        let total = record.profile.total_time();
        let clamped = record.duration.clamp(total, total);
        record.duration = clamped.value;

        let contradicts_total = if record.duration.is_exact() {
            !total.matches(record.duration.value())
        } else {
            total.is_exact() && record.duration.value() > total.value()
        };

        match clamped.anomaly {
            Some(anomaly) => report.record(fingerprint, pass, "duration", anomaly),
            None if contradicts_total => {
                report.record(
                    fingerprint,
                    pass,
                    "duration",
                    Anomaly::DurationMismatch {
                        buckets: total,
                        duration: record.duration.value(),
                    },
                );
            }
            None => {}
        }

        let config = self.ladder.get(pass);
        record.classified_level = config.and_then(|c| record.profile.classify(c));

        if windows == 1 && record.profile.is_exact() {
            if let Some(computed) = record.classified_level {
                if computed != record.attenuation_value {
                    report.record(
                        fingerprint,
                        pass,
                        "classification",
                        Anomaly::ClassificationMismatch {
                            computed,
                            reported: record.attenuation_value,
                        },
                    );
                }
            }
        }

        record
    }
}

impl MergeReport {
    fn record(&mut self, fingerprint: Fingerprint, pass: usize, field: &str, anomaly: Anomaly) {
        warn!(
            day = %fingerprint.day,
            risk_level = fingerprint.transmission_risk_level,
            pass,
            field,
            "Anomaly: {}",
            anomaly
        );
        self.anomalies.push(AnomalyEvent {
            fingerprint,
            pass,
            field: field.to_string(),
            anomaly,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn exact(n: u32) -> BoundedValue {
        BoundedValue::from_exact(n)
    }

    fn at_least(n: u32) -> BoundedValue {
        BoundedValue::from_lower_bound(n)
    }

    fn measurement(day: u32, risk: u8, durations: [u32; 3], attenuation_value: u32) -> RawExposure {
        RawExposure {
            date: Utc.with_ymd_and_hms(2020, 6, day, 0, 0, 0).unwrap(),
            duration: durations.iter().sum(),
            total_risk_score: 42,
            transmission_risk_level: risk,
            attenuation_value,
            attenuation_durations: durations,
        }
    }

    fn merge(
        ladder: &PassLadder,
        records: &mut BTreeMap<Fingerprint, ExposureRecord>,
        incoming: &[RawExposure],
        pass: usize,
    ) -> MergeReport {
        MergeEngine::new(ladder).merge_batch(records, incoming, 5, pass)
    }

    #[test]
    fn test_first_pass_creates_records() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();

        let report = merge(&ladder, &mut records, &[measurement(7, 5, [5, 10, 10], 2)], 0);

        assert_eq!(report.created, 1);
        assert!(report.anomalies.is_empty());
        let record = records.values().next().unwrap();
        assert_eq!(record.profile.durations(), &[at_least(5), at_least(10), at_least(10)]);
        assert_eq!(record.profile.weighted_time(&[0, 6, 0]).value(), 60);
        assert_eq!(record.profile.total_time().value(), 25);
        assert_eq!(record.classified_level, Some(2));
        assert_eq!(record.duration, at_least(25));
        assert_eq!(record.pass_count, 1);
    }

    #[test]
    fn test_refinement_pass_tightens_bounds() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        merge(&ladder, &mut records, &[measurement(7, 5, [5, 10, 10], 2)], 0);

        let report = merge(&ladder, &mut records, &[measurement(7, 5, [5, 12, 10], 2)], 1);

        assert_eq!(report.refined, 1);
        assert!(report.anomalies.is_empty(), "{:?}", report.anomalies);
        let record = records.values().next().unwrap();
        assert_eq!(record.profile.bucket(1), Some(exact(12)));
        assert_eq!(record.duration, exact(27));
        assert_eq!(record.classified_level, Some(72 / 27));
        assert_eq!(record.pass_count, 2);
    }

    #[test]
    fn test_filters_by_risk_level() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();

        let report = merge(
            &ladder,
            &mut records,
            &[measurement(7, 5, [5, 10, 10], 2), measurement(7, 3, [1, 1, 1], 2)],
            0,
        );

        assert_eq!(report.created, 1);
        assert!(records.keys().all(|f| f.transmission_risk_level == 5));
    }

    #[test]
    fn test_same_pass_measurements_are_summed() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();

        merge(
            &ladder,
            &mut records,
            &[measurement(7, 5, [5, 10, 10], 2), measurement(7, 5, [0, 5, 0], 6)],
            0,
        );

        assert_eq!(records.len(), 1);
        let record = records.values().next().unwrap();
        assert_eq!(record.profile.durations(), &[at_least(5), at_least(15), at_least(10)]);
    }

    #[test]
    fn test_unmatched_records_left_untouched() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        merge(
            &ladder,
            &mut records,
            &[measurement(7, 5, [5, 10, 10], 2), measurement(8, 5, [0, 20, 0], 6)],
            0,
        );
        let before = records.clone();

        let report = merge(
            &ladder,
            &mut records,
            &[measurement(7, 5, [5, 12, 10], 2), measurement(9, 5, [1, 1, 1], 2)],
            1,
        );

        assert_eq!(report.refined, 1);
        assert_eq!(report.untouched, 1);
        assert_eq!(report.unmatched, 1);
        let day8 = before.keys().find(|f| f.day.to_string() == "2020-06-08").unwrap();
        assert_eq!(records[day8], before[day8]);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let ladder = PassLadder::default();
        let pass0 = [measurement(7, 5, [5, 10, 10], 2), measurement(8, 5, [30, 0, 0], 0)];
        let pass1 = [measurement(7, 5, [5, 12, 10], 2), measurement(8, 5, [35, 0, 0], 0)];

        let mut once = BTreeMap::new();
        merge(&ladder, &mut once, &pass0, 0);
        merge(&ladder, &mut once, &pass1, 1);

        let mut twice = BTreeMap::new();
        merge(&ladder, &mut twice, &pass0, 0);
        merge(&ladder, &mut twice, &pass0, 0);
        merge(&ladder, &mut twice, &pass1, 1);
        merge(&ladder, &mut twice, &pass1, 1);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_values_never_decrease_across_passes() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        let passes = [
            [5, 10, 10],
            [5, 12, 10],
            [5, 12, 10],
            [5, 12, 10],
        ];

        let mut previous: Option<ExposureRecord> = None;
        for (pass, durations) in passes.iter().enumerate() {
            merge(&ladder, &mut records, &[measurement(7, 5, *durations, 2)], pass);
            let current = records.values().next().unwrap().clone();

            if let Some(prev) = previous {
                for (old, new) in prev.profile.durations().iter().zip(current.profile.durations()) {
                    assert!(new.value() >= old.value());
                    if old.is_exact() {
                        assert_eq!(old, new);
                    }
                }
            }
            previous = Some(current);
        }
    }

    #[test]
    fn test_conflicting_exact_values_are_reported() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        merge(&ladder, &mut records, &[measurement(7, 5, [5, 10, 10], 2)], 0);
        merge(&ladder, &mut records, &[measurement(7, 5, [5, 12, 10], 2)], 1);

        let report = merge(&ladder, &mut records, &[measurement(7, 5, [5, 14, 10], 2)], 2);

        let fields: Vec<_> = report.anomalies.iter().map(|a| a.field.as_str()).collect();
        assert!(fields.contains(&"medium"));
        assert!(report
            .anomalies
            .iter()
            .any(|a| a.anomaly == Anomaly::ConflictingExact { left: 12, right: 14 }));
        assert!(report.anomalies.iter().all(|a| a.pass == 2));
        let record = records.values().next().unwrap();
        assert_eq!(record.profile.bucket(1), Some(exact(14)));
    }

    #[test]
    fn test_classification_mismatch_is_reported() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        merge(&ladder, &mut records, &[measurement(7, 5, [5, 10, 10], 2)], 0);

        let report = merge(&ladder, &mut records, &[measurement(7, 5, [5, 12, 10], 4)], 1);

        assert_eq!(
            report.anomalies.iter().map(|a| &a.anomaly).collect::<Vec<_>>(),
            vec![&Anomaly::ClassificationMismatch {
                computed: 2,
                reported: 4
            }]
        );
    }

    #[test]
    fn test_duration_mismatch_is_reported() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        merge(&ladder, &mut records, &[measurement(7, 5, [5, 10, 10], 2)], 0);

        let mut refined = measurement(7, 5, [5, 12, 10], 2);
        refined.duration = 29;
        let report = merge(&ladder, &mut records, &[refined], 1);

        assert!(report
            .anomalies
            .iter()
            .any(|a| a.field == "duration"
                && matches!(a.anomaly, Anomaly::DurationMismatch { duration: 29, .. })));
    }

    #[test]
    fn test_summed_windows_skip_classification_check() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        merge(&ladder, &mut records, &[measurement(7, 5, [5, 10, 10], 2)], 0);

        let report = merge(
            &ladder,
            &mut records,
            &[measurement(7, 5, [5, 10, 10], 2), measurement(7, 5, [0, 5, 0], 6)],
            1,
        );

        assert!(report.anomalies.is_empty(), "{:?}", report.anomalies);
        let record = records.values().next().unwrap();
        assert_eq!(record.profile.durations(), &[exact(5), exact(15), exact(10)]);
        assert_eq!(record.duration, exact(30));
        assert_eq!(record.classified_level, Some(90 / 30));
    }

    #[test]
    fn test_saturated_duration_above_exact_profile_is_reported() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        merge(&ladder, &mut records, &[measurement(7, 5, [5, 10, 10], 2)], 0);

        let mut refined = measurement(7, 5, [5, 12, 10], 2);
        refined.duration = 35;
        let report = merge(&ladder, &mut records, &[refined], 1);

        assert_eq!(
            report.anomalies.iter().map(|a| &a.anomaly).collect::<Vec<_>>(),
            vec![&Anomaly::DurationMismatch {
                buckets: exact(27),
                duration: 35
            }]
        );
        assert_eq!(records.values().next().unwrap().duration, at_least(35));
    }

    #[test]
    fn test_saturated_duration_promoted_by_exact_profile() {
        let ladder = PassLadder::default();
        let mut records = BTreeMap::new();
        merge(&ladder, &mut records, &[measurement(7, 5, [10, 10, 15], 2)], 0);

        let mut refined = measurement(7, 5, [10, 10, 15], 1);
        refined.duration = 30;
        merge(&ladder, &mut records, &[refined], 1);

        let record = records.values().next().unwrap();
        assert_eq!(record.duration, exact(35));
    }
}
