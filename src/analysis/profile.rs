//! Per-bucket exposure durations.

use super::bounds::{Anomaly, BoundedValue};
use super::passes::{PassConfiguration, PassLadder};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of attenuation buckets reported per measurement.
pub const DURATION_BUCKETS: usize = 3;

/// Bucket names, in collaborator order.
pub const BUCKET_NAMES: [&str; DURATION_BUCKETS] = ["low", "medium", "high"];

/// Minutes spent in each attenuation bucket (low, medium, high).
///
/// Bucket boundaries are those of the pass that produced the profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationProfile {
    durations: [BoundedValue; DURATION_BUCKETS],
}

/// Anomaly found while merging one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketAnomaly {
    pub bucket: usize,
    pub anomaly: Anomaly,
}

impl DurationProfile {
    pub fn new(durations: [BoundedValue; DURATION_BUCKETS]) -> Self {
        Self { durations }
    }

    /// Build a profile from raw collaborator minutes for the given pass.
    pub fn from_minutes(ladder: &PassLadder, pass: usize, minutes: [u32; DURATION_BUCKETS]) -> Self {
        Self {
            durations: minutes.map(|m| ladder.bound_for(pass, m)),
        }
    }

    #[allow(dead_code)] // Accessor for tests
    pub fn durations(&self) -> &[BoundedValue; DURATION_BUCKETS] {
        &self.durations
    }

    #[allow(dead_code)] // Accessor for tests
    pub fn bucket(&self, index: usize) -> Option<BoundedValue> {
        self.durations.get(index).copied()
    }

    /// Whether every bucket is an exact measurement.
    pub fn is_exact(&self) -> bool {
        self.durations.iter().all(BoundedValue::is_exact)
    }

    /// Sum of all buckets.
    pub fn total_time(&self) -> BoundedValue {
        self.durations
            .iter()
            .fold(BoundedValue::ZERO, |acc, d| acc.add(*d))
    }

    /// Time in the low and medium buckets.
    pub fn close_time(&self) -> BoundedValue {
        self.durations[0].add(self.durations[1])
    }

    /// Weighted sum of buckets.
    pub fn weighted_time(&self, weights: &[u32; DURATION_BUCKETS]) -> BoundedValue {
        self.durations
            .iter()
            .zip(weights)
            .fold(BoundedValue::ZERO, |acc, (d, w)| acc.add(d.scale(*w)))
    }

    /// `weighted_time / total_time`, or `None` when no time was recorded.
    pub fn classified_level(&self, weights: &[u32; DURATION_BUCKETS]) -> Option<u32> {
        let total = self.total_time().value();
        if total == 0 {
            return None;
        }
        Some(self.weighted_time(weights).divide(total).value())
    }

    /// Classification under the weights of the given pass.
    pub fn classify(&self, config: &PassConfiguration) -> Option<u32> {
        self.classified_level(&config.weights)
    }

    /// Bucket-wise sum, for several measurements within one pass.
    pub fn add(&self, other: &DurationProfile) -> DurationProfile {
        let mut durations = self.durations;
        for (d, o) in durations.iter_mut().zip(other.durations) {
            *d = d.add(o);
        }
        DurationProfile { durations }
    }

    /// Refine this profile with a later observation of the same exposure.
    ///
    /// Buckets are intersected, never summed.
    pub fn merge(&self, incoming: &DurationProfile) -> (DurationProfile, Vec<BucketAnomaly>) {
        let mut anomalies = Vec::new();
        let mut durations = self.durations;

        for (bucket, (d, new)) in durations.iter_mut().zip(incoming.durations).enumerate() {
            let checked = d.intersect(new);
            if let Some(anomaly) = checked.anomaly {
                anomalies.push(BucketAnomaly { bucket, anomaly });
            }
            *d = checked.value;
        }

        (DurationProfile { durations }, anomalies)
    }
}

impl fmt::Display for DurationProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [low, medium, high] = &self.durations;
        write!(f, "{}/{}/{}", low, medium, high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact(n: u32) -> BoundedValue {
        BoundedValue::from_exact(n)
    }

    fn at_least(n: u32) -> BoundedValue {
        BoundedValue::from_lower_bound(n)
    }

    const WEIGHTS: [u32; 3] = [0, 6, 0];

    #[test]
    fn test_derived_fields() {
        let profile = DurationProfile::new([exact(5), exact(10), exact(10)]);
        assert_eq!(profile.weighted_time(&WEIGHTS), exact(60));
        assert_eq!(profile.total_time(), exact(25));
        assert_eq!(profile.classified_level(&WEIGHTS), Some(2));
        assert_eq!(profile.close_time(), exact(15));
    }

    #[test]
    fn test_classified_level_skips_empty_profile() {
        let profile = DurationProfile::new([exact(0); 3]);
        assert_eq!(profile.classified_level(&WEIGHTS), None);
    }

    #[test]
    fn test_from_minutes_uses_pass_precision() {
        let ladder = PassLadder::default();
        let triage = DurationProfile::from_minutes(&ladder, 0, [5, 10, 10]);
        assert!(!triage.is_exact());
        assert_eq!(triage.total_time(), at_least(25));

        let refined = DurationProfile::from_minutes(&ladder, 1, [5, 12, 30]);
        assert_eq!(refined.durations(), &[exact(5), exact(12), at_least(30)]);
    }

    #[test]
    fn test_merge_refines_lower_bounds() {
        let ladder = PassLadder::default();
        let earlier = DurationProfile::from_minutes(&ladder, 0, [5, 10, 10]);
        let later = DurationProfile::from_minutes(&ladder, 1, [5, 12, 10]);

        let (merged, anomalies) = earlier.merge(&later);
        assert!(anomalies.is_empty());
        assert_eq!(merged.bucket(1), Some(exact(12)));
        assert!(merged.is_exact());
        assert_eq!(merged.weighted_time(&WEIGHTS), exact(72));
        assert_eq!(merged.classified_level(&WEIGHTS), Some(2));
    }

    #[test]
    fn test_merge_reports_bucket_anomalies() {
        let settled = DurationProfile::new([exact(5), exact(12), exact(10)]);
        let conflicting = DurationProfile::new([exact(5), exact(9), exact(10)]);

        let (merged, anomalies) = settled.merge(&conflicting);
        assert_eq!(merged.bucket(1), Some(exact(12)));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].bucket, 1);
    }

    #[test]
    fn test_add_within_pass() {
        let a = DurationProfile::new([exact(5), exact(10), at_least(30)]);
        let b = DurationProfile::new([exact(1), exact(2), exact(3)]);
        let sum = a.add(&b);
        assert_eq!(sum.durations(), &[exact(6), exact(12), at_least(33)]);
        assert_eq!(sum.to_string(), "6/12/>= 33");
    }
}
