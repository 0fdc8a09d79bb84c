//! Data models for exposure refinement.
//!
//! This module contains the records exchanged with the scanning
//! collaborator, the persisted batch format, and the refined exposure
//! records that the merge engine maintains.

use crate::analysis::bounds::BoundedValue;
use crate::analysis::profile::{DurationProfile, DURATION_BUCKETS};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity used to merge measurements of the same exposure across passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub day: NaiveDate,
    pub transmission_risk_level: u8,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (risk {})", self.day, self.transmission_risk_level)
    }
}

/// One measurement returned by the scanning collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExposure {
    /// Day of the exposure (the collaborator reports midnight UTC).
    pub date: DateTime<Utc>,
    /// Total duration in minutes, saturating at the collaborator's cap.
    pub duration: u32,
    pub total_risk_score: u32,
    pub transmission_risk_level: u8,
    /// Attenuation classification computed by the collaborator.
    pub attenuation_value: u32,
    /// Minutes per attenuation bucket (low, medium, high).
    pub attenuation_durations: [u32; DURATION_BUCKETS],
}

impl RawExposure {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            day: self.date.date_naive(),
            transmission_risk_level: self.transmission_risk_level,
        }
    }
}

/// An exposure refined across passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureRecord {
    pub date: DateTime<Utc>,
    pub transmission_risk_level: u8,
    pub total_risk_score: u32,
    pub attenuation_value: u32,
    /// Total exposure duration in minutes.
    pub duration: BoundedValue,
    #[serde(rename = "attenuationDurations")]
    pub profile: DurationProfile,
    /// Weighted classification of the current profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classified_level: Option<u32>,
    /// One past the latest pass that reported this exposure.
    pub pass_count: usize,
}

impl ExposureRecord {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint {
            day: self.date.date_naive(),
            transmission_risk_level: self.transmission_risk_level,
        }
    }
}

/// A temporary exposure key shared by a contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisKey {
    #[serde(with = "base64_bytes")]
    pub key_data: Vec<u8>,
    pub rolling_period: u32,
    pub rolling_start_number: u32,
    pub transmission_risk_level: u8,
}

/// Keys packaged by a contact for import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPackage {
    pub user_name: String,
    pub date: DateTime<Utc>,
    pub keys: Vec<DiagnosisKey>,
}

/// Where a batch stands on the refinement ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "pass", rename_all = "snake_case")]
pub enum BatchState {
    /// No pass has been merged yet.
    Pending,
    /// The given pass was the last one merged.
    InPass(usize),
    /// Every pass of the ladder has been merged.
    Complete,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchState::Pending => write!(f, "Pending"),
            BatchState::InPass(p) => write!(f, "Pass {}", p),
            BatchState::Complete => write!(f, "Complete"),
        }
    }
}

/// All encounters with one contact, refined pass by pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub user_name: String,
    pub date_keys_sent: DateTime<Utc>,
    pub date_processed: DateTime<Utc>,
    pub transmission_risk_level: u8,
    pub keys: Vec<DiagnosisKey>,
    #[serde(with = "records_as_list", default)]
    pub exposures: BTreeMap<Fingerprint, ExposureRecord>,
    /// Number of passes merged so far.
    #[serde(default)]
    pub analysis_passes: usize,
}

impl Batch {
    /// Create a batch from imported keys, stamping every key with the
    /// batch's transmission risk level.
    pub fn new(package: KeyPackage, transmission_risk_level: u8) -> Self {
        let keys = package
            .keys
            .into_iter()
            .map(|key| DiagnosisKey {
                transmission_risk_level,
                ..key
            })
            .collect();

        Self {
            user_name: package.user_name,
            date_keys_sent: package.date,
            date_processed: Utc::now(),
            transmission_risk_level,
            keys,
            exposures: BTreeMap::new(),
            analysis_passes: 0,
        }
    }

    /// Index of the last merged pass, if any.
    pub fn last_pass(&self) -> Option<usize> {
        self.analysis_passes.checked_sub(1)
    }

    /// Number of passes a batch runs on a ladder of `ladder_len`
    /// configurations: `ladder_len - 1`, but never fewer than one.
    pub fn required_passes(ladder_len: usize) -> usize {
        ladder_len.saturating_sub(1).max(ladder_len.min(1))
    }

    /// Index of the pass that should run next, or `None` once the batch has
    /// run every required pass.
    pub fn next_pass(&self, ladder_len: usize) -> Option<usize> {
        (self.analysis_passes < Self::required_passes(ladder_len)).then_some(self.analysis_passes)
    }

    pub fn state(&self, ladder_len: usize) -> BatchState {
        if self.next_pass(ladder_len).is_none() {
            return BatchState::Complete;
        }
        match self.last_pass() {
            None => BatchState::Pending,
            Some(p) => BatchState::InPass(p),
        }
    }
}

/// Persist the fingerprint map as a plain list of records.
mod records_as_list {
    use super::{ExposureRecord, Fingerprint};
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        records: &BTreeMap<Fingerprint, ExposureRecord>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(records.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<Fingerprint, ExposureRecord>, D::Error> {
        let list = Vec::<ExposureRecord>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|r| (r.fingerprint(), r)).collect())
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn package() -> KeyPackage {
        KeyPackage {
            user_name: "Bob".to_string(),
            date: Utc.with_ymd_and_hms(2020, 6, 10, 12, 0, 0).unwrap(),
            keys: vec![
                DiagnosisKey {
                    key_data: vec![1, 2, 3, 4],
                    rolling_period: 144,
                    rolling_start_number: 2_654_208,
                    transmission_risk_level: 0,
                },
                DiagnosisKey {
                    key_data: vec![5, 6, 7, 8],
                    rolling_period: 144,
                    rolling_start_number: 2_654_352,
                    transmission_risk_level: 3,
                },
            ],
        }
    }

    #[test]
    fn test_batch_restamps_keys() {
        let batch = Batch::new(package(), 5);
        assert_eq!(batch.transmission_risk_level, 5);
        assert!(batch.keys.iter().all(|k| k.transmission_risk_level == 5));
        assert_eq!(batch.analysis_passes, 0);
    }

    #[test]
    fn test_batch_state_transitions() {
        let mut batch = Batch::new(package(), 0);
        assert_eq!(batch.state(4), BatchState::Pending);
        assert_eq!(batch.next_pass(4), Some(0));

        batch.analysis_passes = 1;
        assert_eq!(batch.state(4), BatchState::InPass(0));
        assert_eq!(batch.next_pass(4), Some(1));

        batch.analysis_passes = 2;
        assert_eq!(batch.state(4), BatchState::InPass(1));
        assert_eq!(batch.next_pass(4), Some(2));

        batch.analysis_passes = 3;
        assert_eq!(batch.state(4), BatchState::Complete);
        assert_eq!(batch.next_pass(4), None);
    }

    #[test]
    fn test_required_passes() {
        assert_eq!(Batch::required_passes(0), 0);
        assert_eq!(Batch::required_passes(1), 1);
        assert_eq!(Batch::required_passes(2), 1);
        assert_eq!(Batch::required_passes(4), 3);

        let mut batch = Batch::new(package(), 0);
        assert_eq!(batch.state(0), BatchState::Complete);
        assert_eq!(batch.next_pass(1), Some(0));
        batch.analysis_passes = 1;
        assert_eq!(batch.state(1), BatchState::Complete);
        assert_eq!(batch.next_pass(2), None);
    }

    #[test]
    fn test_fingerprint_ignores_time_of_day() {
        let morning = RawExposure {
            date: Utc.with_ymd_and_hms(2020, 6, 7, 1, 0, 0).unwrap(),
            duration: 25,
            total_risk_score: 42,
            transmission_risk_level: 5,
            attenuation_value: 2,
            attenuation_durations: [5, 10, 10],
        };
        let evening = RawExposure {
            date: Utc.with_ymd_and_hms(2020, 6, 7, 23, 0, 0).unwrap(),
            ..morning.clone()
        };
        assert_eq!(morning.fingerprint(), evening.fingerprint());
        assert_ne!(
            morning.fingerprint(),
            RawExposure {
                transmission_risk_level: 4,
                ..morning.clone()
            }
            .fingerprint()
        );
    }

    #[test]
    fn test_key_package_json() {
        let json = r#"{
            "userName": "Alice",
            "date": "2020-06-10T12:00:00Z",
            "keys": [{"keyData": "AQIDBA==", "rollingPeriod": 144,
                      "rollingStartNumber": 2654208, "transmissionRiskLevel": 0}]
        }"#;
        let package: KeyPackage = serde_json::from_str(json).unwrap();
        assert_eq!(package.user_name, "Alice");
        assert_eq!(package.keys[0].key_data, vec![1, 2, 3, 4]);

        let encoded = serde_json::to_string(&package).unwrap();
        assert!(encoded.contains("\"keyData\":\"AQIDBA==\""));
    }

    #[test]
    fn test_batch_persists_exposures_as_list() {
        let mut batch = Batch::new(package(), 5);
        let record = ExposureRecord {
            date: Utc.with_ymd_and_hms(2020, 6, 7, 0, 0, 0).unwrap(),
            transmission_risk_level: 5,
            total_risk_score: 42,
            attenuation_value: 2,
            duration: BoundedValue::from_lower_bound(25),
            profile: DurationProfile::default(),
            classified_level: None,
            pass_count: 1,
        };
        batch.exposures.insert(record.fingerprint(), record);

        let json = serde_json::to_value(&batch).unwrap();
        assert!(json["exposures"].is_array());
        assert_eq!(json["exposures"][0]["duration"], ">= 25");
        assert_eq!(json["analysisPasses"], 0);

        let back: Batch = serde_json::from_value(json).unwrap();
        assert_eq!(back, batch);
    }
}
