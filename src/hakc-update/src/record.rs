//! Persisted description of what was last installed on a volume.

use std::collections::BTreeMap;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{ContentScope, FeatureSet};
use crate::category::Category;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::ReconcileReport;
use crate::version::Version;
use crate::volume::VolumeTree;

/// SHA256 of shipped MERGE files, per category and relative path.
pub type Fingerprints = BTreeMap<Category, BTreeMap<String, String>>;

/// The install record stored at `.hakc/install_record.json` on the volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    /// Release the last committed run reconciled against
    pub version: Version,
    /// Firmware bundle on the volume; unset until a run including firmware
    /// succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Version>,
    pub features: FeatureSet,
    #[serde(default)]
    pub fingerprints: Fingerprints,
    /// Artifacts that were skipped by the run that wrote this record
    #[serde(default)]
    pub degraded: Vec<String>,
    pub applied_at: DateTime<Utc>,
}

impl InstallRecord {
    /// Load the record of `volume`. A missing or unreadable record counts as
    /// no record.
    pub fn load(volume: &VolumeTree) -> SyncResult<Option<Self>> {
        let path = volume.record_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(
                    "Ignoring unreadable install record {}: {}",
                    path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    /// Version a run of `scope` is compared against: the installed firmware
    /// when the run includes it, otherwise the last reconciled release.
    pub fn installed_for(&self, scope: ContentScope) -> Option<&Version> {
        if scope.includes_firmware() {
            self.firmware.as_ref()
        } else {
            Some(&self.version)
        }
    }

    /// Record for a finished run against `version`.
    ///
    /// Runs that did not install firmware keep the prior firmware version.
    /// Fingerprints of earlier runs are carried forward and overwritten by what
    /// this run shipped.
    pub fn next(
        prior: Option<&InstallRecord>,
        version: &Version,
        firmware_installed: bool,
        features: &FeatureSet,
        report: &ReconcileReport,
        degraded: Vec<String>,
    ) -> Self {
        let mut fingerprints = prior.map(|p| p.fingerprints.clone()).unwrap_or_default();
        for (category, shipped) in &report.shipped {
            fingerprints.insert(*category, shipped.clone());
        }

        let firmware = if firmware_installed {
            Some(version.clone())
        } else {
            prior.and_then(|p| p.firmware.clone())
        };

        Self {
            version: version.clone(),
            firmware,
            features: features.clone(),
            fingerprints,
            degraded,
            applied_at: Utc::now(),
        }
    }

    /// Same installed state, ignoring when it was applied.
    pub fn same_state(&self, other: &InstallRecord) -> bool {
        self.version == other.version
            && self.firmware == other.firmware
            && self.features == other.features
            && self.fingerprints == other.fingerprints
            && self.degraded == other.degraded
    }

    /// Write the record to `volume` unless `report` carries a fatal failure or
    /// nothing changed since `prior`.
    ///
    /// Returns whether the record was written.
    pub fn commit(
        &self,
        volume: &VolumeTree,
        report: &ReconcileReport,
        prior: Option<&InstallRecord>,
    ) -> SyncResult<bool> {
        if report.is_fatal() {
            tracing::warn!("Not updating install record after a failed apply");
            return Ok(false);
        }
        if prior.is_some_and(|prior| self.same_state(prior)) {
            tracing::debug!("Install record unchanged");
            return Ok(false);
        }
        let content = serde_json::to_string_pretty(self)?;
        hakc_common::atomic_write(volume.record_path(), content.as_bytes())
            .map_err(|e| SyncError::Io(io::Error::other(e.to_string())))?;
        tracing::debug!("Committed install record {}", volume.record_path().display());
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self {
            version: Version::parse("v2.0.2", crate::config::ReleaseChannel::Stable, None)
                .unwrap(),
            firmware: None,
            features: FeatureSet::default(),
            fingerprints: Fingerprints::new(),
            degraded: Vec::new(),
            applied_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReleaseChannel;
    use crate::error::ApplyError;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn version(tag: &str) -> Version {
        Version::parse(tag, ReleaseChannel::Stable, None).unwrap()
    }

    fn shipped(entries: &[(Category, &str, &str)]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for (category, path, digest) in entries {
            report
                .shipped
                .entry(*category)
                .or_default()
                .insert(path.to_string(), digest.to_string());
        }
        report
    }

    #[test]
    fn test_missing_record_is_none() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeTree::open(dir.path()).unwrap();
        assert!(InstallRecord::load(&volume).unwrap().is_none());
    }

    #[test]
    fn test_commit_then_load() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeTree::open(dir.path()).unwrap();
        let report = shipped(&[(Category::Freqman, "ham.txt", "aa")]);

        let record = InstallRecord::next(
            None,
            &version("v2.0.2"),
            true,
            &FeatureSet::default(),
            &report,
            Vec::new(),
        );
        assert!(record.commit(&volume, &report, None).unwrap());

        let loaded = InstallRecord::load(&volume).unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.version.channel(), ReleaseChannel::Stable);
        assert_eq!(loaded.firmware, Some(version("v2.0.2")));
    }

    #[test]
    fn test_unchanged_record_is_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeTree::open(dir.path()).unwrap();
        let report = shipped(&[(Category::Freqman, "ham.txt", "aa")]);
        let features = FeatureSet::new::<&str>(true, &[], ContentScope::FrequencyOnly).unwrap();

        let first = InstallRecord::next(
            None,
            &version("v2.0.2"),
            false,
            &features,
            &report,
            vec![],
        );
        assert!(first.commit(&volume, &report, None).unwrap());
        let bytes = std::fs::read(volume.record_path()).unwrap();

        let again = InstallRecord::next(
            Some(&first),
            &version("v2.0.2"),
            false,
            &features,
            &report,
            vec![],
        );
        assert!(again.same_state(&first));
        assert!(!again.commit(&volume, &report, Some(&first)).unwrap());
        assert_eq!(std::fs::read(volume.record_path()).unwrap(), bytes);

        let newer = InstallRecord::next(
            Some(&first),
            &version("v2.0.3"),
            false,
            &features,
            &report,
            vec![],
        );
        assert!(newer.commit(&volume, &report, Some(&first)).unwrap());
    }

    #[test]
    fn test_fatal_report_is_not_committed() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeTree::open(dir.path()).unwrap();
        let mut report = ReconcileReport::default();
        report.fatal = Some(ApplyError::Cancelled {
            category: Category::Firmware,
        });

        let record = InstallRecord::next(
            None,
            &version("v2.0.2"),
            true,
            &FeatureSet::default(),
            &report,
            Vec::new(),
        );
        assert!(!record.commit(&volume, &report, None).unwrap());
        assert!(!volume.record_path().exists());
    }

    #[test]
    fn test_fingerprints_and_version_carry_forward() {
        let prior = InstallRecord::next(
            None,
            &version("v2.0.1"),
            true,
            &FeatureSet::default(),
            &shipped(&[
                (Category::Freqman, "ham.txt", "aa"),
                (Category::Gps, "almanac.yuma", "gg"),
            ]),
            Vec::new(),
        );

        let report = shipped(&[(Category::Freqman, "ham.txt", "bb")]);
        let frequencies =
            FeatureSet::new::<&str>(true, &[], ContentScope::FrequencyOnly).unwrap();
        let next = InstallRecord::next(
            Some(&prior),
            &version("v2.0.2"),
            false,
            &frequencies,
            &report,
            vec!["police.txt".to_string()],
        );

        assert_eq!(next.version, version("v2.0.2"));
        assert_eq!(next.firmware, Some(version("v2.0.1")));
        assert_eq!(
            next.installed_for(ContentScope::FrequencyOnly),
            Some(&version("v2.0.2"))
        );
        assert_eq!(next.installed_for(ContentScope::Full), Some(&version("v2.0.1")));
        assert_eq!(next.fingerprints[&Category::Freqman]["ham.txt"], "bb");
        assert_eq!(next.fingerprints[&Category::Gps]["almanac.yuma"], "gg");
        assert_eq!(next.degraded, vec!["police.txt"]);
    }

    #[test]
    fn test_corrupt_record_counts_as_missing() {
        let dir = TempDir::new().unwrap();
        let volume = VolumeTree::open(dir.path()).unwrap();
        std::fs::create_dir_all(volume.state_dir()).unwrap();
        std::fs::write(volume.record_path(), "{ truncated").unwrap();
        assert!(InstallRecord::load(&volume).unwrap().is_none());
    }
}
