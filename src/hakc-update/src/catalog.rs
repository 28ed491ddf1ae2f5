//! Artifact planning: which remote files make up the desired state.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::api::{FeedEntryKind, ReleaseAsset, ReleaseFeed, ReleaseInfo};
use crate::category::Category;
use crate::error::{SyncError, SyncResult};

/// Countries with a frequency file directory in the freqman repository.
pub const FREQ_COUNTRIES: [&str; 11] = [
    "Australia",
    "Belgium",
    "France",
    "India",
    "Norway",
    "Poland",
    "Romanian",
    "Slovakia",
    "Sweden",
    "USA",
    "WorldWide",
];

const BUNDLE_MARKER: &str = "COPY_TO_SDCARD";
const NO_WORLD_MAP_MARKER: &str = "no-world-map";
const GENERIC_DIR: &str = "generic";
const COUNTRY_DIR: &str = "country-specific";

/// Which parts of the desired state a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentScope {
    /// Firmware bundle and frequency files
    #[default]
    Full,
    /// Firmware bundle only
    FirmwareOnly,
    /// Frequency files only
    FrequencyOnly,
    /// `pp_res` themes from the no-world-map bundle only
    ThemesOnly,
}

impl ContentScope {
    pub fn includes_firmware(&self) -> bool {
        matches!(self, Self::Full | Self::FirmwareOnly)
    }

    pub fn includes_frequencies(&self) -> bool {
        matches!(self, Self::Full | Self::FrequencyOnly)
    }
}

/// Requested optional content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub world_map: bool,
    /// Canonical country names, in whitelist order. Empty means all.
    #[serde(default)]
    pub countries: Vec<String>,
    #[serde(default)]
    pub scope: ContentScope,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            world_map: true,
            countries: Vec::new(),
            scope: ContentScope::Full,
        }
    }
}

impl FeatureSet {
    /// Build a feature set, validating country names against the whitelist.
    pub fn new<S: AsRef<str>>(
        world_map: bool,
        countries: &[S],
        scope: ContentScope,
    ) -> SyncResult<Self> {
        let mut requested = Vec::with_capacity(countries.len());
        for country in countries {
            let country = country.as_ref().trim();
            let canonical = FREQ_COUNTRIES
                .iter()
                .find(|c| c.eq_ignore_ascii_case(country))
                .ok_or_else(|| {
                    SyncError::config(format!(
                        "unknown country '{}' (expected one of: {})",
                        country,
                        FREQ_COUNTRIES.join(", ")
                    ))
                })?;
            requested.push(*canonical);
        }

        let countries = FREQ_COUNTRIES
            .iter()
            .filter(|c| requested.contains(c))
            .map(|c| c.to_string())
            .collect();

        Ok(Self {
            world_map,
            countries,
            scope,
        })
    }

    /// Countries whose frequency files are installed.
    pub fn effective_countries(&self) -> Vec<&str> {
        if self.countries.is_empty() {
            FREQ_COUNTRIES.to_vec()
        } else {
            self.countries.iter().map(String::as_str).collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Archive,
    SingleFile,
}

/// Optional feature an artifact belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureGate {
    WorldMap,
    Country(String),
}

/// One remote file of the desired state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File name, also the staged file name for single files
    pub name: String,
    pub url: String,
    pub category: Category,
    pub kind: ArtifactKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<FeatureGate>,
    /// Expected size in bytes; zero when unknown
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Archive categories to keep; all when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only: Option<Vec<Category>>,
}

impl Artifact {
    fn bundle(asset: &ReleaseAsset, world_map: bool) -> Self {
        Self {
            name: asset.name.clone(),
            url: asset.url.clone(),
            category: Category::Firmware,
            kind: ArtifactKind::Archive,
            gate: world_map.then_some(FeatureGate::WorldMap),
            size: asset.size,
            sha256: asset.sha256.clone(),
            only: None,
        }
    }

    /// Whether the artifact is part of the requested features.
    pub fn is_enabled(&self, features: &FeatureSet) -> bool {
        match &self.gate {
            None => true,
            Some(FeatureGate::WorldMap) => features.world_map,
            Some(FeatureGate::Country(country)) => features
                .effective_countries()
                .iter()
                .any(|c| c.eq_ignore_ascii_case(country)),
        }
    }
}

/// Planned artifacts for a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub artifacts: Vec<Artifact>,
    /// Feed directories that could not be listed
    pub unlisted: Vec<String>,
}

impl Plan {
    /// The firmware-bundle (or themes) archive, applied first.
    pub fn primary(&self) -> Option<&Artifact> {
        self.artifacts.iter().find(|a| a.kind == ArtifactKind::Archive)
    }

    pub fn total_size(&self) -> u64 {
        self.artifacts.iter().map(|a| a.size).sum()
    }
}

/// Turns a desired release plus a feature set into an ordered artifact list.
#[derive(Clone)]
pub struct ArtifactCatalog {
    feed: Arc<dyn ReleaseFeed>,
}

impl ArtifactCatalog {
    pub fn new(feed: Arc<dyn ReleaseFeed>) -> Self {
        Self { feed }
    }

    /// Plan the artifacts for `release` and `features`.
    ///
    /// The bundle archive comes first, followed by generic then per-country
    /// frequency files. A directory listing failure is recorded in
    /// [`Plan::unlisted`] and leaves the rest of the plan intact.
    pub async fn plan(&self, release: &ReleaseInfo, features: &FeatureSet) -> SyncResult<Plan> {
        let mut plan = Plan::default();

        match features.scope {
            ContentScope::Full | ContentScope::FirmwareOnly => {
                let asset = select_bundle(&release.assets, features.world_map)?;
                plan.artifacts.push(Artifact::bundle(asset, features.world_map));
            }
            ContentScope::ThemesOnly => {
                let asset = select_bundle(&release.assets, false)?;
                let mut artifact = Artifact::bundle(asset, false);
                artifact.category = Category::Resources;
                artifact.only = Some(vec![Category::Resources]);
                plan.artifacts.push(artifact);
            }
            ContentScope::FrequencyOnly => {}
        }

        if features.scope.includes_frequencies() {
            self.plan_frequencies(features, &mut plan).await?;
        }

        plan.artifacts.retain(|a| a.is_enabled(features));
        Ok(plan)
    }

    async fn plan_frequencies(&self, features: &FeatureSet, plan: &mut Plan) -> SyncResult<()> {
        let mut seen: HashSet<String> = HashSet::new();

        let mut dirs: Vec<(String, Option<FeatureGate>)> = vec![(GENERIC_DIR.to_string(), None)];
        for country in features.effective_countries() {
            dirs.push((
                format!("{}/{}", COUNTRY_DIR, country),
                Some(FeatureGate::Country(country.to_string())),
            ));
        }

        for (dir, gate) in dirs {
            let entries = match self.feed.list_directory(&dir).await {
                Ok(entries) => entries,
                Err(SyncError::FeedUnavailable { message }) => {
                    tracing::warn!("Cannot list {}: {}", dir, message);
                    plan.unlisted.push(dir);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut entries: Vec<_> = entries
                .into_iter()
                .filter(|e| e.kind == FeedEntryKind::File)
                .filter(|e| gate.is_some() || has_txt_extension(&e.name))
                .collect();
            entries.sort_by(|a, b| a.name.cmp(&b.name));

            for entry in entries {
                let Some(url) = entry.download_url else {
                    tracing::warn!("{} has no download URL, skipping", entry.path);
                    continue;
                };
                if !seen.insert(entry.name.to_ascii_lowercase()) {
                    tracing::debug!("{} already planned, skipping {}", entry.name, entry.path);
                    continue;
                }
                plan.artifacts.push(Artifact {
                    name: entry.name,
                    url,
                    category: Category::Freqman,
                    kind: ArtifactKind::SingleFile,
                    gate: gate.clone(),
                    size: entry.size,
                    sha256: None,
                    only: None,
                });
            }
        }
        Ok(())
    }
}

fn has_txt_extension(name: &str) -> bool {
    name.rsplit_once('.')
        .is_some_and(|(_, ext)| ext.eq_ignore_ascii_case("txt"))
}

/// Pick the SD card bundle matching the world-map choice.
fn select_bundle(assets: &[ReleaseAsset], world_map: bool) -> SyncResult<&ReleaseAsset> {
    assets
        .iter()
        .filter(|a| a.name.contains(BUNDLE_MARKER))
        .find(|a| a.name.contains(NO_WORLD_MAP_MARKER) != world_map)
        .ok_or_else(|| {
            SyncError::feed(format!(
                "release has no {} bundle {} world map",
                BUNDLE_MARKER,
                if world_map { "with" } else { "without" }
            ))
        })
}
