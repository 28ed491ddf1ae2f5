//! End-to-end runs against a mock release feed and a scratch volume.

use std::io::{Cursor, Write};
use std::path::Path;
use std::time::{Duration, SystemTime};

use hakc_update::{
    Category, Comparison, ContentScope, FeatureSet, InstallRecord, ReleaseChannel, RunOptions,
    RunOutcome, SyncConfig, SyncError, SyncManager, VolumeTree,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use zip::write::SimpleFileOptions;

fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, body) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(body.as_bytes()).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

struct Feed {
    server: MockServer,
}

impl Feed {
    async fn start() -> Self {
        let server = MockServer::start().await;
        let feed = Self { server };

        let full = zip_bytes(&[
            ("FIRMWARE/portapack-mayhem.bin", "firmware v2.0.2"),
            ("APPS/audio.ppma", "audio app"),
            ("pp_res/theme.bmp", "theme"),
            ("OSM/world.bin", "world map"),
            ("FREQMAN/BHT.TXT", "f=27000000"),
        ]);
        let small = zip_bytes(&[
            ("FIRMWARE/portapack-mayhem.bin", "firmware v2.0.2"),
            ("APPS/audio.ppma", "audio app"),
            ("pp_res/theme.bmp", "theme"),
        ]);
        feed.serve("/dl/mayhem_v2.0.2_COPY_TO_SDCARD.zip", full.clone())
            .await;
        feed.serve(
            "/dl/mayhem_v2.0.2_COPY_TO_SDCARD-no-world-map.zip",
            small.clone(),
        )
        .await;

        let uri = feed.server.uri();
        let asset = |name: &str, size: usize| {
            json!({
                "name": name,
                "browser_download_url": format!("{uri}/dl/{name}"),
                "size": size,
            })
        };
        Mock::given(method("GET"))
            .and(path("/releases/latest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tag_name": "v2.0.2",
                "prerelease": false,
                "published_at": "2024-10-01T12:00:00Z",
                "assets": [
                    asset("mayhem_v2.0.2_FIRMWARE.zip", 1),
                    asset("mayhem_v2.0.2_COPY_TO_SDCARD.zip", full.len()),
                    asset("mayhem_v2.0.2_COPY_TO_SDCARD-no-world-map.zip", small.len()),
                ],
            })))
            .mount(&feed.server)
            .await;
        Mock::given(method("GET"))
            .and(path("/releases"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"tag_name": "v2.0.2", "prerelease": false, "published_at": "2024-10-01T12:00:00Z"},
                {
                    "tag_name": "nightly-tag-20241105",
                    "prerelease": true,
                    "published_at": "2024-11-05T03:00:00Z",
                    "assets": [asset("mayhem_nightly_COPY_TO_SDCARD.zip", full.len())]
                }
            ])))
            .mount(&feed.server)
            .await;

        feed.freqman_dir("generic", &[("ham.txt", "f=145500000"), ("notes.md", "x")])
            .await;
        feed.freqman_dir("country-specific/USA", &[("police.txt", "f=460000000")])
            .await;
        feed.freqman_dir("country-specific/France", &[("pmr.txt", "f=446006250")])
            .await;
        feed.freqman_dir("country-specific/Sweden", &[("sweden.txt", "f=1")])
            .await;
        feed
    }

    async fn serve(&self, route: &str, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&self.server)
            .await;
    }

    async fn freqman_dir(&self, dir: &str, files: &[(&str, &str)]) {
        let uri = self.server.uri();
        let entries: Vec<_> = files
            .iter()
            .map(|(name, body)| {
                json!({
                    "name": name,
                    "path": format!("{dir}/{name}"),
                    "type": "file",
                    "size": body.len(),
                    "download_url": format!("{uri}/raw/{dir}/{name}"),
                })
            })
            .collect();
        Mock::given(method("GET"))
            .and(path(format!("/contents/{dir}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(entries))
            .mount(&self.server)
            .await;
        for (name, body) in files {
            self.serve(&format!("/raw/{dir}/{name}"), body.as_bytes().to_vec())
                .await;
        }
    }

    fn config(&self, volume: &Path, backups: &Path) -> SyncConfig {
        SyncConfig {
            mount_point: volume.to_path_buf(),
            releases_url: format!("{}/releases", self.server.uri()),
            freqman_api_url: format!("{}/contents", self.server.uri()),
            min_free_space_mb: 0,
            backup_root: Some(backups.to_path_buf()),
            ..Default::default()
        }
    }

    fn manager(&self, volume: &Path, backups: &Path) -> SyncManager {
        SyncManager::new(self.config(volume, backups)).unwrap()
    }
}

fn full_options(countries: &[&str]) -> RunOptions {
    RunOptions::new(
        ReleaseChannel::Stable,
        FeatureSet::new(true, countries, ContentScope::Full).unwrap(),
    )
}

fn read(root: &Path, relative: &str) -> String {
    std::fs::read_to_string(root.join(relative)).unwrap()
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path).unwrap().modified().unwrap()
}

#[tokio::test]
async fn test_fresh_full_install() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();

    let summary = feed
        .manager(volume.path(), backups.path())
        .run(&full_options(&["USA"]))
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.comparison, Comparison::NoPriorRecord);
    assert!(summary.applied);
    assert!(summary.record_committed);
    assert_eq!(
        read(volume.path(), "FIRMWARE/portapack-mayhem.bin"),
        "firmware v2.0.2"
    );
    assert_eq!(read(volume.path(), "OSM/world.bin"), "world map");
    assert_eq!(read(volume.path(), "FREQMAN/ham.txt"), "f=145500000");
    assert_eq!(read(volume.path(), "FREQMAN/police.txt"), "f=460000000");
    assert_eq!(read(volume.path(), "FREQMAN/BHT.TXT"), "f=27000000");
    assert!(!volume.path().join("FREQMAN/notes.md").exists());
    assert!(!volume.path().join("FREQMAN/pmr.txt").exists());
    assert!(!volume.path().join("FREQMAN/sweden.txt").exists());

    let tree = VolumeTree::open(volume.path()).unwrap();
    assert!(!tree.lock_path().exists());
    let record = InstallRecord::load(&tree).unwrap().unwrap();
    assert_eq!(record.version.tag, "v2.0.2");
    assert_eq!(record.firmware.unwrap().tag, "v2.0.2");
    assert!(record.fingerprints[&Category::Freqman].contains_key("police.txt"));
}

#[tokio::test]
async fn test_rerun_when_up_to_date_changes_nothing() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let manager = feed.manager(volume.path(), backups.path());
    let options = full_options(&["USA"]);

    manager.run(&options).await.unwrap();
    let tree = VolumeTree::open(volume.path()).unwrap();
    let record_before = std::fs::read(tree.record_path()).unwrap();
    let firmware_before = mtime(&volume.path().join("FIRMWARE/portapack-mayhem.bin"));

    let summary = manager.run(&options).await.unwrap();
    assert_eq!(summary.comparison, Comparison::UpToDate);
    assert!(!summary.applied);
    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(std::fs::read(tree.record_path()).unwrap(), record_before);
    assert_eq!(
        mtime(&volume.path().join("FIRMWARE/portapack-mayhem.bin")),
        firmware_before
    );
}

#[tokio::test]
async fn test_frequency_only_keeps_user_files() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    std::fs::create_dir_all(volume.path().join("FREQMAN")).unwrap();
    std::fs::write(volume.path().join("FREQMAN/custom.txt"), "my channels").unwrap();

    let options = RunOptions::new(
        ReleaseChannel::Stable,
        FeatureSet::new(true, &["usa", "France"], ContentScope::FrequencyOnly).unwrap(),
    );
    let summary = feed
        .manager(volume.path(), backups.path())
        .run(&options)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(read(volume.path(), "FREQMAN/custom.txt"), "my channels");
    assert_eq!(read(volume.path(), "FREQMAN/police.txt"), "f=460000000");
    assert_eq!(read(volume.path(), "FREQMAN/pmr.txt"), "f=446006250");
    assert!(!volume.path().join("FREQMAN/sweden.txt").exists());
    assert!(!volume.path().join("FIRMWARE").exists());

    let record = InstallRecord::load(&VolumeTree::open(volume.path()).unwrap())
        .unwrap()
        .unwrap();
    assert_eq!(record.version.tag, "v2.0.2");
    assert!(record.firmware.is_none());
}

#[tokio::test]
async fn test_frequency_rerun_writes_nothing() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let manager = feed.manager(volume.path(), backups.path());
    let options = RunOptions::new(
        ReleaseChannel::Stable,
        FeatureSet::new(true, &["USA"], ContentScope::FrequencyOnly).unwrap(),
    );

    manager.run(&options).await.unwrap();
    let tree = VolumeTree::open(volume.path()).unwrap();
    let record_before = std::fs::read(tree.record_path()).unwrap();
    let police_before = mtime(&volume.path().join("FREQMAN/police.txt"));

    let summary = manager.run(&options).await.unwrap();
    assert_eq!(summary.comparison, Comparison::UpToDate);
    assert!(!summary.applied);
    assert_eq!(std::fs::read(tree.record_path()).unwrap(), record_before);
    assert_eq!(mtime(&volume.path().join("FREQMAN/police.txt")), police_before);

    // Forcing reconciles again, but the record describes the same state.
    let mut forced = options.clone();
    forced.force = true;
    let summary = manager.run(&forced).await.unwrap();
    assert!(summary.applied);
    assert!(!summary.record_committed);
    assert_eq!(std::fs::read(tree.record_path()).unwrap(), record_before);
}

#[tokio::test]
async fn test_check_nightly_does_not_touch_volume() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let manager = feed.manager(volume.path(), backups.path());

    let stable = RunOptions::new(
        ReleaseChannel::Stable,
        FeatureSet::new::<&str>(true, &[], ContentScope::FirmwareOnly).unwrap(),
    );
    manager.run(&stable).await.unwrap();
    let tree = VolumeTree::open(volume.path()).unwrap();
    let record_before = std::fs::read(tree.record_path()).unwrap();
    let firmware_before = mtime(&volume.path().join("FIRMWARE/portapack-mayhem.bin"));

    let nightly = RunOptions::new(ReleaseChannel::Nightly, stable.features.clone());
    let report = manager.check(&nightly).await.unwrap();

    assert_eq!(report.desired.tag, "nightly-tag-20241105");
    assert_eq!(report.installed.unwrap().tag, "v2.0.2");
    assert_eq!(report.comparison, Comparison::UpdateAvailable);
    assert!(report.volume_present);
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(std::fs::read(tree.record_path()).unwrap(), record_before);
    assert_eq!(
        mtime(&volume.path().join("FIRMWARE/portapack-mayhem.bin")),
        firmware_before
    );
    assert!(!tree.lock_path().exists());
}

#[tokio::test]
async fn test_check_without_volume() {
    let feed = Feed::start().await;
    let backups = TempDir::new().unwrap();
    let missing = backups.path().join("PORTAPACK");

    let report = feed
        .manager(&missing, backups.path())
        .check(&full_options(&["USA"]))
        .await
        .unwrap();
    assert!(!report.volume_present);
    assert_eq!(report.comparison, Comparison::NoPriorRecord);
    assert_eq!(report.artifacts.len(), 3);
    assert!(!missing.exists());
}

#[test]
fn test_unknown_country_is_a_config_error() {
    match FeatureSet::new(true, &["Atlantis"], ContentScope::Full) {
        Err(e @ SyncError::Config { .. }) => assert_eq!(e.exit_code(), 2),
        other => panic!("expected config error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_preserve_folders_keep_their_timestamps() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let capture = volume.path().join("CAPTURES/sweep.C16");
    std::fs::create_dir_all(capture.parent().unwrap()).unwrap();
    std::fs::write(&capture, "iq data").unwrap();
    let old = SystemTime::now() - Duration::from_secs(86_400);
    std::fs::File::options()
        .write(true)
        .open(&capture)
        .unwrap()
        .set_modified(old)
        .unwrap();
    let before = mtime(&capture);

    let summary = feed
        .manager(volume.path(), backups.path())
        .run(&full_options(&["USA"]))
        .await
        .unwrap();

    assert_eq!(mtime(&capture), before);
    assert_eq!(read(volume.path(), "CAPTURES/sweep.C16"), "iq data");
    assert_eq!(
        summary.report.category(Category::Captures).unwrap().preserved,
        1
    );
}

#[tokio::test]
async fn test_interrupted_replace_resumes() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let manager = feed.manager(volume.path(), backups.path());
    let options = full_options(&["USA"]);
    manager.run(&options).await.unwrap();

    // A run that died mid-copy of FIRMWARE: partial file and no new record.
    let tree = VolumeTree::open(volume.path()).unwrap();
    std::fs::write(volume.path().join("FIRMWARE/portapack-mayhem.bin"), "firm").unwrap();
    std::fs::remove_file(tree.sentinel_path(Category::Firmware)).unwrap();
    std::fs::remove_file(tree.record_path()).unwrap();

    let summary = manager.run(&options).await.unwrap();
    let firmware = summary.report.category(Category::Firmware).unwrap();
    assert_eq!(firmware.replaced, 1);
    let apps = summary.report.category(Category::Apps).unwrap();
    assert_eq!((apps.replaced, apps.skipped), (0, 1));
    assert_eq!(
        read(volume.path(), "FIRMWARE/portapack-mayhem.bin"),
        "firmware v2.0.2"
    );
}

#[tokio::test]
async fn test_missing_country_file_degrades_run() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();

    // Advertised with a URL that the server does not serve.
    Mock::given(method("GET"))
        .and(path("/contents/country-specific/Norway"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
            "name": "broken.txt",
            "path": "country-specific/Norway/broken.txt",
            "type": "file",
            "size": 3,
            "download_url": format!("{}/raw/missing/broken.txt", feed.server.uri()),
        }])))
        .mount(&feed.server)
        .await;

    let summary = feed
        .manager(volume.path(), backups.path())
        .run(&full_options(&["Norway"]))
        .await
        .unwrap();
    assert_eq!(summary.outcome, RunOutcome::PartialSuccess);
    assert_eq!(summary.degraded, vec!["broken.txt"]);
    assert!(summary.record_committed);

    // A degraded run is retried even though the version is current.
    let again = feed
        .manager(volume.path(), backups.path())
        .run(&full_options(&["Norway"]))
        .await
        .unwrap();
    assert!(again.applied);
}

#[tokio::test]
async fn test_firmware_fetch_failure_aborts_without_record() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/releases/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tag_name": "v2.0.2",
            "assets": [{
                "name": "mayhem_v2.0.2_COPY_TO_SDCARD.zip",
                "browser_download_url": format!("{}/dl/missing.zip", server.uri()),
                "size": 10,
            }],
        })))
        .mount(&server)
        .await;

    let volume = TempDir::new().unwrap();
    let config = SyncConfig {
        mount_point: volume.path().to_path_buf(),
        releases_url: format!("{}/releases", server.uri()),
        freqman_api_url: format!("{}/contents", server.uri()),
        min_free_space_mb: 0,
        ..Default::default()
    };
    let options = RunOptions::new(
        ReleaseChannel::Stable,
        FeatureSet::new::<&str>(true, &[], ContentScope::FirmwareOnly).unwrap(),
    );

    let err = SyncManager::new(config)
        .unwrap()
        .run(&options)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Fetch { .. }));
    assert_eq!(err.exit_code(), 6);
    let tree = VolumeTree::open(volume.path()).unwrap();
    assert!(!tree.record_path().exists());
    assert!(!tree.lock_path().exists());
}

#[tokio::test]
async fn test_lock_held_by_another_run() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let tree = VolumeTree::open(volume.path()).unwrap();
    let _held = tree.lock(Duration::from_secs(1800)).unwrap();

    let err = feed
        .manager(volume.path(), backups.path())
        .run(&full_options(&["USA"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::LockHeld { .. }));
    assert_eq!(err.exit_code(), 4);
    assert!(!volume.path().join("FIRMWARE").exists());
}

#[tokio::test]
async fn test_backup_runs_before_apply() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    std::fs::create_dir_all(volume.path().join("SCREENSHOTS")).unwrap();
    std::fs::write(volume.path().join("SCREENSHOTS/shot.png"), "png").unwrap();

    let mut options = full_options(&["USA"]);
    options.backup = true;
    let summary = feed
        .manager(volume.path(), backups.path())
        .run(&options)
        .await
        .unwrap();

    let backup = summary.backup.unwrap();
    assert!(backup.path.starts_with(backups.path()));
    assert_eq!(read(&backup.path, "SCREENSHOTS/shot.png"), "png");
    assert!(backup.path.join("backup.json").is_file());
}

#[tokio::test]
async fn test_backup_failure_aborts_before_apply() {
    let feed = Feed::start().await;
    let volume = TempDir::new().unwrap();
    let backups = TempDir::new().unwrap();
    let mut config = feed.config(volume.path(), backups.path());
    config.backup_root = Some(volume.path().join("backups"));

    let mut options = full_options(&["USA"]);
    options.backup = true;
    let err = SyncManager::new(config)
        .unwrap()
        .run(&options)
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Backup(_)));
    assert_eq!(err.exit_code(), 8);
    assert!(!volume.path().join("FIRMWARE").exists());
    assert!(!volume.path().join("backups").exists());
    let tree = VolumeTree::open(volume.path()).unwrap();
    assert!(!tree.record_path().exists());
    assert!(!tree.lock_path().exists());
}
