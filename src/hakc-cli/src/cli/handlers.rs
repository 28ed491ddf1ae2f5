//! Command handlers.
//!
//! Builds the run configuration from the config file and flags, dispatches
//! to the engine and prints the outcome.

use std::fmt::Write as _;
use std::io::{IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use hakc_update::{
    Artifact, ArtifactKind, CategoryReport, CheckReport, Comparison, DownloadProgress, FeatureSet,
    MergePolicy, ProgressFn, RunOptions, RunOutcome, RunSummary, SyncConfig, SyncError,
    SyncManager, format_bytes,
};
use tokio_util::sync::CancellationToken;

use super::args::Cli;

/// Load configuration and apply command-line overrides.
pub fn build_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => SyncConfig::load().context("Failed to load config")?,
    };

    if let Some(mount) = &cli.mount {
        config.mount_point = mount.clone();
    }
    if let Some(dir) = &cli.staging_dir {
        config.staging_dir = Some(dir.clone());
    }
    if let Some(dir) = &cli.backup_dir {
        config.backup_root = Some(dir.clone());
    }
    if let Some(channel) = cli.channel_override() {
        config.channel = channel;
    }
    Ok(config)
}

/// Validate the requested features. Runs before any network access.
pub fn build_options(cli: &Cli, config: &SyncConfig) -> Result<RunOptions> {
    let features = FeatureSet::new(!cli.no_world_map, cli.countries.as_slice(), cli.scope())?;
    let mut options = RunOptions::new(config.channel, features);
    options.backup = cli.backup;
    options.force = cli.force;
    Ok(options)
}

/// Run the command line. Returns the process exit code.
pub async fn run_cli(cli: Cli, cancel: CancellationToken) -> Result<i32> {
    let config = build_config(&cli)?;
    let options = build_options(&cli, &config)?;
    let mount = config.mount_point.clone();

    let mut manager = SyncManager::new(config)?.with_cancellation(cancel);

    if cli.check {
        let report = manager.check(&options).await?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{}", render_check(&report, &mount));
        }
        return Ok(0);
    }

    if !cli.json && std::io::stderr().is_terminal() {
        manager = manager.with_progress(terminal_progress());
    }

    let summary = manager.run(&options).await?;
    if cli.json {
        let mut value = serde_json::to_value(&summary)?;
        if let Some(object) = value.as_object_mut() {
            object.insert("exit_code".to_string(), summary.exit_code().into());
            if let Some(message) = summary.fatal_message() {
                object.insert("error".to_string(), message.into());
            }
        }
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", render_summary(&summary, &mount));
    }
    Ok(summary.exit_code())
}

/// Exit code for an error that ended the run.
pub fn exit_code_for(error: &anyhow::Error) -> i32 {
    error.downcast_ref::<SyncError>().map_or(1, SyncError::exit_code)
}

/// Single-line progress for archive downloads.
fn terminal_progress() -> ProgressFn {
    Arc::new(|artifact: &Artifact, progress: DownloadProgress| {
        if artifact.kind != ArtifactKind::Archive {
            return;
        }
        let mut stderr = std::io::stderr();
        let _ = write!(
            stderr,
            "\r  Downloading {}... {:.0}% ({}/{})",
            artifact.name,
            progress.percentage(),
            progress.downloaded_human(),
            progress.total_human()
        );
        if progress.total > 0 && progress.downloaded >= progress.total {
            let _ = writeln!(stderr);
        }
        let _ = stderr.flush();
    })
}

/// Human-readable output of `--check`.
pub fn render_check(report: &CheckReport, mount: &Path) -> String {
    let mut out = String::new();
    let installed = report
        .installed
        .as_ref()
        .map_or_else(|| "none".to_string(), ToString::to_string);

    let _ = writeln!(out, "Latest:    {}", report.desired);
    let _ = writeln!(out, "Installed: {}", installed);
    let _ = writeln!(
        out,
        "Status:    {}",
        match report.comparison {
            Comparison::UpToDate => "up to date",
            Comparison::UpdateAvailable => "update available",
            Comparison::NoPriorRecord => "not installed by hakc yet",
        }
    );
    if !report.volume_present {
        let _ = writeln!(out, "No SD card mounted at {}", mount.display());
    }

    let _ = writeln!(
        out,
        "\nWould fetch {} artifacts ({}):",
        report.artifacts.len(),
        format_bytes(report.total_size)
    );
    for artifact in &report.artifacts {
        let _ = writeln!(
            out,
            "  {:<48} {:>10}  -> {}",
            artifact.name,
            format_bytes(artifact.size),
            artifact.category
        );
    }
    if !report.unlisted.is_empty() {
        let _ = writeln!(out, "\nCould not list: {}", report.unlisted.join(", "));
    }
    out
}

/// Human-readable output of a run.
pub fn render_summary(summary: &RunSummary, mount: &Path) -> String {
    let mut out = String::new();

    if !summary.applied {
        let _ = writeln!(
            out,
            "SD card at {} is already up to date ({}).",
            mount.display(),
            summary.desired
        );
        let _ = writeln!(out, "Use --force to reinstall.");
        return out;
    }

    if let Some(backup) = &summary.backup {
        let _ = writeln!(
            out,
            "Backed up {} files ({}) to {}",
            backup.total_files(),
            format_bytes(backup.total_bytes()),
            backup.path.display()
        );
    }

    let _ = writeln!(out, "\n{}:", mount.display());
    for category in &summary.report.categories {
        let _ = writeln!(out, "  {}", category_line(category));
    }

    if !summary.report.merge_skips.is_empty() {
        let _ = writeln!(
            out,
            "\nSkipped {} files:",
            summary.report.merge_skips.len()
        );
        for skip in &summary.report.merge_skips {
            let _ = writeln!(out, "  {}/{}: {}", skip.category, skip.path, skip.reason);
        }
    }
    if !summary.degraded.is_empty() {
        let _ = writeln!(
            out,
            "\nNot installed (download failed): {}",
            summary.degraded.join(", ")
        );
    }

    let _ = writeln!(out);
    match summary.outcome {
        RunOutcome::Success if firmware_written(summary) => {
            let _ = writeln!(out, "Installed {}.", summary.desired);
        }
        RunOutcome::Success => {
            let _ = writeln!(out, "Done.");
        }
        RunOutcome::PartialSuccess => {
            let _ = writeln!(
                out,
                "Installed {} with some files skipped. Re-run hakc to retry them.",
                summary.desired
            );
        }
        RunOutcome::Failure => {
            let _ = writeln!(
                out,
                "Failed: {}",
                summary.fatal_message().unwrap_or_default()
            );
            let _ = writeln!(
                out,
                "The install record was not updated. Re-run hakc to resume."
            );
            return out;
        }
    }
    let _ = writeln!(out, "Eject the SD card safely before removing it.");
    out
}

fn firmware_written(summary: &RunSummary) -> bool {
    summary
        .report
        .category(hakc_update::Category::Firmware)
        .is_some()
}

fn category_line(report: &CategoryReport) -> String {
    let mut counts = Vec::new();
    let mut push = |n: usize, label: &str| {
        if n > 0 {
            counts.push(format!("{n} {label}"));
        }
    };
    match report.policy {
        MergePolicy::Replace => {
            push(report.replaced, "written");
            push(report.skipped, "already in place");
        }
        MergePolicy::Merge => {
            push(report.added, "added");
            push(report.replaced, "updated");
            push(report.skipped, "unchanged");
            push(report.preserved, "kept (edited by you)");
        }
        MergePolicy::Preserve => push(report.preserved, "untouched"),
    }
    push(report.failed, "failed");
    if counts.is_empty() {
        counts.push("nothing to do".to_string());
    }

    format!(
        "{:<12} {:<9} {}",
        report.category.to_string(),
        report.policy.to_string(),
        counts.join(", ")
    )
}
