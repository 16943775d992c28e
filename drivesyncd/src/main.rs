use std::path::PathBuf;
use std::time::Duration;

use drivesyncd::daemon::{DaemonConfig, DaemonRuntime};
use drivesyncd::sync::queue::{EnqueueOptions, JobInput, JobSource, SyncMode};
use drivesyncd::sync::store::StateStore;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Sync(PathBuf),
    Copy(PathBuf),
    GetUrl(PathBuf),
    OpenDrive(PathBuf),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let mut mode = CliMode::Run;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--sync-folder" | "--sync" => mode = CliMode::Sync(take_path(&arg, args.next())?),
            "--copy-folder" | "--copy" => mode = CliMode::Copy(take_path(&arg, args.next())?),
            "--get-url" => mode = CliMode::GetUrl(take_path(&arg, args.next())?),
            "--open-drive" => mode = CliMode::OpenDrive(take_path(&arg, args.next())?),
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn take_path(flag: &str, value: Option<String>) -> anyhow::Result<PathBuf> {
    value
        .map(PathBuf::from)
        .ok_or_else(|| anyhow::anyhow!("{flag} requires a path argument"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = DaemonConfig::from_env();
    match parse_cli_mode(std::env::args())? {
        CliMode::Help => {
            println!("Usage: drivesyncd [--sync-folder <path> | --copy-folder <path> | --get-url <path> | --open-drive <path>]");
            println!("  --sync-folder <path>  Upload the folder and keep it tracked for changes");
            println!("  --copy-folder <path>  Upload the folder once without tracking it");
            println!("  --get-url <path>      Print the remote URL of a synced file or folder");
            println!("  --open-drive <path>   Open the remote counterpart in a browser");
            println!("  With no arguments, runs the sync daemon.");
            Ok(())
        }
        CliMode::Run => {
            let daemon = DaemonRuntime::bootstrap(config).await?;
            daemon.run().await
        }
        CliMode::Sync(path) => run_one_job(config, path, SyncMode::Sync).await,
        CliMode::Copy(path) => run_one_job(config, path, SyncMode::Copy).await,
        CliMode::GetUrl(path) => {
            let url = resolve_remote_url(&config, &path).await?;
            println!("{url}");
            Ok(())
        }
        CliMode::OpenDrive(path) => {
            let url = resolve_remote_url(&config, &path).await?;
            if let Err(err) = std::process::Command::new("xdg-open").arg(&url).spawn() {
                eprintln!("[drivesyncd] could not launch a browser: {err}");
                println!("{url}");
            }
            Ok(())
        }
    }
}

/// One-shot mode: queue a single job, wait for it to finish and print the
/// report the daemon would have logged.
async fn run_one_job(config: DaemonConfig, path: PathBuf, mode: SyncMode) -> anyhow::Result<()> {
    let daemon = DaemonRuntime::bootstrap(config).await?;
    let coordinator = daemon.coordinator().clone();
    coordinator
        .enqueue(
            JobInput {
                folder_path: path,
                mode: Some(mode),
                only_files: Vec::new(),
                source: JobSource::Manual,
            },
            EnqueueOptions::default(),
        )
        .await?;
    coordinator.drain().await;
    while coordinator.active_job().await.is_some() || coordinator.queue_len().await > 0 {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let Some(report) = coordinator.last_report().await? else {
        anyhow::bail!("the job finished without leaving a report");
    };
    println!(
        "{}: {} uploaded, {} skipped, {} failed",
        report.folder_path.display(),
        report.files_uploaded,
        report.files_skipped,
        report.files_failed
    );
    if let Some(link) = &report.share_link {
        println!("{link}");
    }
    if let Some(error) = &report.error {
        anyhow::bail!("sync failed: {error}");
    }
    if !report.success {
        anyhow::bail!("{} file(s) failed to upload", report.files_failed);
    }
    Ok(())
}

async fn resolve_remote_url(config: &DaemonConfig, path: &PathBuf) -> anyhow::Result<String> {
    let store = match &config.state_db {
        Some(db_path) => StateStore::new_at(db_path).await?,
        None => StateStore::new_default().await?,
    };
    let Some(found) = store.record_for_path_or_ancestor(path).await? else {
        anyhow::bail!("no synced item found for {}", path.display());
    };
    found
        .record
        .remote_url
        .ok_or_else(|| anyhow::anyhow!("no remote URL recorded for {}", found.matched_path.display()))
}
