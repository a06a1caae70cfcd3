//! multipush: uploads a local file to an object store as a parallel
//! multipart upload.
//!
//! Usage: `multipush <file> [key]`. Exit status is 0 on success, 1 when the
//! upload failed, and 2 when a failed upload could not be aborted (stored
//! parts may remain on the store).

mod config;
mod s3_adapter;
mod sigv4;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use multipush_transfer::load_payload;
use multipush_upload::{MemoryStore, ObjectStore, UploadCoordinator, UploadError, UploadEvent};

use config::{AppConfig, MEMORY_SCHEME};
use s3_adapter::S3Store;

const USAGE: &str = "usage: multipush <file> [key]";

#[derive(Debug, PartialEq, Eq)]
struct Args {
    file: PathBuf,
    key: Option<String>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let Some(file) = args.next() else {
            bail!("missing file argument\n{USAGE}");
        };
        if file == "-h" || file == "--help" {
            bail!("{USAGE}");
        }
        let key = args.next();
        if let Some(extra) = args.next() {
            bail!("unexpected argument {extra:?}\n{USAGE}");
        }
        Ok(Self {
            file: PathBuf::from(file),
            key,
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,multipush=debug")),
        )
        .init();

    match run().await {
        Ok(location) => {
            println!("{location}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "upload failed");
            ExitCode::from(exit_status(&e))
        }
    }
}

async fn run() -> anyhow::Result<String> {
    let args = Args::parse(std::env::args().skip(1))?;
    let config = AppConfig::load()?;
    let key = args
        .key
        .clone()
        .unwrap_or_else(|| config.default_key(&args.file));

    let payload = load_payload(&args.file)
        .await
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    let store: Arc<dyn ObjectStore> = if config.is_memory() {
        let name = config.endpoint.trim_start_matches(MEMORY_SCHEME);
        warn!(store = name, "using in-memory store, the object is discarded on exit");
        Arc::new(MemoryStore::new(name))
    } else {
        Arc::new(S3Store::new(&config)?)
    };

    info!(
        file = %args.file.display(),
        key = %key,
        bytes = payload.len(),
        store = %store.name(),
        "starting upload"
    );

    let mut coordinator = UploadCoordinator::new(store, config.upload_config());
    let reporter = coordinator.take_events().map(|rx| tokio::spawn(report(rx)));

    let result = coordinator.upload(&key, payload).await;
    // Dropping the coordinator closes the event channel and ends the reporter.
    drop(coordinator);
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }

    let summary = result?;
    info!(
        upload_id = %summary.upload_id,
        etag = %summary.etag,
        parts = summary.parts,
        bytes = summary.bytes,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "upload finished"
    );
    Ok(summary.location)
}

/// Renders upload events as log lines.
async fn report(mut rx: mpsc::Receiver<UploadEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            UploadEvent::SessionCreated {
                upload_id, parts, ..
            } => info!(%upload_id, parts, "session created"),
            UploadEvent::PartStarted { index, length } => {
                info!(part = index, bytes = length, "uploading part")
            }
            UploadEvent::PartRetrying {
                index,
                attempt,
                delay,
                error,
            } => warn!(
                part = index,
                attempt,
                delay_secs = delay.as_secs(),
                %error,
                "retrying part"
            ),
            UploadEvent::PartFinished {
                index,
                parts_done,
                parts_total,
                ..
            } => info!(part = index, "part done ({parts_done}/{parts_total})"),
            UploadEvent::PartSkipped { index } => debug!(part = index, "part skipped"),
            UploadEvent::PartFailed {
                index,
                attempts,
                error,
            } => error!(part = index, attempts, %error, "part failed"),
            UploadEvent::Aborting { upload_id } => warn!(%upload_id, "aborting upload"),
            UploadEvent::Completed { location } => info!(%location, "upload complete"),
            UploadEvent::Failed { .. } => {}
        }
    }
}

fn exit_status(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<UploadError>() {
        Some(upload) if upload.is_abort_failure() => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multipush_upload::StoreError;

    fn args(list: &[&str]) -> anyhow::Result<Args> {
        Args::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_file_and_key() {
        assert_eq!(
            args(&["clip.mp4", "recordings/clip.mp4"]).unwrap(),
            Args {
                file: PathBuf::from("clip.mp4"),
                key: Some("recordings/clip.mp4".into()),
            }
        );
        assert_eq!(args(&["clip.mp4"]).unwrap().key, None);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(args(&[]).is_err());
        assert!(args(&["--help"]).is_err());
        assert!(args(&["a", "b", "c"]).is_err());
    }

    #[test]
    fn abort_failure_exits_with_two() {
        let err = anyhow::Error::from(UploadError::AbortFailed {
            upload_id: "u1".into(),
            source: StoreError::Transport("unreachable".into()),
        });
        assert_eq!(exit_status(&err), 2);

        let err = anyhow::Error::from(UploadError::EmptyPayload).context("upload of clip.mp4");
        assert_eq!(exit_status(&err), 1);
    }
}
