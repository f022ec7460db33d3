//! Upload run: submits paths, renders engine events, waits for the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use docingest_protocol::Destination;
use docingest_transfer::should_chunk;
use docingest_uploader::{
    HttpTransport, SubmitOptions, TaskOutcome, UploadEvent, UploadFile, UploadRegistry,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Counts per outcome for one run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    pub done: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl RunReport {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Done { .. } => self.done += 1,
            TaskOutcome::Failed { .. } => self.failed += 1,
            TaskOutcome::Canceled => self.canceled += 1,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.canceled == 0
    }
}

/// Uploads `paths` to `destination` until every file has an outcome.
///
/// Directories become folder imports. Files below the chunking threshold
/// go out in a single request; the rest run through the engine.
pub async fn run(
    config: Config,
    destination: Destination,
    batch_id: Option<String>,
    paths: Vec<PathBuf>,
) -> anyhow::Result<RunReport> {
    let base_url = config
        .base_url
        .as_deref()
        .context("no service URL: pass --base-url or set base_url in the config file")?;
    let transport = Arc::new(HttpTransport::new(base_url, config.token.as_deref())?);
    let registry = UploadRegistry::new(transport.clone(), config.engine.clone())?;

    let batch_id = batch_id
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let options = SubmitOptions::default().with_batch_id(batch_id.clone());
    info!(batch = %batch_id, destination = %destination, files = paths.len(), "starting upload");

    // -- Event rendering --
    let printer = tokio::spawn(render_events(registry.events()));

    // -- Ctrl-C --
    let interrupt = {
        let registry = registry.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let canceled = registry.cancel_all();
                warn!(canceled, "interrupted, canceling uploads");
            }
        })
    };

    let mut report = RunReport::default();
    let mut task_ids = Vec::new();

    for path in &paths {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) => {
                error!(path = %path.display(), "cannot read: {e}");
                report.failed += 1;
                continue;
            }
        };

        let submitted = if metadata.is_dir() {
            registry
                .submit_folder(path, destination.clone(), options.clone())
                .await
        } else if should_chunk(metadata.len(), config.engine.chunk_threshold) {
            match UploadFile::from_path(path).await {
                Ok(file) => registry
                    .submit(file, destination.clone(), options.clone())
                    .map(|id| vec![id]),
                Err(e) => Err(e),
            }
        } else {
            let outcome = upload_small(
                &transport,
                &destination,
                path,
                &batch_id,
                config.direct_timeout(),
            )
            .await;
            report.record(&outcome);
            continue;
        };

        match submitted {
            Ok(ids) => task_ids.extend(ids),
            Err(e) => {
                error!(path = %path.display(), "rejected: {e}");
                report.failed += 1;
            }
        }
    }

    for task_id in &task_ids {
        if let Some(outcome) = registry.wait(task_id).await {
            report.record(&outcome);
        }
    }
    interrupt.abort();

    if let Some(summary) = registry.batch_summary(&batch_id) {
        info!(
            batch = %batch_id,
            done = summary.done,
            failed = summary.failed,
            canceled = summary.canceled,
            bytes = summary.bytes_completed,
            "chunked uploads finished"
        );
    }

    // Let the renderer drain what is already buffered.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();

    Ok(report)
}

/// Sends a small file in one request.
async fn upload_small(
    transport: &HttpTransport,
    destination: &Destination,
    path: &Path,
    batch_id: &str,
    timeout: Duration,
) -> TaskOutcome {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let data = match tokio::fs::read(path).await {
        Ok(data) if !data.is_empty() => data,
        Ok(_) => return failed(&name, "file is empty".into()),
        Err(e) => return failed(&name, e.to_string()),
    };

    let size = data.len();
    match transport
        .upload_direct(destination, &name, data, batch_id, None, timeout)
        .await
    {
        Ok(resp) => {
            info!(file = %name, size, file_id = %resp.file_id, "uploaded");
            TaskOutcome::Done {
                file_id: resp.file_id,
            }
        }
        Err(e) => failed(&name, e.to_string()),
    }
}

fn failed(name: &str, message: String) -> TaskOutcome {
    error!(file = %name, "upload failed: {message}");
    TaskOutcome::Failed {
        chunk_index: None,
        message,
    }
}

async fn render_events(mut events: broadcast::Receiver<UploadEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => render(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event renderer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn render(event: &UploadEvent) {
    match event {
        UploadEvent::StateChanged { task_id, state, .. } => {
            debug!(task = %task_id, ?state, "state changed");
        }
        UploadEvent::Progress(p) => {
            let eta = p
                .eta_seconds
                .map(|s| format!("{s:.0}s"))
                .unwrap_or_else(|| "-".into());
            info!(
                file = %p.file_name,
                chunks = %format!("{}/{}", p.chunks_acked, p.total_chunks),
                speed_kib = %format!("{:.1}", p.upload_speed_bps / 1024.0),
                eta = %eta,
                "{:.1}%",
                p.percentage
            );
        }
        UploadEvent::Completed {
            task_id, file_id, ..
        } => info!(task = %task_id, file_id = %file_id, "upload complete"),
        UploadEvent::Failed {
            task_id,
            chunk_index,
            error,
            ..
        } => error!(task = %task_id, chunk = ?chunk_index, "upload failed: {error}"),
        UploadEvent::Canceled { task_id, .. } => warn!(task = %task_id, "upload canceled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_counts_outcomes() {
        let mut report = RunReport::default();
        report.record(&TaskOutcome::Done {
            file_id: "f-1".into(),
        });
        report.record(&TaskOutcome::Done {
            file_id: "f-2".into(),
        });
        assert!(report.is_success());

        report.record(&TaskOutcome::Canceled);
        assert!(!report.is_success());

        report.record(&TaskOutcome::Failed {
            chunk_index: Some(3),
            message: "timeout".into(),
        });
        assert_eq!(
            report,
            RunReport {
                done: 2,
                failed: 1,
                canceled: 1
            }
        );
    }

    #[tokio::test]
    async fn missing_base_url_is_an_error() {
        let err = run(
            Config::default(),
            Destination::Project("p1".into()),
            None,
            vec![PathBuf::from("a.pdf")],
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("base-url"));
    }

    #[tokio::test]
    async fn empty_small_file_fails_without_request() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.txt");
        std::fs::write(&path, b"").unwrap();

        let transport = HttpTransport::new("http://127.0.0.1:9", None).unwrap();
        let outcome = upload_small(
            &transport,
            &Destination::Folder("f1".into()),
            &path,
            "b-1",
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(outcome, TaskOutcome::Failed { chunk_index: None, .. }));
    }
}
