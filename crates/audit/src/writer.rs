//! Bounded background writer for the audit log.
//!
//! Appends happen on a dedicated task fed by a bounded channel. When the
//! channel is full the record is dropped with a warning; audit pressure must
//! never stall the request path. Closing the logger drains the channel.

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use lynkr_config::AuditConfig;
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::mpsc,
    task::JoinHandle,
};

const CHANNEL_CAPACITY: usize = 1024;

/// Handle to the background append task. Shared behind an `Arc`; `close`
/// takes the channel down through interior mutability so shutdown works
/// from any holder.
pub struct AuditWriter {
    sender: Mutex<Option<mpsc::Sender<String>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AuditWriter {
    /// Open the log file and spawn the writer task.
    pub async fn spawn(config: &AuditConfig) -> anyhow::Result<Self> {
        let path = PathBuf::from(&config.log_path);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(write_loop(path, receiver));

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue one line. Never blocks; drops on backpressure or after close.
    pub fn append(&self, line: String) {
        let guard = match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match guard.as_ref() {
            Some(sender) => {
                if let Err(e) = sender.try_send(line) {
                    log::warn!("audit write dropped: {e}");
                }
            }
            None => log::warn!("audit write after close dropped"),
        }
    }

    /// Drain pending writes and stop the task. Idempotent.
    pub async fn close(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            log::warn!("audit writer task ended abnormally: {e}");
        }
    }
}

async fn write_loop(path: PathBuf, mut receiver: mpsc::Receiver<String>) {
    let mut file = match open_append(&path).await {
        Ok(file) => file,
        Err(e) => {
            log::error!("cannot open audit log {}: {e}", path.display());
            // Drain and discard so senders never block on a dead writer.
            while receiver.recv().await.is_some() {}
            return;
        }
    };

    while let Some(line) = receiver.recv().await {
        if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
            log::warn!("audit append failed: {e}");
        }
    }

    if let Err(e) = file.flush().await {
        log::warn!("audit flush failed: {e}");
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_drains_pending_writes() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            log_path: dir.path().join("audit.jsonl").display().to_string(),
            ..Default::default()
        };

        let writer = AuditWriter::spawn(&config).await.unwrap();

        for i in 0..100 {
            writer.append(format!("{{\"n\":{i}}}"));
        }

        writer.close().await;

        let content = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 100);
    }

    #[tokio::test]
    async fn appends_after_close_are_dropped_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            log_path: dir.path().join("audit.jsonl").display().to_string(),
            ..Default::default()
        };

        let writer = AuditWriter::spawn(&config).await.unwrap();
        writer.close().await;
        writer.append("{}".to_string());
        writer.close().await;

        let content = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        assert!(content.is_empty());
    }
}
