//! Whole-file transfer over a connected session.
//!
//! The sender reads the file into memory and hands it to the transport as a
//! single message. The receiver wraps every complete message into a
//! [`ReceivedArtifact`] named `received_file` and saves it right away. The
//! original filename is not part of the wire payload.

use anyhow::{Context, Result};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::error::SessionError;
use crate::core::negotiator::Session;

/// Name given to every received artifact
pub const RECEIVED_FILE_NAME: &str = "received_file";

/// Soft limit above which the sender is warned about memory use (100MB)
pub const LARGE_FILE_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Raw bytes of the file being sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPayload {
    pub bytes: Bytes,
    pub suggested_name: String,
}

impl TransferPayload {
    pub fn new(bytes: impl Into<Bytes>, suggested_name: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            suggested_name: suggested_name.into(),
        }
    }

    /// Read the whole file into memory.
    pub async fn from_path(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
        if metadata.is_dir() {
            anyhow::bail!("{} is a directory; only single files can be sent", path.display());
        }
        if metadata.len() > LARGE_FILE_THRESHOLD {
            log::warn!(
                "{} is {}; the whole file is held in memory during transfer",
                path.display(),
                format_bytes(metadata.len())
            );
        }

        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let suggested_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());

        Ok(Self::new(bytes, suggested_name))
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A received message, ready to be saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedArtifact {
    pub name: String,
    pub bytes: Bytes,
}

/// Where a saved artifact ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    pub name: String,
    pub size: u64,
    pub location: Option<PathBuf>,
}

/// The "download" action for received artifacts.
pub trait ArtifactSink: Send {
    fn save(&mut self, artifact: &ReceivedArtifact) -> Result<SavedArtifact>;
}

/// Saves artifacts into a directory, never overwriting existing files.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Current directory, like a browser's download folder.
    pub fn current_dir() -> Result<Self> {
        let dir = std::env::current_dir().context("Failed to get current directory")?;
        Ok(Self::new(dir))
    }
}

impl ArtifactSink for DirectorySink {
    fn save(&mut self, artifact: &ReceivedArtifact) -> Result<SavedArtifact> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let path = find_available_filename(&self.dir.join(&artifact.name));
        std::fs::write(&path, &artifact.bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        Ok(SavedArtifact {
            name: artifact.name.clone(),
            size: artifact.bytes.len() as u64,
            location: Some(path),
        })
    }
}

/// Keeps artifacts in memory. Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemorySink {
    artifacts: Arc<Mutex<Vec<ReceivedArtifact>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifacts(&self) -> Vec<ReceivedArtifact> {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ArtifactSink for MemorySink {
    fn save(&mut self, artifact: &ReceivedArtifact) -> Result<SavedArtifact> {
        self.artifacts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(artifact.clone());
        Ok(SavedArtifact {
            name: artifact.name.clone(),
            size: artifact.bytes.len() as u64,
            location: None,
        })
    }
}

/// File transfer over a session. Usable once the session is connected.
pub struct FileTransferSession<S: ArtifactSink> {
    session: Session,
    sink: S,
}

impl<S: ArtifactSink> FileTransferSession<S> {
    pub fn new(session: Session, sink: S) -> Self {
        Self { session, sink }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn into_session(self) -> Session {
        self.session
    }

    /// Send the whole payload as one message.
    ///
    /// Fails with `ChannelNotReady` and transmits nothing unless the session
    /// is connected.
    pub async fn send(&mut self, payload: &TransferPayload) -> Result<(), SessionError> {
        self.session.send_message(payload.bytes.clone()).await?;
        log::info!(
            "Sent {} ({})",
            payload.suggested_name,
            format_bytes(payload.len() as u64)
        );
        Ok(())
    }

    /// Wrap a complete message into an artifact and save it.
    pub fn on_receive(&mut self, raw: Bytes) -> Result<SavedArtifact> {
        let artifact = ReceivedArtifact {
            name: RECEIVED_FILE_NAME.to_string(),
            bytes: raw,
        };
        let saved = self.sink.save(&artifact)?;
        log::info!("Received {} ({})", saved.name, format_bytes(saved.size));
        Ok(saved)
    }

    /// Wait for the next message from the peer and save it.
    pub async fn receive_next(&mut self) -> Result<SavedArtifact> {
        let raw = self.session.next_message().await?;
        self.on_receive(raw)
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Find an available filename by appending _2, _3, etc.
pub fn find_available_filename(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let parent = path.parent().unwrap_or(Path::new("."));

    let mut i = 2u64;
    loop {
        let candidate = parent.join(format!("{}_{}{}", stem, i, ext));
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(3), "3 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_directory_sink_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let mut sink = DirectorySink::new(dir.path());
        let artifact = ReceivedArtifact {
            name: RECEIVED_FILE_NAME.to_string(),
            bytes: Bytes::from_static(b"first"),
        };

        let first = sink.save(&artifact).unwrap();
        let second = sink
            .save(&ReceivedArtifact {
                bytes: Bytes::from_static(b"second"),
                ..artifact
            })
            .unwrap();

        let first_path = first.location.unwrap();
        let second_path = second.location.unwrap();
        assert_eq!(first_path, dir.path().join("received_file"));
        assert_eq!(second_path, dir.path().join("received_file_2"));
        assert_eq!(std::fs::read(first_path).unwrap(), b"first");
        assert_eq!(std::fs::read(second_path).unwrap(), b"second");
    }

    #[test]
    fn test_find_available_filename_keeps_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"x").unwrap();
        std::fs::write(dir.path().join("report_2.pdf"), b"x").unwrap();

        assert_eq!(find_available_filename(&path), dir.path().join("report_3.pdf"));
    }

    #[tokio::test]
    async fn test_payload_from_path_reads_whole_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello peer").unwrap();

        let payload = TransferPayload::from_path(&path).await.unwrap();
        assert_eq!(payload.bytes, Bytes::from_static(b"hello peer"));
        assert_eq!(payload.suggested_name, "notes.txt");
    }

    #[tokio::test]
    async fn test_payload_from_directory_fails() {
        let dir = TempDir::new().unwrap();
        let err = TransferPayload::from_path(dir.path()).await.unwrap_err();
        assert!(err.to_string().contains("is a directory"));
    }
}
