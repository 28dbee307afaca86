//! Directory source replaying still images

use std::io;
use std::path::{Path, PathBuf};
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::{frame_period, nominal_timestamp};
use crate::provider::FrameSource;
use crate::types::{RawFrame, SourceConfig, SourceId};
use crate::{Result, StreamError};

/// File extensions picked up from the directory (case-insensitive)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Source replaying the images of a directory in lexical order, looping
pub struct DirectorySource {
    source_id: SourceId,
    root: PathBuf,
    frame_rate: f64,

    /// Image files found on connect
    files: Vec<PathBuf>,
    /// Index of the next file to read
    cursor: usize,

    interval: Option<Interval>,
    emitted: u64,
}

impl DirectorySource {
    /// Create a source over `root`
    pub fn new(source_id: impl Into<SourceId>, root: impl Into<PathBuf>, frame_rate: f64) -> Self {
        Self {
            source_id: source_id.into(),
            root: root.into(),
            frame_rate,
            files: Vec::new(),
            cursor: 0,
            interval: None,
            emitted: 0,
        }
    }

    /// Create a source from its registry record
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let root = config.connection_details.path.clone().ok_or_else(|| {
            StreamError::invalid_config(config.id.as_str(), "directory source requires a path")
        })?;
        Ok(Self::new(config.id.clone(), root, config.frame_rate))
    }

    /// Directory being replayed
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn scan(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_image(&path) && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

#[async_trait::async_trait]
impl FrameSource for DirectorySource {
    async fn connect(&mut self) -> Result<()> {
        let files = self.scan().await.map_err(|e| {
            StreamError::source_unavailable(
                self.source_id.as_str(),
                format!("cannot read {}: {e}", self.root.display()),
            )
        })?;

        if files.is_empty() {
            return Err(StreamError::source_unavailable(
                self.source_id.as_str(),
                format!("no images in {}", self.root.display()),
            ));
        }

        info!(
            source_id = %self.source_id,
            root = %self.root.display(),
            images = files.len(),
            "Directory source connected"
        );

        let mut ticks = interval(frame_period(self.frame_rate));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.files = files;
        self.cursor %= self.files.len();
        self.interval = Some(ticks);
        self.emitted = 0;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<RawFrame> {
        let ticks = self.interval.as_mut().ok_or_else(|| {
            StreamError::disconnected(self.source_id.as_str(), "read before connect")
        })?;
        ticks.tick().await;

        let path = &self.files[self.cursor];
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(e) => {
                let source_id = &self.source_id;
                warn!(%source_id, path = %path.display(), error = %e, "Image vanished");
                return Err(StreamError::disconnected(
                    self.source_id.as_str(),
                    format!("{}: {e}", path.display()),
                ));
            }
        };

        self.cursor = (self.cursor + 1) % self.files.len();
        let frame = RawFrame::new(data, nominal_timestamp(self.emitted, self.frame_rate));
        self.emitted += 1;
        Ok(frame)
    }

    async fn disconnect(&mut self) {
        if self.interval.take().is_some() {
            debug!(source_id = %self.source_id, "Directory source disconnected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result, ensure};
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> Result<TempDir> {
        let dir = TempDir::new().context("Creating fixture directory")?;
        fs::write(dir.path().join("b.jpg"), b"second")?;
        fs::write(dir.path().join("a.JPEG"), b"first")?;
        fs::write(dir.path().join("c.png"), b"third")?;
        fs::write(dir.path().join("notes.txt"), b"ignored")?;
        Ok(dir)
    }

    #[tokio::test]
    async fn replays_images_in_order_and_loops() -> Result<()> {
        let dir = fixture()?;
        let mut source = DirectorySource::new("dir", dir.path(), 1000.0);
        source.connect().await.with_context(|| format!("Scanning {}", dir.path().display()))?;

        let mut payloads = Vec::new();
        for _ in 0..4 {
            payloads.push(source.read_frame().await?.data);
        }

        let expected: [&[u8]; 4] = [b"first", b"second", b"third", b"first"];
        for (index, (payload, expected)) in payloads.iter().zip(expected).enumerate() {
            ensure!(payload.as_ref() == expected, "frame {index} out of order");
        }
        Ok(())
    }

    #[tokio::test]
    async fn empty_or_missing_directory_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let mut source = DirectorySource::new("dir", dir.path(), 1.0);
        let err = source.connect().await.unwrap_err();
        assert!(matches!(err, StreamError::SourceUnavailable { .. }));

        let mut source = DirectorySource::new("dir", dir.path().join("missing"), 1.0);
        let err = source.connect().await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn vanished_file_is_a_disconnect() {
        let dir = fixture().unwrap();
        let mut source = DirectorySource::new("dir", dir.path(), 1000.0);
        source.connect().await.unwrap();

        fs::remove_file(dir.path().join("a.JPEG")).unwrap();
        let err = source.read_frame().await.unwrap_err();
        assert!(err.is_retryable());

        // A rescan on reconnect skips the missing file
        source.disconnect().await;
        source.connect().await.unwrap();
        let frame = source.read_frame().await.unwrap();
        assert_ne!(frame.data.as_ref(), b"first");
    }

    #[test]
    fn extension_filter() {
        assert!(is_image(Path::new("x/frame.JPG")));
        assert!(is_image(Path::new("frame.png")));
        assert!(!is_image(Path::new("frame.gif")));
        assert!(!is_image(Path::new("jpg")));
    }
}
