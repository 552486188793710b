// Recording destinations for the consumer engine.
//
// A sink receives ordered stream bytes and nothing else; lock-on and cutover
// decisions stay in the engine. The file sink supports the recorder's
// circular time-shift files, where the file wraps in place once it reaches a
// configured size.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::warn;

use crate::upload::{MediaUploadClient, UploadError};

/// Write-to-disk sink with optional circular overwrite past `cap` bytes.
pub struct FileSink {
    file: File,
    path: PathBuf,
    /// Circular cap in bytes; 0 means plain append.
    cap: u64,
    position: u64,
    /// Byte count that triggers the one-time direct-flush check; 0 disables.
    flush_check_min: u64,
    flush_checked: bool,
    written_total: u64,
}

impl FileSink {
    pub async fn create(
        path: impl AsRef<Path>,
        cap: u64,
        flush_check_min: u64,
    ) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path).await?;
        Ok(Self::from_file(file, path, cap, flush_check_min))
    }

    /// Wraps an already-open file (switch targets are opened by the caller so
    /// failures surface before any cutover work happens).
    pub fn from_file(file: File, path: PathBuf, cap: u64, flush_check_min: u64) -> Self {
        Self {
            file,
            path,
            cap,
            position: 0,
            flush_check_min,
            flush_checked: false,
            written_total: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        if self.cap > 0 && self.position >= self.cap {
            self.file.seek(SeekFrom::Start(0)).await?;
            self.position = 0;
        }
        self.file.write_all(data).await?;
        self.position += data.len() as u64;
        self.written_total += data.len() as u64;

        if !self.flush_checked
            && self.flush_check_min > 0
            && self.written_total >= self.flush_check_min
        {
            self.verify_direct_flush().await?;
        }
        Ok(())
    }

    /// One-time sanity check that bytes actually reach the disk: some
    /// filesystems accept writes and silently discard them. A zero-length
    /// file after a flush is recreated so the recording keeps going.
    async fn verify_direct_flush(&mut self) -> std::io::Result<()> {
        self.flush_checked = true;
        self.file.flush().await?;
        let len = self.file.metadata().await?.len();
        if len == 0 {
            warn!(path = %self.path.display(), "file size is zero after flush, recreating");
            self.file = File::create(&self.path).await?;
            self.position = 0;
        }
        Ok(())
    }

    pub async fn close(mut self) -> std::io::Result<()> {
        self.file.flush().await
    }
}

/// Upload sink: the media-upload client plus the negotiated circular cap.
pub struct UploadSink {
    pub client: MediaUploadClient,
    /// Recorder-side circular buffer size; 0 means plain forward writes.
    pub cap: u64,
}

impl UploadSink {
    pub async fn write(&mut self, data: &[u8]) -> Result<(), UploadError> {
        if self.cap > 0 {
            self.client.upload_auto_buffered(self.cap, data).await
        } else {
            self.client.upload_auto_increment(data).await
        }
    }
}

/// The destination a consumer engine is currently feeding.
pub enum ActiveSink {
    File(FileSink),
    Upload(UploadSink),
    /// Counts bytes without writing them; used by offline channel detection.
    Null,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.ts");
        let mut sink = FileSink::create(&path, 0, 0).await.unwrap();
        sink.write(b"abcd").await.unwrap();
        sink.write(b"efgh").await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"abcdefgh");
    }

    #[tokio::test]
    async fn circular_file_wraps_at_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shift.ts");
        let mut sink = FileSink::create(&path, 4, 0).await.unwrap();
        sink.write(b"aaaa").await.unwrap();
        // Position reached the cap: the next write rewinds to offset 0.
        sink.write(b"bb").await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"bbaa");
    }

    #[tokio::test]
    async fn direct_flush_check_passes_on_a_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checked.ts");
        let mut sink = FileSink::create(&path, 0, 2).await.unwrap();
        sink.write(b"0123456789").await.unwrap();
        sink.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 10);
    }
}
