//! File-backed playback sink for headless watching

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use gridcast_core::client::{AppendError, Completion, PlaybackSink};

/// Appends fragments to a file and pretends to play them back.
///
/// Media time is estimated from the byte count at a fixed byte rate, and the
/// playhead advances with wall-clock time from the first append. Trimming
/// only moves the start of the reported range; the file keeps everything.
pub struct FilePlaybackSink {
    file: File,
    path: PathBuf,
    byte_rate: u64,
    bytes_written: u64,
    fragments: u64,
    trimmed_to: Duration,
    first_append: Option<Instant>,
}

impl FilePlaybackSink {
    /// Creates or truncates `path`.
    ///
    /// # Errors
    ///
    /// - `std::io::Error` - The file cannot be created
    pub fn create(path: &Path, byte_rate: u64) -> std::io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
            path: path.to_path_buf(),
            byte_rate: byte_rate.max(1),
            bytes_written: 0,
            fragments: 0,
            trimmed_to: Duration::ZERO,
            first_append: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn fragments(&self) -> u64 {
        self.fragments
    }

    fn media_end(&self) -> Duration {
        Duration::from_secs_f64(self.bytes_written as f64 / self.byte_rate as f64)
    }
}

impl PlaybackSink for FilePlaybackSink {
    fn append(&mut self, fragment: &Bytes) -> Result<Completion, AppendError> {
        self.file
            .write_all(fragment)
            .map_err(|e| AppendError::Rejected(e.to_string()))?;
        self.first_append.get_or_insert_with(Instant::now);
        self.bytes_written += fragment.len() as u64;
        self.fragments += 1;
        Ok(Completion::Immediate)
    }

    fn is_updating(&self) -> bool {
        false
    }

    fn buffered_range(&self) -> Option<(Duration, Duration)> {
        let end = self.media_end();
        (end > self.trimmed_to).then_some((self.trimmed_to, end))
    }

    fn current_time(&self) -> Duration {
        let played = self
            .first_append
            .map(|first| first.elapsed())
            .unwrap_or_default();
        played.min(self.media_end())
    }

    fn remove(&mut self, start: Duration, end: Duration) -> Result<Completion, AppendError> {
        if end <= start {
            return Err(AppendError::Rejected(format!(
                "empty range {start:?}..{end:?}"
            )));
        }
        self.trimmed_to = self.trimmed_to.max(end);
        Ok(Completion::Immediate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_land_in_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.mp4");
        let mut sink = FilePlaybackSink::create(&path, 1000).unwrap();

        sink.append(&Bytes::from_static(b"ftyp")).unwrap();
        sink.append(&Bytes::from_static(b"moof")).unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"ftypmoof");
        assert_eq!(sink.fragments(), 2);
        assert_eq!(sink.bytes_written(), 8);
        assert_eq!(sink.path(), path);
    }

    #[test]
    fn test_buffered_range_follows_bytes_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FilePlaybackSink::create(&dir.path().join("grid.webm"), 100).unwrap();
        assert_eq!(sink.buffered_range(), None);

        sink.append(&Bytes::from(vec![0u8; 1000])).unwrap();
        assert_eq!(
            sink.buffered_range(),
            Some((Duration::ZERO, Duration::from_secs(10)))
        );

        sink.remove(Duration::ZERO, Duration::from_secs(4)).unwrap();
        assert_eq!(
            sink.buffered_range(),
            Some((Duration::from_secs(4), Duration::from_secs(10)))
        );
        assert!(sink.remove(Duration::from_secs(5), Duration::from_secs(5)).is_err());
        assert!(sink.current_time() <= Duration::from_secs(10));
    }
}
