//! FileSink - appends records to a file with optional size-based rotation
//!
//! File I/O is plain std I/O run on the blocking pool under a timeout.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use contracts::{ContractError, DestinationSpec, LogSink, RotationSpec};

use super::{off_thread, rotation, DEFAULT_IO_TIMEOUT};

/// Sink that writes encoded records to disk
///
/// Rotation happens between records, never inside one: a record that would
/// push the active file past `max_size_bytes` goes to a fresh file. A record
/// larger than the limit gets a file of its own.
pub struct FileSink {
    name: String,
    path: PathBuf,
    rotation: Option<RotationSpec>,
    io_timeout: Duration,
    /// Taken by the blocking call in progress; lost if that call times out
    file: Option<ActiveFile>,
}

/// Blocking side of a [`FileSink`]
struct ActiveFile {
    name: String,
    path: PathBuf,
    rotation: Option<RotationSpec>,
    writer: Option<BufWriter<File>>,
    /// Bytes in the active file
    size: u64,
}

impl ActiveFile {
    fn open_active(&mut self, truncate: bool) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut options = OpenOptions::new();
        options.create(true);
        if truncate {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let file = options.open(&self.path)?;
        self.size = file.metadata()?.len();
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn rotate(&mut self, spec: &RotationSpec) -> std::io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        rotation::rotate(&self.path, spec.backup_count, spec.compress_backups)?;
        self.open_active(true)?;
        info!(
            sink = %self.name,
            path = %self.path.display(),
            backups = spec.backup_count,
            "Rotated log file"
        );
        Ok(())
    }

    fn write_records(&mut self, batch: &[Vec<u8>]) -> std::io::Result<()> {
        if self.writer.is_none() {
            self.open_active(false)?;
        }

        for record in batch {
            let len = record.len() as u64;
            if let Some(spec) = self.rotation.clone() {
                if self.size > 0 && self.size + len > spec.max_size_bytes {
                    self.rotate(&spec)?;
                }
            }
            let writer = self
                .writer
                .as_mut()
                .ok_or_else(|| std::io::Error::other("file not open"))?;
            writer.write_all(record)?;
            self.size += len;
        }

        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> std::io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl FileSink {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, rotation: Option<RotationSpec>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            rotation,
            io_timeout: DEFAULT_IO_TIMEOUT,
            file: None,
        }
    }

    pub fn from_spec(spec: &DestinationSpec) -> Self {
        Self::new(&spec.name, &spec.target, spec.rotation.clone())
    }

    /// Bound for each blocking open, write, flush or close
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn closed_file(&self) -> ActiveFile {
        ActiveFile {
            name: self.name.clone(),
            path: self.path.clone(),
            rotation: self.rotation.clone(),
            writer: None,
            size: 0,
        }
    }

    /// Run `op` against the file on the blocking pool
    async fn run<T, F>(&mut self, op: F) -> Result<T, ContractError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ActiveFile) -> std::io::Result<T> + Send + 'static,
    {
        let mut file = match self.file.take() {
            Some(file) => file,
            None => self.closed_file(),
        };
        let outcome = off_thread(&self.name, self.io_timeout, move || {
            let result = op(&mut file);
            (file, result)
        })
        .await;

        let (file, result) = match outcome {
            Ok(done) => done,
            Err(e) => {
                // the stalled call keeps its handle; the next call reopens
                warn!(sink = %self.name, path = %self.path.display(), error = %e, "File I/O stalled");
                return Err(e);
            }
        };
        self.file = Some(file);
        result.map_err(|e| ContractError::from_sink_io(&self.name, &e))
    }
}

impl LogSink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(name = "file_sink_open", skip(self), fields(sink = %self.name))]
    async fn open(&mut self) -> Result<(), ContractError> {
        let size = self
            .run(|file| {
                file.open_active(false)?;
                Ok(file.size)
            })
            .await?;
        debug!(sink = %self.name, path = %self.path.display(), size, "FileSink opened");
        Ok(())
    }

    #[instrument(
        name = "file_sink_write",
        skip(self, batch),
        fields(sink = %self.name, records = batch.len())
    )]
    async fn write_batch(&mut self, batch: &[Vec<u8>]) -> Result<(), ContractError> {
        let batch = batch.to_vec();
        self.run(move |file| {
            let result = file.write_records(&batch);
            if result.is_err() {
                // the buffered tail is unknown after a failed write; reopen next time
                file.writer = None;
            }
            result
        })
        .await
    }

    #[instrument(name = "file_sink_flush", skip(self))]
    async fn flush(&mut self) -> Result<(), ContractError> {
        if self.file.as_ref().map_or(true, |file| file.writer.is_none()) {
            return Ok(());
        }
        self.run(ActiveFile::flush).await
    }

    #[instrument(name = "file_sink_close", skip(self))]
    async fn close(&mut self) -> Result<(), ContractError> {
        if self.file.is_some() {
            self.run(ActiveFile::close).await?;
        }
        debug!(sink = %self.name, "FileSink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn line(i: usize, width: usize) -> Vec<u8> {
        let mut text = format!("{i:0width$}");
        text.push('\n');
        text.into_bytes()
    }

    #[tokio::test]
    async fn test_file_sink_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("app.log");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "existing\n").unwrap();

        let mut sink = FileSink::new("main", &path, None);
        sink.open().await.unwrap();
        sink.write_batch(&[b"one\n".to_vec(), b"two\n".to_vec()])
            .await
            .unwrap();
        sink.close().await.unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "existing\none\ntwo\n");
    }

    #[tokio::test]
    async fn test_rotation_never_splits_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let rotation = RotationSpec {
            max_size_bytes: 100,
            backup_count: 10,
            compress_backups: false,
        };
        let mut sink = FileSink::new("main", &path, Some(rotation));
        sink.open().await.unwrap();

        // 30-byte records: three fit in 100 bytes, the fourth rotates
        let records: Vec<Vec<u8>> = (0..10).map(|i| line(i, 29)).collect();
        sink.write_batch(&records).await.unwrap();
        sink.close().await.unwrap();

        let mut files = vec![path.clone()];
        files.extend((1..=3).map(|i| rotation::backup_path(&path, i, false)));
        let mut total = 0;
        for file in &files {
            let content = fs::read(file).unwrap();
            assert!(content.len() <= 100);
            assert_eq!(content.len() % 30, 0, "split record in {}", file.display());
            total += content.len();
        }
        assert_eq!(total, 300);
        assert!(!rotation::backup_path(&path, 4, false).exists());
    }

    #[tokio::test]
    async fn test_oversized_record_gets_own_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let rotation = RotationSpec {
            max_size_bytes: 10,
            backup_count: 2,
            compress_backups: false,
        };
        let mut sink = FileSink::new("main", &path, Some(rotation));
        sink.open().await.unwrap();
        sink.write_batch(&[b"short\n".to_vec(), b"much longer than ten\n".to_vec()])
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "much longer than ten\n");
        assert_eq!(
            fs::read_to_string(rotation::backup_path(&path, 1, false)).unwrap(),
            "short\n"
        );
    }

    #[tokio::test]
    async fn test_open_directory_fails() {
        let dir = tempdir().unwrap();
        let mut sink = FileSink::new("main", dir.path(), None);
        let err = sink.open().await.unwrap_err();
        assert!(matches!(
            err,
            ContractError::SinkFatal { .. } | ContractError::SinkTransient { .. }
        ));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_open_times_out() {
        let dir = tempdir().unwrap();
        // opening a fifo for writing blocks until a reader shows up
        let fifo = dir.path().join("stalled.fifo");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .unwrap();
        assert!(status.success());

        let mut sink = FileSink::new("main", &fifo, None).with_io_timeout(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let err = sink.open().await.unwrap_err();
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(2));

        // release the stranded open
        let _reader = OpenOptions::new().read(true).open(&fifo).unwrap();
    }
}
