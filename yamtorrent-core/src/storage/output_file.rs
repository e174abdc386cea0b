//! Preallocated output file with an in-progress name.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::StorageError;

/// Single output file written piece by piece at final size.
///
/// Lives at `<dir>/<name><suffix>` until `finalize` renames it to
/// `<dir>/<name>`. `finalize` consumes the file, so the rename can only be
/// attempted once.
#[derive(Debug)]
pub struct OutputFile {
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
    length: u64,
}

impl OutputFile {
    /// Creates (or truncates) the in-progress file and sets its length.
    ///
    /// # Errors
    ///
    /// - `StorageError::FilesystemError` - If `name` is empty or escapes `dir`
    /// - `StorageError::Io` - If the directory or file could not be created
    pub async fn create(
        dir: &Path,
        name: &str,
        in_progress_suffix: &str,
        length: u64,
    ) -> Result<Self, StorageError> {
        let single_component = Path::new(name).components().count() == 1;
        if name.is_empty() || !single_component || name == "." || name == ".." {
            return Err(StorageError::FilesystemError {
                message: format!("Invalid output file name {name:?}"),
            });
        }

        fs::create_dir_all(dir).await?;

        let final_path = dir.join(name);
        let part_path = dir.join(format!("{name}{in_progress_suffix}"));

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&part_path)
            .await?;
        file.set_len(length).await?;

        tracing::debug!(
            "Created output file {} ({length} bytes)",
            part_path.display()
        );

        Ok(Self {
            file,
            part_path,
            final_path,
            length,
        })
    }

    /// Writes `data` at byte `offset`.
    ///
    /// # Errors
    ///
    /// - `StorageError::WritePastEnd` - If the write would grow the file
    /// - `StorageError::Io` - If seeking or writing failed
    pub async fn write_piece(&mut self, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let length = data.len() as u64;
        if offset.checked_add(length).is_none_or(|end| end > self.length) {
            return Err(StorageError::WritePastEnd {
                offset,
                length,
                file_length: self.length,
            });
        }

        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    /// Flushes, closes and renames to the final name.
    ///
    /// Returns the path the data ended up at. A failed rename is logged and
    /// the in-progress path is returned since the content is complete.
    ///
    /// # Errors
    ///
    /// - `StorageError::Io` - If flushing or syncing failed
    pub async fn finalize(mut self) -> Result<PathBuf, StorageError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        match fs::rename(&self.part_path, &self.final_path).await {
            Ok(()) => {
                tracing::debug!("Renamed output file to {}", self.final_path.display());
                Ok(self.final_path)
            }
            Err(e) => {
                tracing::warn!(
                    "Could not rename {} to {}: {e}",
                    self.part_path.display(),
                    self.final_path.display()
                );
                Ok(self.part_path)
            }
        }
    }

    /// Current on-disk path.
    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    /// Path the file will have after `finalize`.
    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_preallocates_with_suffix() {
        let temp_dir = tempfile::tempdir().unwrap();
        let output = OutputFile::create(temp_dir.path(), "movie.mkv", ".part", 1000)
            .await
            .unwrap();

        assert_eq!(output.part_path(), temp_dir.path().join("movie.mkv.part"));
        let metadata = tokio::fs::metadata(output.part_path()).await.unwrap();
        assert_eq!(metadata.len(), 1000);
        assert!(!output.final_path().exists());
    }

    #[tokio::test]
    async fn test_writes_land_at_offsets() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut output = OutputFile::create(temp_dir.path(), "data.bin", ".part", 10)
            .await
            .unwrap();

        output.write_piece(6, b"wxyz").await.unwrap();
        output.write_piece(0, b"abcd").await.unwrap();
        let path = output.finalize().await.unwrap();

        assert_eq!(path, temp_dir.path().join("data.bin"));
        let content = tokio::fs::read(&path).await.unwrap();
        assert_eq!(content, b"abcd\0\0wxyz");
        assert!(!temp_dir.path().join("data.bin.part").exists());
    }

    #[tokio::test]
    async fn test_write_past_end_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut output = OutputFile::create(temp_dir.path(), "data.bin", ".part", 4)
            .await
            .unwrap();

        let result = output.write_piece(2, b"abc").await;
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
        let result = output.write_piece(u64::MAX, b"a").await;
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[tokio::test]
    async fn test_rename_failure_keeps_part_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let output = OutputFile::create(temp_dir.path(), "data.bin", ".part", 4)
            .await
            .unwrap();

        // A non-empty directory at the final path makes the rename fail
        let blocker = temp_dir.path().join("data.bin");
        tokio::fs::create_dir(&blocker).await.unwrap();
        tokio::fs::write(blocker.join("keep"), b"x").await.unwrap();

        let path = output.finalize().await.unwrap();
        assert_eq!(path, temp_dir.path().join("data.bin.part"));
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_rejects_path_like_names() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(OutputFile::create(temp_dir.path(), "", ".part", 1).await.is_err());
        assert!(OutputFile::create(temp_dir.path(), "a/b", ".part", 1).await.is_err());
        assert!(OutputFile::create(temp_dir.path(), "..", ".part", 1).await.is_err());
    }
}
