use chrono::{DateTime, Local};
use std::{io, path::PathBuf};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

/// Upper bound on `_N` suffixes tried for one timestamp.
const MAX_NAME_ATTEMPTS: usize = 1000;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no free file name for {0} after {MAX_NAME_ATTEMPTS} attempts")]
    NamesExhausted(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedImage {
    pub filename: String,
    pub path: PathBuf,
}

/// Persists uploads as `<prefix>_<YYYYMMDD_HHMMSS>.jpg`. When that name is
/// taken, `_1`, `_2`, ... is appended to the stem; files are created with
/// `create_new` so concurrent uploads never overwrite each other.
#[derive(Debug, Clone)]
pub struct ImageStore {
    directory: PathBuf,
    prefix: String,
}

impl ImageStore {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
        }
    }

    pub async fn save(&self, data: &[u8]) -> Result<SavedImage, StorageError> {
        self.save_at(data, Local::now()).await
    }

    pub async fn save_at(
        &self,
        data: &[u8],
        timestamp: DateTime<Local>,
    ) -> Result<SavedImage, StorageError> {
        fs::create_dir_all(&self.directory)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: self.directory.clone(),
                source,
            })?;

        let stem = format!("{}_{}", self.prefix, timestamp.format("%Y%m%d_%H%M%S"));
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let filename = if attempt == 0 {
                format!("{}.jpg", stem)
            } else {
                format!("{}_{}.jpg", stem, attempt)
            };
            let path = self.directory.join(&filename);

            let mut file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    tracing::debug!("{} already exists, trying next suffix", filename);
                    continue;
                }
                Err(source) => return Err(StorageError::Write { path, source }),
            };

            let written = async {
                file.write_all(data).await?;
                file.sync_all().await
            }
            .await;
            if let Err(source) = written {
                let _ = fs::remove_file(&path).await;
                return Err(StorageError::Write { path, source });
            }

            return Ok(SavedImage { filename, path });
        }

        Err(StorageError::NamesExhausted(stem))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_time() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 17, 14, 3, 9).unwrap()
    }

    #[tokio::test]
    async fn test_save_creates_directory_and_names_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path().join("received_images"), "esp32_image");

        let saved = store.save_at(b"jpeg bytes", fixed_time()).await.unwrap();

        assert_eq!(saved.filename, "esp32_image_20240517_140309.jpg");
        assert_eq!(
            saved.path,
            dir.path().join("received_images/esp32_image_20240517_140309.jpg")
        );
        assert_eq!(std::fs::read(&saved.path).unwrap(), b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_same_second_uploads_get_distinct_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), "esp32_image");

        let first = store.save_at(b"first", fixed_time()).await.unwrap();
        let second = store.save_at(b"second", fixed_time()).await.unwrap();
        let third = store.save_at(b"third", fixed_time()).await.unwrap();

        assert_eq!(first.filename, "esp32_image_20240517_140309.jpg");
        assert_eq!(second.filename, "esp32_image_20240517_140309_1.jpg");
        assert_eq!(third.filename, "esp32_image_20240517_140309_2.jpg");
        assert_eq!(std::fs::read(&first.path).unwrap(), b"first");
        assert_eq!(std::fs::read(&second.path).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_concurrent_saves_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::new(dir.path(), "esp32_image");

        let saves = (0..16u8).map(|i| {
            let store = store.clone();
            async move { store.save_at(&[i; 8], fixed_time()).await.unwrap() }
        });
        let saved = spawn_all(saves).await;

        let mut names: Vec<_> = saved.iter().map(|s| s.filename.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 16);
    }

    async fn spawn_all<F: std::future::Future<Output = SavedImage> + Send + 'static>(
        futures: impl Iterator<Item = F>,
    ) -> Vec<SavedImage> {
        let handles: Vec<_> = futures.map(tokio::spawn).collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"file").unwrap();
        let store = ImageStore::new(blocker.join("images"), "esp32_image");

        let err = store.save(b"data").await.unwrap_err();

        assert!(matches!(err, StorageError::CreateDir { .. }));
    }
}
