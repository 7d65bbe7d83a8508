//! Content-addressed blob tree.
//!
//! Layout under the content root:
//!
//! ```text
//! content/
//!   blobs/hh/<64 hex>   one file per cached entry
//!   tmp/<uuid>.tmp      in-flight writes, purged at open
//! ```
//!
//! A blob becomes visible only through an atomic rename of a fully written,
//! fsynced temp file, so readers never observe a partial blob.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use folio_core::{CacheResult, ContentPointer, IoError};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

const BLOBS_DIR: &str = "blobs";
const TMP_DIR: &str = "tmp";
const TMP_EXTENSION: &str = "tmp";

/// File-backed byte store addressed by [`ContentPointer`].
#[derive(Debug, Clone)]
pub struct ContentStore {
    blobs: PathBuf,
    tmp: PathBuf,
}

impl ContentStore {
    /// Open the store rooted at `root`, creating its directories.
    pub async fn open(root: &Path) -> CacheResult<Self> {
        let blobs = root.join(BLOBS_DIR);
        let tmp = root.join(TMP_DIR);
        for dir in [&blobs, &tmp] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| IoError::new("create content dir", dir, &e))?;
        }
        Ok(Self { blobs, tmp })
    }

    pub fn blob_path(&self, pointer: &ContentPointer) -> PathBuf {
        self.blobs.join(pointer.fan_out()).join(pointer.file_name())
    }

    /// Durably write `bytes` at `pointer`, replacing any previous blob.
    pub async fn write(&self, pointer: &ContentPointer, bytes: &[u8]) -> CacheResult<()> {
        let fan_out = self.blobs.join(pointer.fan_out());
        fs::create_dir_all(&fan_out)
            .await
            .map_err(|e| IoError::new("create fan-out dir", &fan_out, &e))?;

        let temp_path = self
            .tmp
            .join(format!("{}.{TMP_EXTENSION}", Uuid::now_v7().simple()));
        if let Err(e) = write_synced(&temp_path, bytes).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        let final_path = fan_out.join(pointer.file_name());
        if let Err(e) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(IoError::new("publish blob", &final_path, &e).into());
        }

        sync_dir(&fan_out).await;
        Ok(())
    }

    /// Read a blob. A missing blob is `None`, not an error.
    pub async fn read(&self, pointer: &ContentPointer) -> CacheResult<Option<Vec<u8>>> {
        let path = self.blob_path(pointer);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IoError::new("read blob", &path, &e).into()),
        }
    }

    /// Delete a blob. Returns whether a file was removed; a missing blob is
    /// already the desired end state.
    pub async fn delete(&self, pointer: &ContentPointer) -> CacheResult<bool> {
        let path = self.blob_path(pointer);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(IoError::new("delete blob", &path, &e).into()),
        }
    }

    pub async fn exists(&self, pointer: &ContentPointer) -> CacheResult<bool> {
        Ok(self.len(pointer).await?.is_some())
    }

    /// Size of a blob on disk, `None` if absent or not a regular file.
    pub async fn len(&self, pointer: &ContentPointer) -> CacheResult<Option<u64>> {
        let path = self.blob_path(pointer);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(IoError::new("stat blob", &path, &e).into()),
        }
    }

    /// Every blob currently in the tree.
    ///
    /// Files whose name is not a well-formed pointer are returned separately
    /// so the sweep can remove them too.
    pub async fn list_pointers(&self) -> CacheResult<(Vec<ContentPointer>, Vec<PathBuf>)> {
        let mut pointers = Vec::new();
        let mut strays = Vec::new();

        let mut fan_outs = fs::read_dir(&self.blobs)
            .await
            .map_err(|e| IoError::new("list blobs", &self.blobs, &e))?;
        while let Some(fan_out) = fan_outs
            .next_entry()
            .await
            .map_err(|e| IoError::new("list blobs", &self.blobs, &e))?
        {
            let fan_out_path = fan_out.path();
            if !fan_out_path.is_dir() {
                strays.push(fan_out_path);
                continue;
            }
            let fan_out_name = fan_out.file_name().to_string_lossy().into_owned();

            let mut files = fs::read_dir(&fan_out_path)
                .await
                .map_err(|e| IoError::new("list blobs", &fan_out_path, &e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| IoError::new("list blobs", &fan_out_path, &e))?
            {
                let relative = format!("{}/{}", fan_out_name, file.file_name().to_string_lossy());
                match ContentPointer::parse(&relative) {
                    Some(pointer) => pointers.push(pointer),
                    None => strays.push(file.path()),
                }
            }
        }

        Ok((pointers, strays))
    }

    /// Remove a file that is not a recognized blob.
    pub async fn remove_stray(&self, path: &Path) -> CacheResult<()> {
        let result = if path.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IoError::new("remove stray", path, &e).into()),
        }
    }

    /// Delete leftovers of interrupted writes. Returns how many were removed.
    pub async fn purge_temp(&self) -> CacheResult<u64> {
        let mut purged = 0;
        let mut entries = fs::read_dir(&self.tmp)
            .await
            .map_err(|e| IoError::new("list temp files", &self.tmp, &e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| IoError::new("list temp files", &self.tmp, &e))?
        {
            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => purged += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Temp file left in place");
                }
            }
        }
        Ok(purged)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), IoError> {
    let mut file = fs::File::create(path)
        .await
        .map_err(|e| IoError::new("create temp blob", path, &e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| IoError::new("write temp blob", path, &e))?;
    file.sync_all()
        .await
        .map_err(|e| IoError::new("sync temp blob", path, &e))?;
    Ok(())
}

/// Best-effort directory fsync so the rename itself survives power loss.
/// Not every platform lets a directory be opened for syncing.
async fn sync_dir(dir: &Path) {
    match fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                tracing::debug!(dir = %dir.display(), error = %e, "Directory sync failed");
            }
        }
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Directory open for sync failed");
        }
    }
}
