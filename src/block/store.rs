//! Block transfer between the bucket and local scratch directories

use futures::stream::{self, StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BlockId, BlockMeta, DELETION_MARK_FILENAME, META_FILENAME, NO_COMPACT_MARK_FILENAME};
use crate::{Error, Result};

/// Moves whole block directories between the bucket and local disk with a
/// bounded per-file fan-out.
#[derive(Clone)]
pub struct BlockStore {
    bucket: Arc<dyn ObjectStore>,
    file_concurrency: usize,
}

impl BlockStore {
    pub fn new(bucket: Arc<dyn ObjectStore>, file_concurrency: usize) -> Result<Self> {
        if file_concurrency == 0 {
            return Err(Error::Config(
                "block file concurrency must be > 0".to_string(),
            ));
        }
        Ok(Self {
            bucket,
            file_concurrency,
        })
    }

    pub fn bucket(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.bucket)
    }

    /// Downloads every object of block `id` into `dir`, skipping markers.
    pub async fn download_block(
        &self,
        cancel: &CancellationToken,
        id: BlockId,
        dir: &Path,
    ) -> Result<()> {
        let prefix = ObjectPath::from(id.to_string());
        let objects: Vec<object_store::ObjectMeta> = cancellable(cancel, async {
            self.bucket
                .list(Some(&prefix))
                .try_collect::<Vec<_>>()
                .await
                .map_err(Error::from)
        })
        .await?;

        if objects.is_empty() {
            return Err(Error::Meta(format!("block {id} not found in bucket")));
        }

        tokio::fs::create_dir_all(dir).await?;
        let downloads = objects.into_iter().filter(|obj| {
            let name = obj.location.filename().unwrap_or_default();
            name != DELETION_MARK_FILENAME && name != NO_COMPACT_MARK_FILENAME
        });

        stream::iter(downloads.map(|obj| {
            let bucket = Arc::clone(&self.bucket);
            let local = local_path(dir, &prefix, &obj.location);
            async move {
                let local = local?;
                if let Some(parent) = local.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let raw = bucket.get(&obj.location).await?.bytes().await?;
                tokio::fs::write(&local, raw).await?;
                Ok::<_, Error>(())
            }
        }))
        .buffer_unordered(self.file_concurrency)
        .try_collect::<Vec<_>>()
        .await?;

        debug!(block = %id, dir = %dir.display(), "downloaded block");
        Ok(())
    }

    /// Uploads the block directory `dir` to the bucket. The meta object goes
    /// up last so a partially uploaded block is recognizable by its missing
    /// meta. Returns the uploaded block's ID.
    pub async fn upload_block(&self, cancel: &CancellationToken, dir: &Path) -> Result<BlockId> {
        let meta = BlockMeta::read_from_dir(dir).await?;
        meta.validate()?;
        let prefix = ObjectPath::from(meta.id.to_string());

        let mut files = Vec::new();
        collect_files(dir, &mut files).await?;
        files.retain(|p| p.file_name().map(|n| n != META_FILENAME).unwrap_or(true));

        cancellable(cancel, async {
            stream::iter(files.into_iter().map(|file| {
                let bucket = Arc::clone(&self.bucket);
                let rel = file
                    .strip_prefix(dir)
                    .map(|r| r.to_string_lossy().replace('\\', "/"))
                    .map_err(|e| Error::Internal(format!("path outside block dir: {e}")));
                let prefix = prefix.clone();
                async move {
                    let rel = rel?;
                    let raw = tokio::fs::read(&file).await?;
                    bucket
                        .put(
                            &ObjectPath::from(format!("{prefix}/{rel}")),
                            PutPayload::from(raw),
                        )
                        .await?;
                    Ok::<_, Error>(())
                }
            }))
            .buffer_unordered(self.file_concurrency)
            .try_collect::<Vec<_>>()
            .await?;

            let raw = tokio::fs::read(dir.join(META_FILENAME)).await?;
            self.bucket
                .put(
                    &ObjectPath::from(format!("{prefix}/{META_FILENAME}")),
                    PutPayload::from(raw),
                )
                .await?;
            Ok(())
        })
        .await?;

        debug!(block = %meta.id, "uploaded block");
        Ok(meta.id)
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = fut => res,
    }
}

fn local_path(dir: &Path, prefix: &ObjectPath, location: &ObjectPath) -> Result<PathBuf> {
    let rel = location
        .as_ref()
        .strip_prefix(prefix.as_ref())
        .and_then(|r| r.strip_prefix('/'))
        .ok_or_else(|| {
            Error::Internal(format!("object {location} outside block prefix {prefix}"))
        })?;
    Ok(dir.join(rel))
}

async fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::testutil::raw_meta;
    use super::super::{BlockIndex, ChunkRef, SeriesIndex, CHUNKS_DIR};
    use super::*;
    use object_store::memory::InMemory;
    use std::collections::BTreeMap;

    async fn write_local_block(dir: &Path, meta: &BlockMeta) {
        tokio::fs::create_dir_all(dir.join(CHUNKS_DIR)).await.unwrap();
        tokio::fs::write(dir.join(CHUNKS_DIR).join("000001"), b"chunk-data")
            .await
            .unwrap();
        BlockIndex {
            series: vec![SeriesIndex {
                labels: BTreeMap::from([("series".to_string(), "a".to_string())]),
                chunks: vec![ChunkRef {
                    segment: "000001".to_string(),
                    min_time: meta.min_time,
                    max_time: meta.max_time - 1,
                    samples: meta.num_samples,
                    size_bytes: 10,
                }],
            }],
        }
        .write_to_dir(dir)
        .await
        .unwrap();
        meta.write_to_dir(dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = BlockStore::new(Arc::clone(&bucket), 4).unwrap();
        let cancel = CancellationToken::new();
        let tmp = tempfile::tempdir().unwrap();

        let meta = raw_meta(0, 1000, 10);
        let src = tmp.path().join("src");
        write_local_block(&src, &meta).await;

        let id = store.upload_block(&cancel, &src).await.unwrap();
        assert_eq!(id, meta.id);

        let dst = tmp.path().join("dst");
        store.download_block(&cancel, id, &dst).await.unwrap();

        let back = BlockMeta::read_from_dir(&dst).await.unwrap();
        assert_eq!(back, meta);
        let chunk = tokio::fs::read(dst.join(CHUNKS_DIR).join("000001"))
            .await
            .unwrap();
        assert_eq!(chunk, b"chunk-data");
    }

    #[tokio::test]
    async fn test_download_skips_markers() {
        let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = BlockStore::new(Arc::clone(&bucket), 2).unwrap();
        let cancel = CancellationToken::new();
        let tmp = tempfile::tempdir().unwrap();

        let meta = raw_meta(0, 1000, 10);
        let src = tmp.path().join("src");
        write_local_block(&src, &meta).await;
        store.upload_block(&cancel, &src).await.unwrap();
        super::super::mark_for_deletion(bucket.as_ref(), meta.id, "outdated block")
            .await
            .unwrap();

        let dst = tmp.path().join("dst");
        store.download_block(&cancel, meta.id, &dst).await.unwrap();
        assert!(!dst.join(DELETION_MARK_FILENAME).exists());
    }

    #[tokio::test]
    async fn test_download_of_missing_block_fails() {
        let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = BlockStore::new(bucket, 2).unwrap();
        let cancel = CancellationToken::new();
        let tmp = tempfile::tempdir().unwrap();

        let err = store
            .download_block(&cancel, BlockId::new(9), &tmp.path().join("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_zero_file_concurrency_rejected() {
        let bucket: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        assert!(BlockStore::new(bucket, 0).is_err());
    }
}
