//! 分片上传会话：创建、写入分片、合并与中止。
//!
//! 每个会话对应 `<temp>/MultiPart/<uploadId>/` 目录，其中 `meta.json` 保存会话元数据，
//! 第 N 个分片保存为 `partN`。目录存在即会话存在，删除目录即结束会话。

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::config::{DEFAULT_LOCK_WAIT_TIMEOUT_SECS, MULTIPART_DIR};
use crate::locking::{LockManager, path_lock_key, session_lock_key};
use crate::storage::{Storage, StorageError};

pub const META_FILE: &str = "meta.json";

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("invalid path")]
    InvalidPath,
    #[error("upload session not found")]
    SessionNotFound,
    #[error("part {0} is missing")]
    PartMissing(u64),
    #[error("upload session busy")]
    SessionBusy,
    #[error(transparent)]
    Storage(#[from] io::Error),
}

impl From<StorageError> for UploadError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => UploadError::InvalidPath,
            StorageError::Io(err) => UploadError::Storage(err),
        }
    }
}

/// 持久化在 `meta.json` 中的会话元数据。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    pub file_path: String,
    pub total_parts: u64,
    pub total_size: u64,
}

/// 管理分片上传会话的生命周期。
#[derive(Debug)]
pub struct UploadManager {
    temp_root: PathBuf,
    multipart_root: PathBuf,
    storage: Arc<Storage>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl UploadManager {
    pub fn new(temp_root: &Path, storage: Arc<Storage>, locks: Arc<LockManager>) -> Self {
        Self {
            temp_root: temp_root.to_path_buf(),
            multipart_root: temp_root.join(MULTIPART_DIR),
            storage,
            locks,
            lock_timeout: Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn multipart_root(&self) -> &Path {
        &self.multipart_root
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.multipart_root).await
    }

    /// 返回会话目录，拒绝无法安全作为目录名的 id。
    pub fn session_dir(&self, upload_id: &str) -> Result<PathBuf, UploadError> {
        validate_upload_id(upload_id)?;
        Ok(self.multipart_root.join(upload_id))
    }

    /// 创建会话：生成随机 id、建立会话目录并写入元数据。
    pub async fn create(
        &self,
        file_path: &str,
        total_parts: u64,
        total_size: u64,
    ) -> Result<UploadSession, UploadError> {
        let file_path = file_path
            .trim()
            .trim_start_matches(['/', '\\'])
            .to_string();
        if file_path.is_empty() {
            return Err(UploadError::Validation("filePath is required".into()));
        }
        if total_parts == 0 {
            return Err(UploadError::Validation(
                "totalParts must be at least 1".into(),
            ));
        }
        self.storage.resolve_path_checked(&file_path, true).await?;

        fs::create_dir_all(&self.multipart_root).await?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.multipart_root.join(&upload_id);
        fs::create_dir(&dir).await?;

        let session = UploadSession {
            upload_id,
            file_path,
            total_parts,
            total_size,
        };
        if let Err(err) = write_metadata(&dir, &session).await {
            let _ = fs::remove_dir_all(&dir).await;
            return Err(err.into());
        }

        info!(
            upload_id = %session.upload_id,
            file_path = %session.file_path,
            total_parts,
            total_size,
            "init multipart upload"
        );
        Ok(session)
    }

    /// 读取会话元数据。
    pub async fn lookup(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        let dir = self.session_dir(upload_id)?;
        let bytes = match fs::read(dir.join(META_FILE)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(UploadError::SessionNotFound);
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| UploadError::Storage(io::Error::new(io::ErrorKind::InvalidData, err)))
    }

    /// 写入单个分片，覆盖同编号的旧内容。
    ///
    /// 数据先写入会话目录内的隐藏临时文件，完成后再重命名为 `partN`，
    /// 因此合并时不会读到写了一半的分片。
    pub async fn write_part<R>(
        &self,
        upload_id: &str,
        part_number: u64,
        reader: &mut R,
    ) -> Result<u64, UploadError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let dir = self.session_dir(upload_id)?;
        let _guard = self
            .locks
            .lock_shared_with_timeout(&session_lock_key(upload_id), self.lock_timeout)
            .await
            .map_err(|_| UploadError::SessionBusy)?;
        self.lookup(upload_id).await?;

        let part_path = dir.join(part_file_name(part_number));
        let staging_path = dir.join(format!(
            ".{}.{}.tmp",
            part_file_name(part_number),
            Uuid::new_v4().simple()
        ));
        let written = match copy_to_file(reader, &staging_path).await {
            Ok(written) => written,
            Err(err) => {
                let _ = fs::remove_file(&staging_path).await;
                return Err(err.into());
            }
        };
        if let Err(err) = fs::rename(&staging_path, &part_path).await {
            let _ = fs::remove_file(&staging_path).await;
            return Err(err.into());
        }

        debug!(upload_id, part_number, bytes = written, "upload part saved");
        Ok(written)
    }

    /// 按分片编号顺序合并为目标文件，成功后删除会话目录。
    ///
    /// 所有分片在写入数据目录前先校验齐全；合并结果经临时文件原子替换到目标路径，
    /// 任一步失败时目标路径保持原样。
    pub async fn finalize(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        let dir = self.session_dir(upload_id)?;
        let _session_guard = self
            .locks
            .lock_exclusive_with_timeout(&session_lock_key(upload_id), self.lock_timeout)
            .await
            .map_err(|_| UploadError::SessionBusy)?;
        let session = self.lookup(upload_id).await?;

        for part_number in 1..=session.total_parts {
            match fs::metadata(dir.join(part_file_name(part_number))).await {
                Ok(metadata) if metadata.is_file() => {}
                Ok(_) => return Err(UploadError::PartMissing(part_number)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    warn!(upload_id, part_number, "missing part on finalize");
                    return Err(UploadError::PartMissing(part_number));
                }
                Err(err) => return Err(err.into()),
            }
        }

        let target = self
            .storage
            .resolve_path_checked(&session.file_path, true)
            .await?;
        let _path_guard = self
            .locks
            .lock_exclusive_with_timeout(&path_lock_key(&session.file_path), self.lock_timeout)
            .await
            .map_err(|_| UploadError::SessionBusy)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut atomic = AtomicFile::new(&target).await?;
        let mut total_written: u64 = 0;
        for part_number in 1..=session.total_parts {
            let copied = match append_part(&dir, part_number, atomic.file_mut()).await {
                Ok(copied) => copied,
                Err(err) => {
                    atomic.cleanup().await;
                    return Err(err);
                }
            };
            total_written += copied;
        }

        if session.total_size > 0 && total_written != session.total_size {
            warn!(
                upload_id,
                expected = session.total_size,
                actual = total_written,
                "size mismatch after merge"
            );
        }
        atomic.finalize().await?;

        if let Err(err) = fs::remove_dir_all(&dir).await {
            warn!(upload_id, error = %err, "failed to remove finalized session dir");
        }

        info!(
            upload_id,
            file_path = %session.file_path,
            bytes = total_written,
            "multipart upload complete"
        );
        Ok(session)
    }

    /// 中止会话并删除已上传的全部分片。
    pub async fn abort(&self, upload_id: &str) -> Result<(), UploadError> {
        let dir = self.session_dir(upload_id)?;
        let _guard = self
            .locks
            .lock_exclusive_with_timeout(&session_lock_key(upload_id), self.lock_timeout)
            .await
            .map_err(|_| UploadError::SessionBusy)?;
        match fs::metadata(&dir).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Err(UploadError::SessionNotFound),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(UploadError::SessionNotFound);
            }
            Err(err) => return Err(err.into()),
        }
        fs::remove_dir_all(&dir).await?;

        info!(upload_id, "multipart upload aborted");
        Ok(())
    }
}

pub fn part_file_name(part_number: u64) -> String {
    format!("part{part_number}")
}

/// 会话 id 只允许 ASCII 字母与数字。
pub fn validate_upload_id(upload_id: &str) -> Result<(), UploadError> {
    if upload_id.is_empty() {
        return Err(UploadError::Validation("uploadId is required".into()));
    }
    if !upload_id.chars().all(|ch| ch.is_ascii_alphanumeric()) {
        return Err(UploadError::Validation("Invalid uploadId".into()));
    }
    Ok(())
}

async fn write_metadata(dir: &Path, session: &UploadSession) -> io::Result<()> {
    let content = serde_json::to_vec(session).map_err(io::Error::other)?;
    let mut atomic = AtomicFile::new(&dir.join(META_FILE)).await?;
    if let Err(err) = atomic.file_mut().write_all(&content).await {
        atomic.cleanup().await;
        return Err(err);
    }
    atomic.finalize().await
}

async fn copy_to_file<R>(reader: &mut R, path: &Path) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = File::create(path).await?;
    let written = tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    Ok(written)
}

async fn append_part(dir: &Path, part_number: u64, out: &mut File) -> Result<u64, UploadError> {
    let mut part = match File::open(dir.join(part_file_name(part_number))).await {
        Ok(part) => part,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(UploadError::PartMissing(part_number));
        }
        Err(err) => return Err(err.into()),
    };
    Ok(tokio::io::copy(&mut part, out).await?)
}
