//! 上传处理器：分片上传会话接口与整文件上传。

use axum::body::Bytes;
use axum::extract::Extension;
use axum::extract::multipart::{Field, Multipart, MultipartError, MultipartRejection};
use futures_util::stream::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::atomic::AtomicFile;
use crate::config::DEFAULT_LOCK_WAIT_TIMEOUT_SECS;
use crate::error::ApiError;
use crate::http::parse_json_body;
use crate::locking::{LockManager, path_lock_key};
use crate::multipart::UploadManager;
use crate::response::Envelope;
use crate::storage::Storage;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct MultipartInitRequest {
    file_path: String,
    total_parts: u64,
    total_size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MultipartInitResponse {
    upload_id: String,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub(crate) struct UploadIdRequest {
    upload_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FilePathResponse {
    file_path: String,
}

/// 初始化分片上传会话。
pub async fn init_multipart(
    Extension(uploads): Extension<Arc<UploadManager>>,
    body: Bytes,
) -> Result<Envelope<MultipartInitResponse>, ApiError> {
    let payload: MultipartInitRequest = parse_json_body(&body)?;
    let session = uploads
        .create(&payload.file_path, payload.total_parts, payload.total_size)
        .await?;
    Ok(Envelope::with_data(MultipartInitResponse {
        upload_id: session.upload_id,
    }))
}

/// 上传单个分片，表单字段 `uploadId`、`partNumber` 与文件字段 `file`。
pub async fn upload_part(
    Extension(uploads): Extension<Arc<UploadManager>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Envelope<Value>, ApiError> {
    let mut multipart = multipart.map_err(|err| {
        debug!(error = %err, "part upload is not a multipart form");
        ApiError::Validation("Invalid file".into())
    })?;

    let mut upload_id: Option<String> = None;
    let mut part_number: Option<String> = None;
    let mut stored = false;
    let mut spool: Option<Spool> = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid_form)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("uploadId") => upload_id = Some(field.text().await.map_err(invalid_form)?),
            Some("partNumber") => part_number = Some(field.text().await.map_err(invalid_form)?),
            Some("file") if !stored && spool.is_none() => {
                if let (Some(id), Some(raw)) = (upload_id.as_deref(), part_number.as_deref()) {
                    let number = parse_part_number(raw)?;
                    let mut reader = field_reader(field);
                    uploads.write_part(id, number, &mut reader).await?;
                    stored = true;
                } else {
                    spool = Some(Spool::from_field(uploads.temp_root(), field).await?);
                }
            }
            _ => {}
        }
    }
    if stored {
        return Ok(Envelope::ok());
    }

    let result: Result<(), ApiError> = async {
        let number = parse_part_number(part_number.as_deref().unwrap_or_default())?;
        let upload_id = upload_id.unwrap_or_default();
        let Some(spool) = spool.as_ref() else {
            return Err(ApiError::Validation("Invalid file".into()));
        };
        let mut file = spool.open().await?;
        uploads.write_part(&upload_id, number, &mut file).await?;
        Ok(())
    }
    .await;
    if let Some(spool) = spool {
        spool.remove().await;
    }
    result.map(|()| Envelope::ok())
}

/// 合并全部分片，返回目标相对路径。
pub async fn complete_multipart(
    Extension(uploads): Extension<Arc<UploadManager>>,
    body: Bytes,
) -> Result<Envelope<FilePathResponse>, ApiError> {
    let payload: UploadIdRequest = parse_json_body(&body)?;
    let session = uploads.finalize(&payload.upload_id).await?;
    Ok(Envelope::with_data(FilePathResponse {
        file_path: session.file_path,
    }))
}

/// 中止上传并清理会话目录。
pub async fn abort_multipart(
    Extension(uploads): Extension<Arc<UploadManager>>,
    body: Bytes,
) -> Result<Envelope<Value>, ApiError> {
    let payload: UploadIdRequest = parse_json_body(&body)?;
    uploads.abort(&payload.upload_id).await?;
    Ok(Envelope::ok())
}

/// 整文件上传，表单字段 `filePath` 与文件字段 `file`，原子替换目标文件。
pub async fn upload_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    Extension(uploads): Extension<Arc<UploadManager>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Envelope<FilePathResponse>, ApiError> {
    let mut multipart = multipart.map_err(|err| {
        debug!(error = %err, "upload is not a multipart form");
        ApiError::Validation("Invalid file".into())
    })?;

    let mut file_path: Option<String> = None;
    let mut stored: Option<PathBuf> = None;
    let mut spool: Option<Spool> = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid_form)? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("filePath") => file_path = Some(field.text().await.map_err(invalid_form)?),
            Some("file") if stored.is_none() && spool.is_none() => {
                if let Some(path) = file_path.as_deref() {
                    let mut reader = field_reader(field);
                    stored = Some(store_file(&storage, &locks, path, &mut reader).await?);
                } else {
                    spool = Some(Spool::from_field(uploads.temp_root(), field).await?);
                }
            }
            _ => {}
        }
    }

    let target = match stored {
        Some(target) => target,
        None => {
            let result: Result<PathBuf, ApiError> = async {
                let Some(spool) = spool.as_ref() else {
                    return Err(ApiError::Validation("Invalid file".into()));
                };
                let path = file_path.as_deref().unwrap_or_default();
                let mut file = spool.open().await?;
                store_file(&storage, &locks, path, &mut file).await
            }
            .await;
            if let Some(spool) = spool {
                spool.remove().await;
            }
            result?
        }
    };

    Ok(Envelope::with_data(FilePathResponse {
        file_path: target.to_string_lossy().to_string(),
    }))
}

/// 将数据流原子写入数据目录下的目标路径，返回目标绝对路径。
async fn store_file<R>(
    storage: &Storage,
    locks: &LockManager,
    file_path: &str,
    reader: &mut R,
) -> Result<PathBuf, ApiError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let file_path = file_path.trim();
    if file_path.trim_start_matches(['/', '\\']).is_empty() {
        return Err(ApiError::Validation("filePath is required".into()));
    }
    let target = storage.resolve_path_checked(file_path, true).await?;
    let _guard = locks
        .lock_exclusive_with_timeout(
            &path_lock_key(file_path),
            Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
        )
        .await
        .map_err(|_| ApiError::PathLocked)?;

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.map_err(write_failure)?;
    }
    let mut atomic = AtomicFile::new(&target).await.map_err(write_failure)?;
    let written = match tokio::io::copy(reader, atomic.file_mut()).await {
        Ok(written) => written,
        Err(err) => {
            atomic.cleanup().await;
            return Err(write_failure(err));
        }
    };
    atomic.finalize().await.map_err(write_failure)?;

    info!(path = file_path, bytes = written, "upload file");
    Ok(target)
}

/// 文件字段早于其它表单字段到达时，先落盘到临时根目录。
struct Spool {
    path: PathBuf,
}

impl Spool {
    async fn from_field(temp_root: &Path, field: Field<'_>) -> Result<Self, ApiError> {
        fs::create_dir_all(temp_root)
            .await
            .map_err(write_failure)?;
        let path = temp_root.join(format!(".spool-{}.tmp", Uuid::new_v4().simple()));
        let mut reader = field_reader(field);
        let copied: io::Result<u64> = async {
            let mut file = File::create(&path).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok(written)
        }
        .await;
        match copied {
            Ok(bytes) => {
                debug!(path = ?path, bytes, "spooled upload field");
                Ok(Self { path })
            }
            Err(err) => {
                let _ = fs::remove_file(&path).await;
                Err(write_failure(err))
            }
        }
    }

    async fn open(&self) -> Result<File, ApiError> {
        File::open(&self.path).await.map_err(write_failure)
    }

    async fn remove(self) {
        if let Err(err) = fs::remove_file(&self.path).await {
            warn!(path = ?self.path, error = %err, "failed to remove spool file");
        }
    }
}

fn field_reader<'a>(field: Field<'a>) -> impl AsyncRead + Unpin + 'a {
    StreamReader::new(Box::pin(
        field.map(|chunk| chunk.map_err(|err| io::Error::other(err.to_string()))),
    ))
}

/// 分片编号必须为非负整数。
fn parse_part_number(raw: &str) -> Result<u64, ApiError> {
    let number: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::Validation("Invalid partNumber".into()))?;
    u64::try_from(number)
        .map_err(|_| ApiError::Validation("Invalid uploadId or partNumber".into()))
}

fn invalid_form(err: MultipartError) -> ApiError {
    debug!(error = %err, "malformed multipart form");
    ApiError::Validation("Invalid file".into())
}

fn write_failure(err: io::Error) -> ApiError {
    warn!(error = %err, "failed to write uploaded file");
    ApiError::Storage("Failed to create file".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_numbers_must_be_non_negative_integers() {
        assert_eq!(parse_part_number("0").ok(), Some(0));
        assert_eq!(parse_part_number(" 12 ").ok(), Some(12));
        assert!(matches!(
            parse_part_number("-1"),
            Err(ApiError::Validation(msg)) if msg == "Invalid uploadId or partNumber"
        ));
        assert!(matches!(
            parse_part_number("two"),
            Err(ApiError::Validation(msg)) if msg == "Invalid partNumber"
        ));
        assert!(matches!(
            parse_part_number(""),
            Err(ApiError::Validation(msg)) if msg == "Invalid partNumber"
        ));
    }
}
