//! 文件管理接口（移动、删除、存在性、大小、读取）与静态文件服务。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::Extension;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::auth::ADMIN_PREFIX;
use crate::config::DEFAULT_LOCK_WAIT_TIMEOUT_SECS;
use crate::error::ApiError;
use crate::http::parse_json_body;
use crate::locking::{LockManager, path_lock_key};
use crate::response::Envelope;
use crate::storage::{Storage, StorageError};

#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct PathRequest {
    path: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
pub(crate) struct MoveRequest {
    from: String,
    to: String,
}

#[derive(Serialize)]
pub(crate) struct SizeResponse {
    size: u64,
}

/// 移动文件或目录。
pub async fn move_entry(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    body: Bytes,
) -> Result<Envelope<Value>, ApiError> {
    let MoveRequest { from, to } = parse_json_body(&body)?;
    if !storage.exists(&from).await? {
        return Err(ApiError::NotFound("Source file not found".into()));
    }

    let mut keys = [path_lock_key(&from), path_lock_key(&to)];
    keys.sort();
    let _first = lock_path(&locks, &keys[0]).await?;
    let _second = if keys[0] != keys[1] {
        Some(lock_path(&locks, &keys[1]).await?)
    } else {
        None
    };
    storage
        .move_path(&from, &to)
        .await
        .map_err(operation_failure("Failed to move file"))?;
    info!(from = %from, to = %to, "move entry");
    Ok(Envelope::ok())
}

/// 删除文件或空目录。
pub async fn delete_entry(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(locks): Extension<Arc<LockManager>>,
    body: Bytes,
) -> Result<Envelope<Value>, ApiError> {
    let PathRequest { path } = parse_json_body(&body)?;
    if !storage.exists(&path).await? {
        return Err(ApiError::NotFound("File not found".into()));
    }
    let _guard = lock_path(&locks, &path_lock_key(&path)).await?;
    storage
        .delete_path(&path)
        .await
        .map_err(operation_failure("Failed to delete file"))?;
    info!(path = %path, "delete entry");
    Ok(Envelope::ok())
}

/// 查询路径是否存在。
pub async fn has_entry(
    Extension(storage): Extension<Arc<Storage>>,
    body: Bytes,
) -> Result<Envelope<bool>, ApiError> {
    let PathRequest { path } = parse_json_body(&body)?;
    let exists = storage.exists(&path).await?;
    Ok(Envelope::with_data(exists))
}

/// 查询文件大小。
pub async fn entry_size(
    Extension(storage): Extension<Arc<Storage>>,
    body: Bytes,
) -> Result<Envelope<SizeResponse>, ApiError> {
    let PathRequest { path } = parse_json_body(&body)?;
    if !storage.exists(&path).await? {
        return Err(ApiError::NotFound("File not found".into()));
    }
    let size = storage
        .size(&path)
        .await
        .map_err(operation_failure("Failed to get file info"))?;
    Ok(Envelope::with_data(SizeResponse { size }))
}

/// 以 `application/octet-stream` 返回文件原始内容；失败时使用 HTTP 状态码。
pub async fn fetch_bytes(
    Extension(storage): Extension<Arc<Storage>>,
    body: Bytes,
) -> Result<Response, StatusCode> {
    let PathRequest { path } = parse_json_body(&body).map_err(|_| StatusCode::NOT_FOUND)?;
    let target = storage
        .resolve_path_checked(&path, false)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    if !metadata.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }
    let file = File::open(&target).await.map_err(|err| {
        warn!(path = %path, error = %err, "failed to open file");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(metadata.len()));
    debug!(path = %path, size = metadata.len(), "fetch bytes");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// 未匹配路由的回退处理：从数据目录提供静态文件，支持 Range 请求。
pub async fn serve_static(
    Extension(storage): Extension<Arc<Storage>>,
    req: Request<AxumBody>,
) -> Response {
    let raw_path = req.uri().path();
    if raw_path.starts_with(ADMIN_PREFIX) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Ok(path) = percent_decode_str(raw_path).decode_utf8() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Ok(target) = storage.resolve_path_checked(&path, false).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match serve_file(target, req.headers()).await {
        Ok(response) => response,
        Err(status) => status.into_response(),
    }
}

async fn serve_file(target: PathBuf, request_headers: &HeaderMap) -> Result<Response, StatusCode> {
    let metadata = fs::metadata(&target)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    if !metadata.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }
    let file_size = metadata.len();
    let modified = metadata.modified().ok();
    let mime = mime_guess::from_path(&target).first_or_octet_stream();

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
        response_headers.insert(header::CONTENT_TYPE, value);
    }
    response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Some(value) = modified
        .map(httpdate::fmt_http_date)
        .and_then(|value| HeaderValue::from_str(&value).ok())
    {
        response_headers.insert(header::LAST_MODIFIED, value);
    }

    let range = match parse_range(request_headers.get(header::RANGE), file_size) {
        Ok(range) => range,
        Err(RangeError::Invalid) => None,
        Err(RangeError::NotSatisfiable) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{file_size}")) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            return Ok((StatusCode::RANGE_NOT_SATISFIABLE, headers).into_response());
        }
    };

    let mut file = File::open(&target).await.map_err(|err| {
        warn!(path = ?target, error = %err, "failed to open static file");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if let Some((start, end)) = range {
        let length = end - start + 1;
        file.seek(SeekFrom::Start(start))
            .await
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
        if let Ok(value) = HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}")) {
            response_headers.insert(header::CONTENT_RANGE, value);
        }
        response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        return Ok((
            StatusCode::PARTIAL_CONTENT,
            response_headers,
            AxumBody::from_stream(ReaderStream::new(file.take(length))),
        )
            .into_response());
    }

    response_headers.insert(header::CONTENT_LENGTH, HeaderValue::from(file_size));
    Ok((
        StatusCode::OK,
        response_headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

#[derive(Debug, PartialEq, Eq)]
enum RangeError {
    Invalid,
    NotSatisfiable,
}

/// 解析单段 Range 头；无法解析的头按无 Range 处理。
fn parse_range(value: Option<&HeaderValue>, file_size: u64) -> Result<Option<(u64, u64)>, RangeError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| RangeError::Invalid)?;
    let Some(range) = value.strip_prefix("bytes=") else {
        return Err(RangeError::Invalid);
    };
    if range.contains(',') {
        return Err(RangeError::Invalid);
    }
    if file_size == 0 {
        return Err(RangeError::NotSatisfiable);
    }

    let (start_part, end_part) = range.split_once('-').ok_or(RangeError::Invalid)?;
    let (start, end) = if start_part.is_empty() {
        let suffix: u64 = end_part.parse().map_err(|_| RangeError::Invalid)?;
        if suffix == 0 {
            return Err(RangeError::NotSatisfiable);
        }
        (file_size.saturating_sub(suffix), file_size - 1)
    } else {
        let start: u64 = start_part.parse().map_err(|_| RangeError::Invalid)?;
        let end: u64 = if end_part.is_empty() {
            file_size - 1
        } else {
            end_part.parse().map_err(|_| RangeError::Invalid)?
        };
        (start, end.min(file_size - 1))
    };

    if start > end || start >= file_size {
        return Err(RangeError::NotSatisfiable);
    }
    Ok(Some((start, end)))
}

async fn lock_path(
    locks: &LockManager,
    key: &str,
) -> Result<tokio::sync::OwnedRwLockWriteGuard<()>, ApiError> {
    locks
        .lock_exclusive_with_timeout(key, Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS))
        .await
        .map_err(|_| ApiError::PathLocked)
}

fn operation_failure(msg: &'static str) -> impl Fn(StorageError) -> ApiError {
    move |err| match err {
        StorageError::InvalidPath => ApiError::Validation("invalid path".into()),
        StorageError::Io(err) => {
            warn!(error = %err, "{msg}");
            ApiError::Storage(msg.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(value: &'static str, size: u64) -> Result<Option<(u64, u64)>, RangeError> {
        parse_range(Some(&HeaderValue::from_static(value)), size)
    }

    #[test]
    fn parse_range_handles_common_forms() {
        assert_eq!(parse_range(None, 10), Ok(None));
        assert_eq!(range("bytes=0-4", 10), Ok(Some((0, 4))));
        assert_eq!(range("bytes=5-", 10), Ok(Some((5, 9))));
        assert_eq!(range("bytes=-3", 10), Ok(Some((7, 9))));
        assert_eq!(range("bytes=2-100", 10), Ok(Some((2, 9))));
    }

    #[test]
    fn parse_range_rejects_bad_ranges() {
        assert_eq!(range("bytes=10-12", 10), Err(RangeError::NotSatisfiable));
        assert_eq!(range("bytes=5-2", 10), Err(RangeError::NotSatisfiable));
        assert_eq!(range("bytes=0-1", 0), Err(RangeError::NotSatisfiable));
        assert_eq!(range("items=0-1", 10), Err(RangeError::Invalid));
        assert_eq!(range("bytes=0-1,3-4", 10), Err(RangeError::Invalid));
        assert_eq!(range("bytes=a-b", 10), Err(RangeError::Invalid));
    }
}
