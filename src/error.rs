//! 统一的 API 错误类型与转换。

use axum::response::{IntoResponse, Response};
use std::io::ErrorKind;
use thiserror::Error;
use tracing::warn;

use crate::multipart::UploadError;
use crate::response::Envelope;
use crate::storage::StorageError;

/// 管理接口错误；统一渲染为 `code = -1` 的响应包。
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("Invalid token")]
    Auth,
    #[error("UploadIDNotFound")]
    SessionNotFound,
    #[error("Part file missing: part {0}")]
    PartMissing(u64),
    #[error("Upload session busy")]
    SessionBusy,
    #[error("Path locked")]
    PathLocked,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Storage(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        Envelope::error(self.to_string()).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::InvalidPath => ApiError::Validation("invalid path".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("File not found".into()),
                _ => {
                    warn!(error = %err, "storage operation failed");
                    ApiError::Storage(err.to_string())
                }
            },
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::Validation(msg) => ApiError::Validation(msg),
            UploadError::InvalidPath => ApiError::Validation("invalid path".into()),
            UploadError::SessionNotFound => ApiError::SessionNotFound,
            UploadError::PartMissing(part) => ApiError::PartMissing(part),
            UploadError::SessionBusy => ApiError::SessionBusy,
            UploadError::Storage(err) => {
                warn!(error = %err, "upload storage operation failed");
                ApiError::Storage(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use std::io;

    async fn render(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        (status, serde_json::from_slice(&bytes).expect("json body"))
    }

    #[tokio::test]
    async fn errors_render_as_failure_envelope_with_ok_status() {
        let (status, body) = render(ApiError::Auth).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], -1);
        assert_eq!(body["msg"], "Invalid token");
        assert!(body["data"].as_object().is_some_and(|data| data.is_empty()));

        let (_, body) = render(ApiError::PartMissing(3)).await;
        assert_eq!(body["msg"], "Part file missing: part 3");
    }

    #[test]
    fn storage_errors_map_to_taxonomy() {
        assert!(matches!(
            ApiError::from(StorageError::InvalidPath),
            ApiError::Validation(_)
        ));
        assert!(matches!(
            ApiError::from(StorageError::Io(io::Error::from(ErrorKind::NotFound))),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from(StorageError::Io(io::Error::from(
                ErrorKind::PermissionDenied
            ))),
            ApiError::Storage(_)
        ));
    }
}
