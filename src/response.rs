//! 管理接口统一的 JSON 响应包。

use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::Serialize;
use serde_json::{Map, Value};

pub const CODE_SUCCESS: i32 = 0;
pub const CODE_ERROR: i32 = -1;

/// `{ "code": int, "msg": string, "data": any }`，HTTP 状态码始终为 200。
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub code: i32,
    pub msg: String,
    pub data: T,
}

impl Envelope<Value> {
    /// 无数据的成功响应，`data` 为空对象。
    pub fn ok() -> Self {
        Self {
            code: CODE_SUCCESS,
            msg: "ok".into(),
            data: Value::Object(Map::new()),
        }
    }

    /// 失败响应。
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: CODE_ERROR,
            msg: msg.into(),
            data: Value::Object(Map::new()),
        }
    }
}

impl<T: Serialize> Envelope<T> {
    /// 携带数据的成功响应。
    pub fn with_data(data: T) -> Self {
        Self {
            code: CODE_SUCCESS,
            msg: "ok".into(),
            data,
        }
    }
}

impl<T: Serialize> IntoResponse for Envelope<T> {
    fn into_response(self) -> Response {
        JsonResponse(self).into_response()
    }
}
