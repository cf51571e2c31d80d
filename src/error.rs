use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 对外失败分类。展示文案都是服务自己的措辞，
/// 上游的原始错误文本只进日志，不透传给调用方。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("没有配置可用的 API Key，生成能力不可用")]
    PoolExhausted,

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("生成超时，请稍后重试，或减少题目数量/缩小内容范围后再试")]
    Timeout,

    #[error("请求模型服务失败，请检查网络连接后重试")]
    Network,

    #[error("模型返回了无法使用的内容，请重试")]
    InvalidResponse,

    #[error("生成结果解析失败: {0}")]
    Parse(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
struct ErrorBodyInner {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#type: Option<String>,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::QuotaExceeded(message.into())
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, ty) = match self {
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, Some("bad_request".to_string())),
            AppError::PoolExhausted => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("pool_exhausted".to_string()),
            ),
            AppError::QuotaExceeded(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("quota_exceeded".to_string()),
            ),
            AppError::Timeout => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("timeout".to_string()),
            ),
            AppError::Network => (
                StatusCode::SERVICE_UNAVAILABLE,
                Some("network".to_string()),
            ),
            AppError::InvalidResponse => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("invalid_response".to_string()),
            ),
            AppError::Parse(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("parse".to_string()),
            ),
            AppError::Anyhow(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Some("internal".to_string()),
            ),
        };

        let body = ErrorBody {
            error: ErrorBodyInner {
                message: self.to_string(),
                r#type: ty,
            },
        };

        (status, Json(body)).into_response()
    }
}
