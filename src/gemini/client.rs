use crate::config::Config;
use crate::gemini::types::{GenerateRequest, GenerateResponse};
use crate::logging;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("上游 API 错误 {status}: {message}")]
    Http { status: u16, message: String },

    #[error("请求上游失败: {0}")]
    Transport(String),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

// reqwest::Error 无法在进程内构造，这里只保留错误文本。
impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    base_url: String,
    log_level: logging::LogLevel,
}

impl GeminiClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        // 不在客户端层设置整体超时：各流程的时限不同（出题 120s、
        // 学习指南 180s），由派发层按次用计时器竞速。
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: cfg.gemini_base_url.trim_end_matches('/').to_string(),
            log_level: cfg.log_level(),
        })
    }

    fn generate_url(&self, model: &str) -> String {
        format!("{}/v1beta/models/{model}:generateContent", self.base_url)
    }

    /// 非流式生成。密钥按上游约定以 query 参数携带。
    /// 不在这里重试/轮换——那是派发层的职责。
    pub async fn generate_content(
        &self,
        model: &str,
        secret: &str,
        req: &GenerateRequest,
    ) -> Result<GenerateResponse, ApiError> {
        let url = self.generate_url(model);
        let body = sonic_rs::to_vec(req)?;

        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &format!("{url}?key={secret}"), &body);
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(&url)
            .query(&[("key", secret)])
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        let bytes = resp.bytes().await?;

        if self.log_level.backend_enabled() {
            logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
        }

        if !status.is_success() {
            return Err(extract_error_details(status.as_u16(), &bytes));
        }
        Ok(sonic_rs::from_slice::<GenerateResponse>(&bytes)?)
    }
}

/// 从上游错误响应里提取结构化细节。
/// 上游的 code 字段既可能是数字也可能是状态枚举字符串，统一归一成 HTTP 状态码。
fn extract_error_details(status: u16, body: &[u8]) -> ApiError {
    #[derive(Debug, serde::Deserialize)]
    struct ErrResp {
        error: ErrInner,
    }

    #[derive(Debug, serde::Deserialize)]
    struct ErrInner {
        #[serde(default)]
        code: Option<sonic_rs::Value>,
        #[serde(default)]
        message: String,
        #[serde(default)]
        status: String,
    }

    let mut out_status = status;
    let mut message = "Unknown error".to_string();

    if let Ok(err_resp) = sonic_rs::from_slice::<ErrResp>(body) {
        use sonic_rs::JsonValueTrait;

        let err = err_resp.error;
        if !err.message.is_empty() {
            message = err.message;
        }

        let code_str = err
            .code
            .as_ref()
            .and_then(|c| c.as_str().map(str::to_string))
            .unwrap_or_else(|| err.status.clone());
        match code_str.to_uppercase().as_str() {
            "RESOURCE_EXHAUSTED" => out_status = 429,
            "UNAVAILABLE" => out_status = 503,
            "INTERNAL" => out_status = 500,
            "UNAUTHENTICATED" => out_status = 401,
            "PERMISSION_DENIED" => out_status = 403,
            _ => {}
        }

        if let Some(i) = err.code.as_ref().and_then(|c| c.as_i64())
            && i > 0
            && i <= u16::MAX as i64
        {
            out_status = i as u16;
        }
    }

    ApiError::Http {
        status: out_status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_error_details_maps_resource_exhausted_to_429() {
        let body = r#"{
            "error": {
                "code": "RESOURCE_EXHAUSTED",
                "message": "Quota exceeded for quota metric",
                "status": "RESOURCE_EXHAUSTED"
            }
        }"#;

        let err = extract_error_details(400, body.as_bytes());
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn extract_error_details_prefers_numeric_code() {
        let body = r#"{
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "status": "RESOURCE_EXHAUSTED"
            }
        }"#;

        let err = extract_error_details(400, body.as_bytes());
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn extract_error_details_keeps_http_status_on_garbage_body() {
        let err = extract_error_details(502, b"upstream gateway exploded");
        assert_eq!(err.status(), Some(502));
        assert!(err.to_string().contains("Unknown error"));
    }
}
