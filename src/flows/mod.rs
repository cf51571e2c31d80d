//! 各内容生成流程的 HTTP 处理器。
//!
//! 每个流程：校验输入 → 组装提示词 → 交给派发层 → 解析结构化输出。
//! 流程之间无状态、互不依赖，只共享派发器。

pub mod explain;
pub mod flashcards;
pub mod helpbot;
pub mod parse;
pub mod quiz;
pub mod study_guide;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::AppError;
use crate::keypool::{KeyPool, PoolStatus};
use crate::logging::{self, LogLevel};
use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub pool: Arc<KeyPool>,
    pub dispatcher: Dispatcher,
}

pub async fn handle_pool_status(State(state): State<Arc<AppState>>) -> Json<PoolStatus> {
    Json(state.pool.status().await)
}

#[derive(Debug, Serialize)]
pub(crate) struct ResultEnvelope<T> {
    pub result: T,
}

pub(crate) fn decode_request<T: DeserializeOwned>(body: &Bytes) -> Result<T, AppError> {
    sonic_rs::from_slice(body.as_ref())
        .map_err(|_| AppError::bad_request("请求 JSON 解析失败，请检查请求体格式"))
}

pub(crate) fn respond_ok<T: Serialize>(
    log_level: LogLevel,
    start: Instant,
    value: &T,
) -> Result<Response, AppError> {
    let bytes = sonic_rs::to_vec(&ResultEnvelope { result: value })
        .map_err(|e| AppError::Anyhow(e.into()))?;
    if log_level.client_enabled() {
        logging::client_response(StatusCode::OK.as_u16(), start.elapsed(), &bytes);
    }
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "application/json")],
        bytes,
    )
        .into_response())
}

pub(crate) fn require_nonempty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::bad_request(format!("缺少必填字段 {field}")));
    }
    Ok(())
}

pub(crate) fn check_count(field: &str, value: u32, max: u32) -> Result<(), AppError> {
    if value == 0 || value > max {
        return Err(AppError::bad_request(format!(
            "{field} 必须在 1 到 {max} 之间"
        )));
    }
    Ok(())
}

/// 难度只认 easy/medium/hard，空值按 medium。
pub(crate) fn parse_difficulty(value: &str) -> Result<&'static str, AppError> {
    match value.trim().to_lowercase().as_str() {
        "" | "medium" => Ok("medium"),
        "easy" => Ok("easy"),
        "hard" => Ok("hard"),
        other => Err(AppError::bad_request(format!(
            "难度 {other} 无效，只支持 easy/medium/hard"
        ))),
    }
}
