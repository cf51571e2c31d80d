use crate::dispatch::DispatchRequest;
use crate::error::AppError;
use crate::flows::{AppState, decode_request, parse, require_nonempty, respond_ok};
use crate::gemini::types::{Content, GenerateRequest, InlineData, Part};
use crate::logging;
use crate::models::PlanTier;
use crate::util::id;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

const ALLOWED_IMAGE_MIME: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

#[derive(Debug, Deserialize)]
pub struct ExplainRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub plan: String,
    /// 需要讲解的题目或概念。
    #[serde(default)]
    pub question: String,
    /// 可选的上下文（题目出处、已知条件、用户的错误答案等）。
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageExplainRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub plan: String,
    /// base64 编码的图片内容。
    #[serde(default)]
    pub image_data: String,
    #[serde(default)]
    pub mime_type: String,
    /// 可选的附加提问；为空时按"讲解图中题目"处理。
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Explanation {
    #[serde(default)]
    pub explanation: String,
}

pub async fn handle_explain(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let req: ExplainRequest = decode_request(&body)?;
    require_nonempty("user_id", &req.user_id)?;
    require_nonempty("question", &req.question)?;

    let prompt = explain_prompt(&req.question, &req.context);

    let outcome = state
        .dispatcher
        .dispatch(DispatchRequest {
            request_id: id::request_id(),
            user_id: req.user_id.clone(),
            plan: PlanTier::parse(&req.plan),
            payload: GenerateRequest::from_text(prompt).json_mode(),
            timeout: Duration::from_millis(state.cfg.timeout_quiz_ms),
        })
        .await?;

    let explanation = parse_explanation(&outcome.text)?;
    respond_ok(log_level, start, &explanation)
}

pub async fn handle_image_explain(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let start = Instant::now();
    let log_level = state.cfg.log_level();
    if log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let req: ImageExplainRequest = decode_request(&body)?;
    require_nonempty("user_id", &req.user_id)?;
    require_nonempty("image_data", &req.image_data)?;
    validate_image(&req.mime_type, &req.image_data)?;

    let instruction = if req.prompt.trim().is_empty() {
        "Explain the problem shown in this image step by step.".to_string()
    } else {
        req.prompt.trim().to_string()
    };

    let content = Content {
        role: "user".to_string(),
        parts: vec![
            Part {
                text: format!(
                    "{instruction}\nReturn ONLY a JSON object of the shape: \
                     {{\"explanation\": string}} where explanation is markdown."
                ),
                inline_data: None,
            },
            Part {
                text: String::new(),
                inline_data: Some(InlineData {
                    mime_type: req.mime_type.trim().to_string(),
                    data: req.image_data,
                }),
            },
        ],
    };

    let payload = GenerateRequest {
        contents: vec![content],
        system_instruction: None,
        generation_config: None,
    }
    .json_mode();

    let outcome = state
        .dispatcher
        .dispatch(DispatchRequest {
            request_id: id::request_id(),
            user_id: req.user_id.clone(),
            plan: PlanTier::parse(&req.plan),
            payload,
            timeout: Duration::from_millis(state.cfg.timeout_quiz_ms),
        })
        .await?;

    let explanation = parse_explanation(&outcome.text)?;
    respond_ok(log_level, start, &explanation)
}

fn parse_explanation(text: &str) -> Result<Explanation, AppError> {
    let explanation: Explanation = parse::from_model_text(text)?;
    if explanation.explanation.trim().is_empty() {
        return Err(AppError::parse("生成的讲解内容为空"));
    }
    Ok(explanation)
}

/// 图片在发给上游之前先验明正身：mime 在白名单内、base64 可解码。
fn validate_image(mime_type: &str, data: &str) -> Result<(), AppError> {
    let mime = mime_type.trim();
    if !ALLOWED_IMAGE_MIME.contains(&mime) {
        return Err(AppError::bad_request(format!(
            "图片类型 {mime} 不支持，只接受 image/png、image/jpeg、image/webp"
        )));
    }
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|_| AppError::bad_request("image_data 不是合法的 base64 内容"))?;
    Ok(())
}

fn explain_prompt(question: &str, context: &str) -> String {
    let mut p = format!(
        "You are a patient tutor. Explain the following question or concept step by \
         step, in plain language a student can follow.\n\
         Return ONLY a JSON object of the shape: {{\"explanation\": string}} \
         where explanation is markdown.\n\n\
         Question: {}",
        question.trim()
    );
    if !context.trim().is_empty() {
        p.push_str("\nContext: ");
        p.push_str(context.trim());
    }
    p
}
