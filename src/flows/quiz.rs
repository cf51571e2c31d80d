use crate::dispatch::DispatchRequest;
use crate::error::AppError;
use crate::flows::{AppState, check_count, decode_request, parse, parse_difficulty, require_nonempty, respond_ok};
use crate::gemini::types::GenerateRequest;
use crate::logging;
use crate::models::PlanTier;
use crate::util::id;
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, Method};
use axum::response::Response;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAX_QUESTIONS: u32 = 50;
// 超长文档直接拒绝，避免一次请求烧穿整个账期额度。
const MAX_DOCUMENT_CHARS: usize = 200_000;

const ALLOWED_QUESTION_TYPES: [&str; 3] = ["multiple-choice", "true-false", "short-answer"];

#[derive(Debug, Deserialize)]
pub struct CustomQuizRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default = "default_question_count")]
    pub question_count: u32,
    #[serde(default)]
    pub question_types: Vec<String>,
    #[serde(default)]
    pub additional_instructions: String,
}

#[derive(Debug, Deserialize)]
pub struct DocumentQuizRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub document_text: String,
    #[serde(default)]
    pub difficulty: String,
    #[serde(default = "default_question_count")]
    pub question_count: u32,
    #[serde(default)]
    pub question_types: Vec<String>,
    #[serde(default)]
    pub additional_instructions: String,
}

fn default_question_count() -> u32 {
    10
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Quiz {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub questions: Vec<QuizQuestion>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuizQuestion {
    pub question: String,
    #[serde(rename = "type", default)]
    pub question_type: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub answer: String,
    #[serde(default)]
    pub explanation: String,
}

pub async fn handle_custom_quiz(
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

    let req: CustomQuizRequest = decode_request(&body)?;
    require_nonempty("user_id", &req.user_id)?;
    require_nonempty("topic", &req.topic)?;
    check_count("question_count", req.question_count, MAX_QUESTIONS)?;
    let difficulty = parse_difficulty(&req.difficulty)?;
    let types = validate_question_types(&req.question_types)?;

    let prompt = quiz_prompt(
        &format!("Topic: {}", req.topic.trim()),
        difficulty,
        req.question_count,
        &types,
        &req.additional_instructions,
    );

    let quiz = generate_quiz(&state, &req.user_id, &req.plan, prompt).await?;
    respond_ok(log_level, start, &quiz)
}

pub async fn handle_document_quiz(
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

    let req: DocumentQuizRequest = decode_request(&body)?;
    require_nonempty("user_id", &req.user_id)?;
    require_nonempty("document_text", &req.document_text)?;
    if req.document_text.chars().count() > MAX_DOCUMENT_CHARS {
        return Err(AppError::bad_request(
            "文档内容过长，请拆分后分批生成",
        ));
    }
    check_count("question_count", req.question_count, MAX_QUESTIONS)?;
    let difficulty = parse_difficulty(&req.difficulty)?;
    let types = validate_question_types(&req.question_types)?;

    let prompt = quiz_prompt(
        &format!(
            "Create the questions from the following document:\n{}",
            req.document_text.trim()
        ),
        difficulty,
        req.question_count,
        &types,
        &req.additional_instructions,
    );

    let quiz = generate_quiz(&state, &req.user_id, &req.plan, prompt).await?;
    respond_ok(log_level, start, &quiz)
}

async fn generate_quiz(
    state: &AppState,
    user_id: &str,
    plan: &str,
    prompt: String,
) -> Result<Quiz, AppError> {
    let outcome = state
        .dispatcher
        .dispatch(DispatchRequest {
            request_id: id::request_id(),
            user_id: user_id.to_string(),
            plan: PlanTier::parse(plan),
            payload: GenerateRequest::from_text(prompt).json_mode(),
            timeout: Duration::from_millis(state.cfg.timeout_quiz_ms),
        })
        .await?;

    let quiz: Quiz = parse::from_model_text(&outcome.text)?;
    if quiz.questions.is_empty() {
        return Err(AppError::parse("生成的试题为空"));
    }
    Ok(quiz)
}

fn validate_question_types(types: &[String]) -> Result<Vec<String>, AppError> {
    if types.is_empty() {
        return Ok(vec!["multiple-choice".to_string()]);
    }
    let mut out = Vec::with_capacity(types.len());
    for t in types {
        let t = t.trim().to_lowercase();
        if !ALLOWED_QUESTION_TYPES.contains(&t.as_str()) {
            return Err(AppError::bad_request(format!(
                "题型 {t} 无效，只支持 multiple-choice/true-false/short-answer"
            )));
        }
        if !out.contains(&t) {
            out.push(t);
        }
    }
    Ok(out)
}

fn quiz_prompt(
    source: &str,
    difficulty: &str,
    count: u32,
    types: &[String],
    extra: &str,
) -> String {
    let types_joined = types.join(", ");
    let mut p = format!(
        "You are a quiz generator for a study app. Create a quiz with exactly {count} questions \
         at {difficulty} difficulty. Allowed question types: {types_joined}.\n\
         Return ONLY a JSON object of the shape:\n\
         {{\"title\": string, \"questions\": [{{\"question\": string, \"type\": string, \
         \"options\": [string], \"answer\": string, \"explanation\": string}}]}}\n\
         For true-false questions use options [\"True\", \"False\"]. \
         For short-answer questions use an empty options array.\n\n{source}"
    );
    if !extra.trim().is_empty() {
        p.push_str("\nAdditional instructions: ");
        p.push_str(extra.trim());
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_types_default_and_dedup() {
        assert_eq!(
            validate_question_types(&[]).unwrap(),
            vec!["multiple-choice"]
        );
        let out = validate_question_types(&[
            "True-False".to_string(),
            "true-false".to_string(),
            "short-answer".to_string(),
        ])
        .unwrap();
        assert_eq!(out, vec!["true-false", "short-answer"]);
        assert!(validate_question_types(&["essay".to_string()]).is_err());
    }

    #[test]
    fn quiz_prompt_carries_parameters() {
        let p = quiz_prompt(
            "Topic: 细胞呼吸",
            "hard",
            12,
            &["multiple-choice".to_string()],
            "侧重考察过程顺序",
        );
        assert!(p.contains("exactly 12 questions"));
        assert!(p.contains("hard difficulty"));
        assert!(p.contains("Topic: 细胞呼吸"));
        assert!(p.contains("Additional instructions: 侧重考察过程顺序"));
    }

    #[test]
    fn empty_question_list_parses_so_handler_can_reject_it() {
        let quiz: Quiz = parse::from_model_text(r#"{"title":"t","questions":[]}"#).unwrap();
        assert!(quiz.questions.is_empty());
    }
}
