use crate::dispatch::DispatchRequest;
use crate::error::AppError;
use crate::flows::{AppState, decode_request, parse, require_nonempty, respond_ok};
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

#[derive(Debug, Deserialize)]
pub struct StudyGuideRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub topic: String,
    /// 可选的侧重点（某个章节、考试大纲等）。
    #[serde(default)]
    pub focus: String,
    #[serde(default)]
    pub additional_instructions: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StudyGuide {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sections: Vec<GuideSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GuideSection {
    pub heading: String,
    /// markdown 正文。
    pub content: String,
}

pub async fn handle_study_guide(
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

    let req: StudyGuideRequest = decode_request(&body)?;
    require_nonempty("user_id", &req.user_id)?;
    require_nonempty("topic", &req.topic)?;

    let prompt = guide_prompt(&req.topic, &req.focus, &req.additional_instructions);

    let outcome = state
        .dispatcher
        .dispatch(DispatchRequest {
            request_id: id::request_id(),
            user_id: req.user_id.clone(),
            plan: PlanTier::parse(&req.plan),
            payload: GenerateRequest::from_text(prompt).json_mode(),
            // 学习指南篇幅长，用独立的更宽时限。
            timeout: Duration::from_millis(state.cfg.timeout_guide_ms),
        })
        .await?;

    let guide: StudyGuide = parse::from_model_text(&outcome.text)?;
    if guide.sections.is_empty() {
        return Err(AppError::parse("生成的学习指南没有任何章节"));
    }
    respond_ok(log_level, start, &guide)
}

fn guide_prompt(topic: &str, focus: &str, extra: &str) -> String {
    let mut p = format!(
        "You are a study-guide writer. Write a thorough, well-organized study guide \
         about the topic below. Split it into logical sections; section content is \
         GitHub-flavored markdown (lists, bold terms, tables where helpful).\n\
         Return ONLY a JSON object of the shape:\n\
         {{\"title\": string, \"sections\": [{{\"heading\": string, \"content\": string}}]}}\n\n\
         Topic: {}",
        topic.trim()
    );
    if !focus.trim().is_empty() {
        p.push_str("\nFocus on: ");
        p.push_str(focus.trim());
    }
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
    fn guide_prompt_includes_focus_only_when_present() {
        let p = guide_prompt("牛顿力学", "", "");
        assert!(p.contains("Topic: 牛顿力学"));
        assert!(!p.contains("Focus on:"));

        let p = guide_prompt("牛顿力学", "第二定律", "");
        assert!(p.contains("Focus on: 第二定律"));
    }

    #[test]
    fn guide_shape_parses() {
        let guide: StudyGuide = parse::from_model_text(
            r#"{"title":"t","sections":[{"heading":"h","content":"c"}]}"#,
        )
        .unwrap();
        assert_eq!(guide.sections.len(), 1);
    }
}
