use crate::dispatch::DispatchRequest;
use crate::error::AppError;
use crate::flows::{AppState, check_count, decode_request, parse, require_nonempty, respond_ok};
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

const MAX_CARDS: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct FlashcardsRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default = "default_card_count")]
    pub card_count: u32,
    #[serde(default)]
    pub additional_instructions: String,
}

fn default_card_count() -> u32 {
    20
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Flashcards {
    #[serde(default)]
    pub cards: Vec<Flashcard>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Flashcard {
    pub front: String,
    pub back: String,
}

pub async fn handle_flashcards(
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

    let req: FlashcardsRequest = decode_request(&body)?;
    require_nonempty("user_id", &req.user_id)?;
    require_nonempty("topic", &req.topic)?;
    check_count("card_count", req.card_count, MAX_CARDS)?;

    let prompt = flashcards_prompt(&req.topic, req.card_count, &req.additional_instructions);

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

    let cards: Flashcards = parse::from_model_text(&outcome.text)?;
    if cards.cards.is_empty() {
        return Err(AppError::parse("生成的卡片为空"));
    }
    respond_ok(log_level, start, &cards)
}

fn flashcards_prompt(topic: &str, count: u32, extra: &str) -> String {
    let mut p = format!(
        "You are a flashcard author for a study app. Create exactly {count} flashcards \
         about the topic below. Each card has a concise prompt on the front and the \
         answer or definition on the back.\n\
         Return ONLY a JSON object of the shape:\n\
         {{\"cards\": [{{\"front\": string, \"back\": string}}]}}\n\n\
         Topic: {}",
        topic.trim()
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
    fn flashcards_prompt_carries_parameters() {
        let p = flashcards_prompt("光合作用", 15, "用高中生能懂的语言");
        assert!(p.contains("exactly 15 flashcards"));
        assert!(p.contains("Topic: 光合作用"));
        assert!(p.contains("用高中生能懂的语言"));
    }

    #[test]
    fn flashcards_shape_parses() {
        let cards: Flashcards =
            parse::from_model_text(r#"{"cards":[{"front":"f","back":"b"}]}"#).unwrap();
        assert_eq!(cards.cards.len(), 1);
    }
}
