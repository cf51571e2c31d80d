use crate::dispatch::DispatchRequest;
use crate::error::AppError;
use crate::flows::{AppState, decode_request, require_nonempty, respond_ok};
use crate::gemini::types::{Content, GenerateRequest, Part, SystemInstruction};
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

/// 多轮对话只保留最近的轮次，防止历史无限增长吃掉配额。
const MAX_HISTORY_TURNS: usize = 20;

const SYSTEM_PROMPT: &str = "You are the in-app study assistant. Answer questions about \
studying, quizzes, flashcards and study guides. Be concise, friendly and concrete. \
If a question is outside studying or this app, say so briefly and steer back.";

#[derive(Debug, Deserialize)]
pub struct HelpBotRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatTurn {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct HelpBotReply {
    pub reply: String,
}

pub async fn handle_helpbot(
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

    let req: HelpBotRequest = decode_request(&body)?;
    require_nonempty("user_id", &req.user_id)?;
    require_nonempty("message", &req.message)?;

    let payload = build_conversation(&req.history, &req.message);

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

    // 助手回复就是自由文本，不走 JSON 解析。
    let reply = HelpBotReply {
        reply: outcome.text.trim().to_string(),
    };
    respond_ok(log_level, start, &reply)
}

fn build_conversation(history: &[ChatTurn], message: &str) -> GenerateRequest {
    let recent = if history.len() > MAX_HISTORY_TURNS {
        &history[history.len() - MAX_HISTORY_TURNS..]
    } else {
        history
    };

    let mut contents: Vec<Content> = Vec::with_capacity(recent.len() + 1);
    for turn in recent {
        if turn.text.trim().is_empty() {
            continue;
        }
        // 客户端角色只认 user，其它一律当模型侧历史。
        if turn.role.trim().eq_ignore_ascii_case("user") {
            contents.push(Content::user_text(turn.text.trim()));
        } else {
            contents.push(Content::model_text(turn.text.trim()));
        }
    }
    contents.push(Content::user_text(message.trim()));

    GenerateRequest {
        contents,
        system_instruction: Some(SystemInstruction {
            role: String::new(),
            parts: vec![Part {
                text: SYSTEM_PROMPT.to_string(),
                inline_data: None,
            }],
        }),
        generation_config: None,
    }
}
