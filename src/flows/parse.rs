use crate::error::AppError;
use serde::de::DeserializeOwned;

/// 模型即使在 JSON 模式下也可能把结果包进 markdown 围栏，或在前后附加
/// 说明文字。依次尝试：原文 → 剥围栏 → 截取最外层 JSON 片段。
pub fn from_model_text<T: DeserializeOwned>(text: &str) -> Result<T, AppError> {
    for candidate in candidates(text) {
        if let Ok(v) = sonic_rs::from_str::<T>(candidate) {
            return Ok(v);
        }
    }
    Err(AppError::parse("模型输出不是预期的 JSON 结构"))
}

fn candidates(text: &str) -> Vec<&str> {
    let trimmed = text.trim();
    let mut out = vec![trimmed];
    if let Some(inner) = strip_code_fence(trimmed) {
        out.push(inner);
    }
    if let Some(slice) = outer_json_slice(trimmed) {
        out.push(slice);
    }
    out
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    // 跳过语言标注（```json）所在行。
    let rest = match rest.find('\n') {
        Some(i) => &rest[i + 1..],
        None => rest,
    };
    let end = rest.rfind("```")?;
    Some(rest[..end].trim())
}

/// 从第一个 '{' 或 '[' 截到与之同类的最后一个闭合符。
fn outer_json_slice(text: &str) -> Option<&str> {
    let start_obj = text.find('{');
    let start_arr = text.find('[');
    let (start, close) = match (start_obj, start_arr) {
        (Some(o), Some(a)) if a < o => (a, ']'),
        (Some(o), _) => (o, '}'),
        (None, Some(a)) => (a, ']'),
        (None, None) => return None,
    };
    let end = text.rfind(close)?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}
