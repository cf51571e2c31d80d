use axum::http::HeaderMap;
use std::borrow::Cow;
use std::time::Duration;

/// 日志等级：
/// - off：不输出请求/响应详情
/// - low：输出客户端请求/响应（格式化/脱敏）
/// - medium：输出客户端 + 后端请求/响应（格式化/脱敏）
/// - high：同 medium（保留档位，便于 DEBUG 值向后兼容）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Low = 1,
    Medium = 2,
    High = 3,
}

impl LogLevel {
    pub fn parse(debug: &str) -> Self {
        match debug.trim().to_lowercase().as_str() {
            "low" | "client" => Self::Low,
            "medium" | "backend" => Self::Medium,
            "high" | "all" => Self::High,
            _ => Self::Off,
        }
    }

    pub fn client_enabled(self) -> bool {
        self >= Self::Low
    }

    pub fn backend_enabled(self) -> bool {
        self >= Self::Medium
    }
}

pub fn format_duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

pub fn client_request(method: &str, path: &str, headers: &HeaderMap, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端请求 ======================\n[客户端请求] {method} {path}\n[客户端请求头]\n{}\n{}\n=========================================================",
        format_headers(headers),
        format_body_bytes(body)
    );
}

pub fn client_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n===================== 客户端响应 ======================\n[客户端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

pub fn backend_request(method: &str, url: &str, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端请求 ========================\n[后端请求] {method} {}\n{}\n==========================================================",
        redact_key_query(url),
        format_body_bytes(body)
    );
}

pub fn backend_response(status: u16, duration: Duration, body: &[u8]) {
    tracing::info!(
        "\n====================== 后端响应 ========================\n[后端响应] {} {}ms\n{}\n==========================================================",
        status,
        format_duration_ms(duration),
        format_body_bytes(body)
    );
}

/// API Key 以 query 参数传递，日志里必须打码。
pub fn redact_key_query(url: &str) -> Cow<'_, str> {
    let Some(idx) = url.find("key=") else {
        return Cow::Borrowed(url);
    };
    // 仅处理 ?key= / &key= 两种位置，避免误伤路径片段。
    if idx == 0 || !matches!(url.as_bytes()[idx - 1], b'?' | b'&') {
        return Cow::Borrowed(url);
    }
    let value_start = idx + "key=".len();
    let value_end = url[value_start..]
        .find('&')
        .map(|i| value_start + i)
        .unwrap_or(url.len());
    let mut out = String::with_capacity(url.len());
    out.push_str(&url[..value_start]);
    out.push_str("***");
    out.push_str(&url[value_end..]);
    Cow::Owned(out)
}

fn format_headers(headers: &HeaderMap) -> String {
    let mut out = String::new();
    for (name, value) in headers.iter() {
        let key = name.as_str();
        let key_lc = key.to_lowercase();
        let redacted = key_lc == "authorization"
            || key_lc == "proxy-authorization"
            || key_lc == "x-api-key"
            || key_lc == "cookie";

        out.push_str(key);
        out.push_str(": ");
        if redacted {
            out.push_str("***");
        } else {
            out.push_str(value.to_str().unwrap_or("<binary>"));
        }
        out.push('\n');
    }
    out
}

fn format_body_bytes(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    // 极端大包：避免为了日志格式化而产生巨额内存与 CPU 开销。
    const MAX_PARSE_BYTES: usize = 2 * 1024 * 1024;
    if bytes.len() > MAX_PARSE_BYTES {
        return format!("(body too large: {} bytes)", bytes.len());
    }

    match sonic_rs::from_slice::<sonic_rs::Value>(bytes) {
        Ok(v) => {
            let sanitized = sanitize_json_for_log(&v, false);
            sonic_rs::to_string_pretty(&sanitized).unwrap_or_else(|_| sanitized.to_string())
        }
        Err(_) => truncate_text_for_log(&String::from_utf8_lossy(bytes)),
    }
}

fn truncate_text_for_log(s: &str) -> String {
    const MAX_CHARS: usize = 32 * 1024;
    if s.chars().count() <= MAX_CHARS {
        return s.to_string();
    }
    let mut out = String::with_capacity(MAX_CHARS + 64);
    for (i, ch) in s.chars().enumerate() {
        if i >= MAX_CHARS {
            break;
        }
        out.push(ch);
    }
    out.push_str("...[TRUNCATED]");
    out
}

fn sanitize_json_for_log(v: &sonic_rs::Value, in_inline_data: bool) -> sonic_rs::Value {
    use sonic_rs::{JsonContainerTrait, JsonValueTrait};

    // 递归走 Value，避免先反序列化到强类型结构体导致字段丢失。
    if let Some(obj) = v.as_object() {
        let mut out = sonic_rs::Object::new();
        for (key, child) in obj.iter() {
            let sanitized = match key {
                "inlineData" | "inline_data" => sanitize_json_for_log(child, true),
                "data" if in_inline_data => truncate_base64_value(child),
                "image_data" => truncate_base64_value(child),
                _ => sanitize_json_for_log(child, in_inline_data),
            };
            out.insert(key, sanitized);
        }
        return out.into_value();
    }

    if let Some(arr) = v.as_array() {
        let mut out = Vec::with_capacity(arr.len());
        for item in arr {
            out.push(sanitize_json_for_log(item, in_inline_data));
        }
        return sonic_rs::Value::from(out);
    }

    v.to_owned()
}

fn truncate_base64_value(v: &sonic_rs::Value) -> sonic_rs::Value {
    use sonic_rs::JsonValueTrait;

    const KEEP: usize = 20;
    let Some(s) = v.as_str() else {
        return v.to_owned();
    };
    if s.len() <= KEEP * 2 + 100 {
        return v.to_owned();
    }
    let omitted = s.len() - KEEP * 2;
    let out = format!(
        "{}...[TRUNCATED: {omitted} chars]...{}",
        &s[..KEEP],
        &s[s.len() - KEEP..]
    );
    sonic_rs::Value::from(out.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_maps_known_levels() {
        assert_eq!(LogLevel::parse("off"), LogLevel::Off);
        assert_eq!(LogLevel::parse("LOW"), LogLevel::Low);
        assert_eq!(LogLevel::parse("backend"), LogLevel::Medium);
        assert_eq!(LogLevel::parse("unknown"), LogLevel::Off);
        assert!(LogLevel::High.backend_enabled());
        assert!(!LogLevel::Low.backend_enabled());
    }

    #[test]
    fn redact_key_query_masks_only_the_value() {
        assert_eq!(
            redact_key_query("https://h/v1beta/models/m:generateContent?key=abc123"),
            "https://h/v1beta/models/m:generateContent?key=***"
        );
        assert_eq!(
            redact_key_query("https://h/x?a=1&key=abc&b=2"),
            "https://h/x?a=1&key=***&b=2"
        );
        assert_eq!(redact_key_query("https://h/monkey=no"), "https://h/monkey=no");
    }

    #[test]
    fn long_inline_data_is_truncated() {
        use sonic_rs::{JsonContainerTrait, JsonValueTrait};

        let big = "A".repeat(500);
        let body = format!(r#"{{"inlineData":{{"mimeType":"image/png","data":"{big}"}}}}"#);
        let v: sonic_rs::Value = sonic_rs::from_str(&body).unwrap();
        let out = sanitize_json_for_log(&v, false);
        let data = out
            .as_object()
            .and_then(|o| o.get(&"inlineData"))
            .and_then(|i| i.as_object())
            .and_then(|o| o.get(&"data"))
            .and_then(|d| d.as_str())
            .unwrap()
            .to_string();
        assert!(data.contains("TRUNCATED"));
        assert!(data.len() < 100);
    }
}
