use figment::Figment;
use figment::providers::Env;
use serde::Deserialize;
use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8090;
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const DEFAULT_MODEL_FREE_PRIMARY: &str = "gemini-2.0-flash";
const DEFAULT_MODEL_FREE_FALLBACK: &str = "gemini-2.0-flash-lite";
const DEFAULT_MODEL_PRO_PRIMARY: &str = "gemini-2.5-pro";
const DEFAULT_MODEL_PRO_FALLBACK: &str = "gemini-2.0-flash";

const DEFAULT_FREE_TOKEN_QUOTA: u64 = 50_000;
const DEFAULT_PRO_TOKEN_QUOTA: u64 = 2_000_000;

// 普通生成 120s；学习指南内容更长，给 180s。
const DEFAULT_TIMEOUT_QUIZ_MS: u64 = 120_000;
const DEFAULT_TIMEOUT_GUIDE_MS: u64 = 180_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub gemini_api_keys: Vec<String>,
    pub gemini_base_url: String,
    pub proxy: String,

    pub model_free_primary: String,
    pub model_free_fallback: String,
    pub model_pro_primary: String,
    pub model_pro_fallback: String,

    pub free_token_quota: u64,
    pub pro_token_quota: u64,

    pub timeout_quiz_ms: u64,
    pub timeout_guide_ms: u64,

    pub usage_store_url: String,
    /// 配额存储不可达时是否放行请求（fail-open）。关闭后改为拒绝（fail-closed）。
    pub quota_fail_open: bool,
    /// 用量提交失败后的额外重试次数。
    pub usage_commit_retries: u32,

    pub debug: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "GEMINI_API_KEYS")]
    gemini_api_keys: Option<String>,
    #[serde(alias = "GEMINI_BASE_URL")]
    gemini_base_url: Option<String>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "MODEL_FREE_PRIMARY")]
    model_free_primary: Option<String>,
    #[serde(alias = "MODEL_FREE_FALLBACK")]
    model_free_fallback: Option<String>,
    #[serde(alias = "MODEL_PRO_PRIMARY")]
    model_pro_primary: Option<String>,
    #[serde(alias = "MODEL_PRO_FALLBACK")]
    model_pro_fallback: Option<String>,

    #[serde(alias = "FREE_TOKEN_QUOTA")]
    free_token_quota: Option<u64>,
    #[serde(alias = "PRO_TOKEN_QUOTA")]
    pro_token_quota: Option<u64>,

    #[serde(alias = "TIMEOUT_QUIZ_MS")]
    timeout_quiz_ms: Option<u64>,
    #[serde(alias = "TIMEOUT_GUIDE_MS")]
    timeout_guide_ms: Option<u64>,

    #[serde(alias = "USAGE_STORE_URL")]
    usage_store_url: Option<String>,
    #[serde(alias = "QUOTA_FAIL_OPEN")]
    quota_fail_open: Option<bool>,
    #[serde(alias = "USAGE_COMMIT_RETRIES")]
    usage_commit_retries: Option<u32>,

    #[serde(alias = "DEBUG")]
    debug: Option<String>,
}

impl Config {
    pub fn load() -> Self {
        load_dotenv();

        let raw = Figment::from(Env::raw())
            .extract::<RawEnv>()
            .unwrap_or_default();

        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            gemini_api_keys: parse_key_list(raw.gemini_api_keys.as_deref()),
            gemini_base_url: raw
                .gemini_base_url
                .unwrap_or_else(|| DEFAULT_GEMINI_BASE_URL.to_string()),
            proxy: raw.proxy.unwrap_or_default(),
            model_free_primary: raw
                .model_free_primary
                .unwrap_or_else(|| DEFAULT_MODEL_FREE_PRIMARY.to_string()),
            model_free_fallback: raw
                .model_free_fallback
                .unwrap_or_else(|| DEFAULT_MODEL_FREE_FALLBACK.to_string()),
            model_pro_primary: raw
                .model_pro_primary
                .unwrap_or_else(|| DEFAULT_MODEL_PRO_PRIMARY.to_string()),
            model_pro_fallback: raw
                .model_pro_fallback
                .unwrap_or_else(|| DEFAULT_MODEL_PRO_FALLBACK.to_string()),
            free_token_quota: raw.free_token_quota.unwrap_or(DEFAULT_FREE_TOKEN_QUOTA),
            pro_token_quota: raw.pro_token_quota.unwrap_or(DEFAULT_PRO_TOKEN_QUOTA),
            timeout_quiz_ms: raw.timeout_quiz_ms.unwrap_or(DEFAULT_TIMEOUT_QUIZ_MS),
            timeout_guide_ms: raw.timeout_guide_ms.unwrap_or(DEFAULT_TIMEOUT_GUIDE_MS),
            usage_store_url: raw.usage_store_url.unwrap_or_default(),
            quota_fail_open: raw.quota_fail_open.unwrap_or(true),
            usage_commit_retries: raw.usage_commit_retries.unwrap_or(1),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
        }
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

/// 解析逗号分隔的 API Key 列表，保序、去空白、跳过空项。
fn parse_key_list(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

fn load_dotenv() {
    let Some(dotenv_path) = find_dotenv_path() else {
        return;
    };

    let Ok(file) = std::fs::File::open(&dotenv_path) else {
        return;
    };

    let reader = std::io::BufReader::new(file);
    for line in std::io::BufRead::lines(reader).map_while(Result::ok) {
        let Some((key, value)) = parse_dotenv_line(&line) else {
            continue;
        };
        // Rust 2024：修改进程环境变量在并发场景下可能触发 UB，因此 API 为 unsafe。
        // 这里在启动阶段加载 .env，且未并发访问环境变量，符合使用前提。
        unsafe {
            std::env::set_var(key, value);
        }
    }
}

fn find_dotenv_path() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    let mut dir: &Path = cwd.as_path();

    loop {
        let candidate = dir.join(".env");
        if candidate.is_file() {
            return Some(candidate);
        }

        // 避免跨越仓库根目录：发现 Cargo.toml 或 .git 即停止向上寻找。
        if dir.join("Cargo.toml").is_file() || dir.join(".git").is_dir() {
            return None;
        }

        let Some(parent) = dir.parent() else {
            break;
        };
        if parent == dir {
            break;
        }
        dir = parent;
    }

    None
}

fn parse_dotenv_line(line: &str) -> Option<(String, String)> {
    let mut line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if let Some(rest) = line.strip_prefix("export ") {
        line = rest.trim_start();
    }

    let eq_idx = line.find('=')?;
    if eq_idx == 0 {
        return None;
    }

    let key = line[..eq_idx].trim();
    if key.is_empty() {
        return None;
    }

    let mut raw = line[eq_idx + 1..].trim();
    if raw.is_empty() {
        return Some((key.to_string(), String::new()));
    }

    let bytes = raw.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            raw = &raw[1..raw.len() - 1];
            return Some((key.to_string(), raw.to_string()));
        }
    }

    raw = strip_inline_comment(raw);
    Some((key.to_string(), raw.trim().to_string()))
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for i in 0..bytes.len() {
        if bytes[i] != b'#' {
            continue;
        }
        if i == 0 || bytes[i - 1] == b' ' || bytes[i - 1] == b'\t' {
            return value[..i].trim_end();
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_key_list_keeps_order_and_skips_blanks() {
        let keys = parse_key_list(Some(" k1, k2 ,, k3 "));
        assert_eq!(keys, vec!["k1", "k2", "k3"]);
        assert!(parse_key_list(None).is_empty());
        assert!(parse_key_list(Some("  ,  ")).is_empty());
    }

    #[test]
    fn parse_dotenv_line_handles_quotes_and_comments() {
        assert_eq!(
            parse_dotenv_line("GEMINI_API_KEYS=\"a,b\""),
            Some(("GEMINI_API_KEYS".to_string(), "a,b".to_string()))
        );
        assert_eq!(
            parse_dotenv_line("PORT=8090 # 本地端口"),
            Some(("PORT".to_string(), "8090".to_string()))
        );
        assert_eq!(parse_dotenv_line("# 注释"), None);
        assert_eq!(parse_dotenv_line("=bad"), None);
    }
}
