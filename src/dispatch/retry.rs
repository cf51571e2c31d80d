use crate::gemini::client::ApiError;

/// 限流/配额/上游故障类错误：换下一把 Key 再试。
/// 401/403 一并轮换——坏掉的 Key 不会自己恢复，换一把是唯一出路。
pub fn should_rotate_key(err: &ApiError) -> bool {
    matches!(err.status(), Some(401 | 403 | 429 | 500..=599))
}

/// 传输层失败（连接被拒、DNS、中途断开等）。
pub fn is_network_error(err: &ApiError) -> bool {
    matches!(err, ApiError::Transport(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ApiError {
        ApiError::Http {
            status,
            message: "x".to_string(),
        }
    }

    #[test]
    fn rotate_on_quota_and_upstream_failures() {
        assert!(should_rotate_key(&http(429)));
        assert!(should_rotate_key(&http(403)));
        assert!(should_rotate_key(&http(401)));
        assert!(should_rotate_key(&http(500)));
        assert!(should_rotate_key(&http(503)));
        assert!(!should_rotate_key(&http(400)));
        assert!(!should_rotate_key(&http(404)));
    }

    #[test]
    fn json_errors_are_not_network_errors() {
        let err = ApiError::Json(sonic_rs::from_str::<sonic_rs::Value>("{oops").unwrap_err());
        assert!(!is_network_error(&err));
        assert!(!should_rotate_key(&err));
    }
}
