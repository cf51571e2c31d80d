use chrono::{DateTime, Utc};

/// 池中的一把 API Key。
#[derive(Debug, Clone)]
pub struct ApiKey {
    /// 稳定标识（key-1、key-2 ...），日志和状态接口用它，不暴露密钥本身。
    pub id: String,
    /// 密钥明文，仅用于向上游发请求。
    pub secret: String,
    /// 在轮换序列中的位置（按加载顺序）。
    pub position: usize,
    /// 该 Key 承载过的 token 总量。
    pub usage_tokens: u64,
    /// 最近一次被选中的时间。
    pub last_used: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn new(position: usize, secret: impl Into<String>) -> Self {
        Self {
            id: format!("key-{}", position + 1),
            secret: secret.into(),
            position,
            usage_tokens: 0,
            last_used: None,
        }
    }
}
