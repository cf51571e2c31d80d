use crate::error::AppError;
use crate::keypool::types::ApiKey;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct KeyPool {
    state: RwLock<State>,
    // Key 数量启动后不变，放在锁外供循环边界使用。
    total: usize,
}

#[derive(Debug, Default)]
struct State {
    keys: Vec<ApiKey>,
    cursor: usize,
}

/// 池状态快照（观测接口用）。
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub total_keys: usize,
    pub current_index: usize,
    pub keys: Vec<KeyUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyUsage {
    pub id: String,
    pub position: usize,
    pub usage_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl KeyPool {
    pub fn new(secrets: &[String]) -> Self {
        let keys: Vec<ApiKey> = secrets
            .iter()
            .enumerate()
            .map(|(i, s)| ApiKey::new(i, s))
            .collect();
        let total = keys.len();
        Self {
            state: RwLock::new(State { keys, cursor: 0 }),
            total,
        }
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// 返回游标指向的 Key，并盖上 last_used 时间戳。
    pub async fn current(&self) -> Result<ApiKey, AppError> {
        let mut state = self.state.write().await;
        if state.keys.is_empty() {
            return Err(AppError::PoolExhausted);
        }
        let idx = state.cursor % state.keys.len();
        state.keys[idx].last_used = Some(Utc::now());
        Ok(state.keys[idx].clone())
    }

    /// 游标后移一位（环形）。每次调用恰好前进一格：连续 N 次之后回到起点，
    /// 这也是备选模型一轮从头开始尝试的来源。
    pub async fn advance(&self) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        let len = state.keys.len();
        if len == 0 {
            return Err(AppError::PoolExhausted);
        }
        state.cursor = (state.cursor + 1) % len;
        Ok(())
    }

    /// 把本次消耗计到当前 Key 上。
    pub async fn record_usage(&self, tokens: u64) -> Result<(), AppError> {
        let mut state = self.state.write().await;
        if state.keys.is_empty() {
            return Err(AppError::PoolExhausted);
        }
        let idx = state.cursor % state.keys.len();
        state.keys[idx].usage_tokens = state.keys[idx].usage_tokens.saturating_add(tokens);
        Ok(())
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.read().await;
        PoolStatus {
            total_keys: state.keys.len(),
            current_index: if state.keys.is_empty() {
                0
            } else {
                state.cursor % state.keys.len()
            },
            keys: state
                .keys
                .iter()
                .map(|k| KeyUsage {
                    id: k.id.clone(),
                    position: k.position,
                    usage_tokens: k.usage_tokens,
                    last_used: k.last_used,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: usize) -> KeyPool {
        let secrets: Vec<String> = (0..n).map(|i| format!("secret-{i}")).collect();
        KeyPool::new(&secrets)
    }

    #[tokio::test]
    async fn empty_pool_fails_every_operation() {
        let p = pool(0);
        assert!(matches!(p.current().await, Err(AppError::PoolExhausted)));
        assert!(matches!(p.advance().await, Err(AppError::PoolExhausted)));
        assert!(matches!(
            p.record_usage(1).await,
            Err(AppError::PoolExhausted)
        ));
        assert_eq!(p.status().await.total_keys, 0);
    }

    #[tokio::test]
    async fn advance_moves_exactly_one_step_and_wraps() {
        let p = pool(3);
        assert_eq!(p.current().await.unwrap().id, "key-1");
        p.advance().await.unwrap();
        assert_eq!(p.current().await.unwrap().id, "key-2");
        p.advance().await.unwrap();
        p.advance().await.unwrap();
        // 走满一圈回到起点。
        assert_eq!(p.current().await.unwrap().id, "key-1");
    }

    #[tokio::test]
    async fn usage_lands_on_the_cursor_key() {
        let p = pool(2);
        p.record_usage(100).await.unwrap();
        p.advance().await.unwrap();
        p.record_usage(30).await.unwrap();
        p.record_usage(7).await.unwrap();

        let status = p.status().await;
        assert_eq!(status.keys[0].usage_tokens, 100);
        assert_eq!(status.keys[1].usage_tokens, 37);
        assert_eq!(status.current_index, 1);
    }

    #[tokio::test]
    async fn current_stamps_last_used() {
        let p = pool(1);
        assert!(p.status().await.keys[0].last_used.is_none());
        p.current().await.unwrap();
        assert!(p.status().await.keys[0].last_used.is_some());
    }
}
