use crate::config::Config;
use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// 一个用户在当前账期内的用量记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    #[serde(default)]
    pub cumulative_tokens: u64,
    /// 0 表示记录未携带上限，由调用方按档位默认值兜底。
    #[serde(default)]
    pub quota_limit: u64,
    #[serde(default)]
    pub period_start: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn fetch(&self, user_id: &str) -> anyhow::Result<Option<UsageRecord>>;
    async fn commit(&self, user_id: &str, tokens: u64) -> anyhow::Result<()>;
}

/// 根据配置选择存储实现：配了 USAGE_STORE_URL 用外部文档存储，
/// 否则退化为进程内存（单机部署/本地调试）。
pub fn build_store(cfg: &Config) -> anyhow::Result<Arc<dyn UsageStore>> {
    let url = cfg.usage_store_url.trim();
    if url.is_empty() {
        tracing::info!("未配置 USAGE_STORE_URL，用量记录仅保存在进程内存");
        Ok(Arc::new(MemoryUsageStore::new()))
    } else {
        Ok(Arc::new(HttpUsageStore::new(url, &cfg.proxy)?))
    }
}

/// 外部文档存储的 HTTP 客户端。
/// 约定：GET /usage/{userId} 返回记录（404 表示尚无记录），
/// POST /usage/{userId}/commit 提交增量。
#[derive(Debug, Clone)]
pub struct HttpUsageStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUsageStore {
    pub fn new(base_url: &str, proxy: &str) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            // 配额检查在请求主路径上，不能让存储慢查询拖垮整个派发。
            .timeout(Duration::from_secs(10));

        if !proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(proxy.trim())?);
        }

        Ok(Self {
            http: builder.build().context("构建用量存储 HTTP 客户端失败")?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Serialize)]
struct CommitBody {
    tokens: u64,
}

#[async_trait]
impl UsageStore for HttpUsageStore {
    async fn fetch(&self, user_id: &str) -> anyhow::Result<Option<UsageRecord>> {
        let url = format!("{}/usage/{user_id}", self.base_url);
        let resp = self.http.get(&url).send().await.context("读取用量记录失败")?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(anyhow!("用量存储返回 {}", resp.status().as_u16()));
        }

        let bytes = resp.bytes().await.context("读取用量记录响应失败")?;
        let record: UsageRecord =
            sonic_rs::from_slice(&bytes).context("解析用量记录失败")?;
        Ok(Some(record))
    }

    async fn commit(&self, user_id: &str, tokens: u64) -> anyhow::Result<()> {
        let url = format!("{}/usage/{user_id}/commit", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&CommitBody { tokens })
            .send()
            .await
            .context("提交用量失败")?;

        if !resp.status().is_success() {
            return Err(anyhow!("用量存储返回 {}", resp.status().as_u16()));
        }
        Ok(())
    }
}

/// 进程内存实现：无外部存储时的部署模式，也是测试用的替身。
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    records: RwLock<HashMap<String, UsageRecord>>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn fetch(&self, user_id: &str) -> anyhow::Result<Option<UsageRecord>> {
        let records = self.records.read().await;
        Ok(records.get(user_id).cloned())
    }

    async fn commit(&self, user_id: &str, tokens: u64) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .entry(user_id.to_string())
            .or_insert_with(|| UsageRecord {
                user_id: user_id.to_string(),
                cumulative_tokens: 0,
                quota_limit: 0,
                period_start: Some(Utc::now()),
            });
        record.cumulative_tokens = record.cumulative_tokens.saturating_add(tokens);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_accumulates_per_user() {
        let store = MemoryUsageStore::new();
        assert!(store.fetch("u1").await.unwrap().is_none());

        store.commit("u1", 120).await.unwrap();
        store.commit("u1", 30).await.unwrap();
        store.commit("u2", 5).await.unwrap();

        let r1 = store.fetch("u1").await.unwrap().unwrap();
        assert_eq!(r1.cumulative_tokens, 150);
        assert!(r1.period_start.is_some());

        let r2 = store.fetch("u2").await.unwrap().unwrap();
        assert_eq!(r2.cumulative_tokens, 5);
    }
}
