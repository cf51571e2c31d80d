use crate::config::Config;
use crate::models::PlanTier;
use crate::usage::store::UsageStore;
use std::sync::Arc;

/// 长度启发式估算 token：约 4 个字符 1 token，向上取整。
/// 在上游未报告精确计数时使用；对空串返回 0，且随长度单调不减。
pub fn estimate_cost(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[derive(Clone)]
pub struct UsageTracker {
    store: Arc<dyn UsageStore>,
    fail_open: bool,
    commit_retries: u32,
    free_quota: u64,
    pro_quota: u64,
}

impl UsageTracker {
    pub fn new(cfg: &Config, store: Arc<dyn UsageStore>) -> Self {
        Self::with_policy(
            store,
            cfg.quota_fail_open,
            cfg.usage_commit_retries,
            cfg.free_token_quota,
            cfg.pro_token_quota,
        )
    }

    pub fn with_policy(
        store: Arc<dyn UsageStore>,
        fail_open: bool,
        commit_retries: u32,
        free_quota: u64,
        pro_quota: u64,
    ) -> Self {
        Self {
            store,
            fail_open,
            commit_retries,
            free_quota,
            pro_quota,
        }
    }

    fn quota_for(&self, plan: PlanTier) -> u64 {
        match plan {
            PlanTier::Free => self.free_quota,
            PlanTier::Pro => self.pro_quota,
        }
    }

    /// 派发前的配额预检。
    ///
    /// 存储不可达时按 QUOTA_FAIL_OPEN 决定放行还是拒绝：默认放行——
    /// 付费产品在基础设施抖动时拒绝所有请求，比短暂超额更伤。
    /// 每次失败恰好记一条 warn。
    pub async fn check_quota(&self, user_id: &str, plan: PlanTier, estimated: u64) -> bool {
        match self.store.fetch(user_id).await {
            Ok(record) => {
                let (used, limit) = match record {
                    Some(r) => {
                        let limit = if r.quota_limit > 0 {
                            r.quota_limit
                        } else {
                            self.quota_for(plan)
                        };
                        (r.cumulative_tokens, limit)
                    }
                    None => (0, self.quota_for(plan)),
                };
                used.saturating_add(estimated) <= limit
            }
            Err(e) => {
                if self.fail_open {
                    tracing::warn!(
                        "配额检查失败，按 fail-open 放行: user={user_id} plan={} err={e:#}",
                        plan.as_str()
                    );
                    true
                } else {
                    tracing::warn!(
                        "配额检查失败，按 fail-closed 拒绝: user={user_id} plan={} err={e:#}",
                        plan.as_str()
                    );
                    false
                }
            }
        }
    }

    /// 成功响应后的用量提交。瞬时失败按配置重试；重试仍失败只记日志，
    /// 不回滚也不上抛——结果已经发给用户，少计好过打断体验。
    pub async fn commit_usage(&self, user_id: &str, tokens: u64) {
        let mut attempt: u32 = 0;
        loop {
            match self.store.commit(user_id, tokens).await {
                Ok(()) => return,
                Err(e) => {
                    if attempt >= self.commit_retries {
                        tracing::warn!(
                            "用量提交失败（放弃）: user={user_id} tokens={tokens} err={e:#}"
                        );
                        return;
                    }
                    attempt += 1;
                    tracing::debug!("用量提交失败，第 {attempt} 次重试: user={user_id} err={e:#}");
                }
            }
        }
    }
}
