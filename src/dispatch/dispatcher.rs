use crate::dispatch::retry::{is_network_error, should_rotate_key};
use crate::error::AppError;
use crate::gemini::client::{ApiError, GeminiClient};
use crate::gemini::types::{GenerateRequest, GenerateResponse};
use crate::keypool::{ApiKey, KeyPool};
use crate::models::{ModelTable, PlanTier};
use crate::usage::{UsageTracker, estimate_cost};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// 上游生成调用的接缝：正式实现是 GeminiClient，测试里换成脚本替身。
#[async_trait]
pub trait GenerateBackend: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        secret: &str,
        req: &GenerateRequest,
    ) -> Result<GenerateResponse, ApiError>;
}

#[async_trait]
impl GenerateBackend for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        secret: &str,
        req: &GenerateRequest,
    ) -> Result<GenerateResponse, ApiError> {
        self.generate_content(model, secret, req).await
    }
}

/// 一次逻辑生成请求。
pub struct DispatchRequest {
    pub request_id: String,
    pub user_id: String,
    pub plan: PlanTier,
    pub payload: GenerateRequest,
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct DispatchOutcome {
    pub text: String,
    pub model: String,
    pub key_id: String,
    pub attempts: u32,
    pub tokens_charged: u64,
}

/// 单次尝试的裁决。
enum AttemptVerdict {
    Success(GenerateResponse),
    /// 限流类失败，由外层 advance 后继续；network 标记失败是否为传输层。
    Rotate { network: bool },
    /// 终止整个派发。
    Fatal(AppError),
}

#[derive(Clone)]
pub struct Dispatcher {
    backend: Arc<dyn GenerateBackend>,
    pool: Arc<KeyPool>,
    models: ModelTable,
    tracker: UsageTracker,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn GenerateBackend>,
        pool: Arc<KeyPool>,
        models: ModelTable,
        tracker: UsageTracker,
    ) -> Self {
        Self {
            backend,
            pool,
            models,
            tracker,
        }
    }

    /// 派发一次生成请求：主模型一整圈 Key，再换备选模型一整圈。
    /// 总尝试数以 Key 数 × 2 个模型为上界（网络类的原地重试不计入）。
    pub async fn dispatch(&self, req: DispatchRequest) -> Result<DispatchOutcome, AppError> {
        if self.pool.is_empty() {
            return Err(AppError::PoolExhausted);
        }

        // 输出长度在调用前不可知，用输入文本做确定性的预检估算。
        let estimated = estimate_cost(&req.payload.prompt_text());
        if !self
            .tracker
            .check_quota(&req.user_id, req.plan, estimated)
            .await
        {
            return Err(AppError::quota_exceeded(
                "本期可用额度已用完，请升级套餐或等待额度重置后再试",
            ));
        }

        let selection = self.models.route(req.plan).clone();
        let mut attempts: u32 = 0;
        let mut saw_rate_limit = false;
        let mut saw_network = false;

        for model in [selection.primary.as_str(), selection.fallback.as_str()] {
            // advance 走满一圈后游标回到本圈起点，备选模型因此从同一把 Key 重新开始。
            for _ in 0..self.pool.len() {
                let key = self.pool.current().await?;
                attempts += 1;

                match self.attempt_once(model, &key, &req, attempts).await {
                    AttemptVerdict::Success(resp) => {
                        return self.finish(&req, model, &key, attempts, resp).await;
                    }
                    AttemptVerdict::Rotate { network } => {
                        if network {
                            saw_network = true;
                        } else {
                            saw_rate_limit = true;
                        }
                        self.pool.advance().await?;
                    }
                    AttemptVerdict::Fatal(e) => return Err(e),
                }
            }
            tracing::info!(
                "模型在全部 Key 上均未成功: request={} model={model} keys={}",
                req.request_id,
                self.pool.len()
            );
        }

        // 整轮只见到传输层失败时，引导用户去查网络而不是等配额。
        if saw_network && !saw_rate_limit {
            return Err(AppError::Network);
        }
        Err(AppError::quota_exceeded(
            "生成通道暂时全部繁忙，请稍后再试",
        ))
    }

    async fn attempt_once(
        &self,
        model: &str,
        key: &ApiKey,
        req: &DispatchRequest,
        attempt: u32,
    ) -> AttemptVerdict {
        match self.call_once(model, key, req).await {
            Ok(resp) => AttemptVerdict::Success(resp),
            Err(None) => self.on_timeout(model, key, req, attempt),
            Err(Some(e)) if is_network_error(&e) => {
                // 网络类失败：同一把 Key 原地重试一次，仍失败则按限流类换 Key。
                tracing::debug!(
                    "网络错误，原地重试: request={} model={model} key={} err={e}",
                    req.request_id,
                    key.id
                );
                match self.call_once(model, key, req).await {
                    Ok(resp) => AttemptVerdict::Success(resp),
                    Err(None) => self.on_timeout(model, key, req, attempt),
                    Err(Some(e2)) if is_network_error(&e2) || should_rotate_key(&e2) => {
                        tracing::warn!(
                            "尝试失败: request={} model={model} key={} attempt={attempt} outcome=network_error err={e2}",
                            req.request_id,
                            key.id
                        );
                        AttemptVerdict::Rotate {
                            network: is_network_error(&e2),
                        }
                    }
                    Err(Some(e2)) => self.on_invalid(model, key, req, attempt, &e2),
                }
            }
            Err(Some(e)) if should_rotate_key(&e) => {
                tracing::warn!(
                    "尝试失败: request={} model={model} key={} attempt={attempt} outcome=rate_limited err={e}",
                    req.request_id,
                    key.id
                );
                AttemptVerdict::Rotate { network: false }
            }
            Err(Some(e)) => self.on_invalid(model, key, req, attempt, &e),
        }
    }

    /// Err(None) 表示计时器赢了；在途调用直接丢弃，不向上游传播取消。
    async fn call_once(
        &self,
        model: &str,
        key: &ApiKey,
        req: &DispatchRequest,
    ) -> Result<GenerateResponse, Option<ApiError>> {
        match tokio::time::timeout(
            req.timeout,
            self.backend.generate(model, &key.secret, &req.payload),
        )
        .await
        {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(Some(e)),
            Err(_elapsed) => Err(None),
        }
    }

    fn on_timeout(
        &self,
        model: &str,
        key: &ApiKey,
        req: &DispatchRequest,
        attempt: u32,
    ) -> AttemptVerdict {
        // 用户已经等满了时限，不再轮换重试。
        tracing::warn!(
            "尝试失败: request={} model={model} key={} attempt={attempt} outcome=timeout timeout={}ms",
            req.request_id,
            key.id,
            req.timeout.as_millis()
        );
        AttemptVerdict::Fatal(AppError::Timeout)
    }

    fn on_invalid(
        &self,
        model: &str,
        key: &ApiKey,
        req: &DispatchRequest,
        attempt: u32,
        err: &ApiError,
    ) -> AttemptVerdict {
        // 4xx 业务错误 / 响应解析失败：同样的输入重试结果不会变。
        tracing::warn!(
            "尝试失败: request={} model={model} key={} attempt={attempt} outcome=invalid_response err={err}",
            req.request_id,
            key.id
        );
        AttemptVerdict::Fatal(AppError::InvalidResponse)
    }

    async fn finish(
        &self,
        req: &DispatchRequest,
        model: &str,
        key: &ApiKey,
        attempts: u32,
        resp: GenerateResponse,
    ) -> Result<DispatchOutcome, AppError> {
        let Some(text) = resp.primary_text() else {
            tracing::warn!(
                "上游返回空内容: request={} model={model} key={}",
                req.request_id,
                key.id
            );
            return Err(AppError::InvalidResponse);
        };

        // 优先上游报告的精确计数，缺失时退回长度估算。
        let tokens = resp
            .reported_tokens()
            .unwrap_or_else(|| estimate_cost(&text));

        if let Err(e) = self.pool.record_usage(tokens).await {
            tracing::warn!("记录 Key 用量失败: {e}");
        }
        // 提交失败只在 tracker 内部记日志：响应已经产生，不回滚。
        self.tracker.commit_usage(&req.user_id, tokens).await;

        let outcome = DispatchOutcome {
            text,
            model: model.to_string(),
            key_id: key.id.clone(),
            attempts,
            tokens_charged: tokens,
        };
        tracing::info!(
            "派发成功: request={} model={} key={} attempts={} tokens={}",
            req.request_id,
            outcome.model,
            outcome.key_id,
            outcome.attempts,
            outcome.tokens_charged
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::types::{Candidate, Content, UsageMetadata};
    use crate::models::ModelSelection;
    use crate::usage::store::{MemoryUsageStore, UsageStore};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    enum Step {
        Text(&'static str),
        TextWithUsage(&'static str, i32),
        Http(u16),
        Net,
        SleepMs(u64),
        Empty,
    }

    struct ScriptedBackend {
        steps: Mutex<VecDeque<Step>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedBackend {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn text_response(text: &str, usage: Option<i32>) -> GenerateResponse {
        GenerateResponse {
            candidates: vec![Candidate {
                content: Content::model_text(text),
                finish_reason: "STOP".to_string(),
                index: 0,
            }],
            usage_metadata: usage.map(|total| UsageMetadata {
                prompt_token_count: 0,
                candidates_token_count: 0,
                total_token_count: total,
            }),
        }
    }

    #[async_trait]
    impl GenerateBackend for ScriptedBackend {
        async fn generate(
            &self,
            model: &str,
            secret: &str,
            _req: &GenerateRequest,
        ) -> Result<GenerateResponse, ApiError> {
            self.calls
                .lock()
                .unwrap()
                .push((model.to_string(), secret.to_string()));
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Step::Http(429));
            match step {
                Step::Text(t) => Ok(text_response(t, None)),
                Step::TextWithUsage(t, n) => Ok(text_response(t, Some(n))),
                Step::Http(status) => Err(ApiError::Http {
                    status,
                    message: "scripted".to_string(),
                }),
                Step::Net => Err(ApiError::Transport("连接被拒绝".to_string())),
                Step::SleepMs(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(text_response("late", None))
                }
                Step::Empty => Ok(GenerateResponse {
                    candidates: vec![],
                    usage_metadata: None,
                }),
            }
        }
    }

    struct Fixture {
        backend: Arc<ScriptedBackend>,
        store: Arc<MemoryUsageStore>,
        pool: Arc<KeyPool>,
        dispatcher: Dispatcher,
    }

    fn fixture(keys: usize, steps: Vec<Step>) -> Fixture {
        let backend = Arc::new(ScriptedBackend::new(steps));
        let store = Arc::new(MemoryUsageStore::new());
        let secrets: Vec<String> = (1..=keys).map(|i| format!("s{i}")).collect();
        let pool = Arc::new(KeyPool::new(&secrets));
        let tracker = UsageTracker::with_policy(store.clone(), true, 1, 1_000_000, 1_000_000);
        let models = ModelTable::new(
            ModelSelection {
                primary: "model-a".to_string(),
                fallback: "model-b".to_string(),
            },
            ModelSelection {
                primary: "model-pro".to_string(),
                fallback: "model-a".to_string(),
            },
        );
        let dispatcher = Dispatcher::new(backend.clone(), pool.clone(), models, tracker);
        Fixture {
            backend,
            store,
            pool,
            dispatcher,
        }
    }

    fn request(timeout_ms: u64) -> DispatchRequest {
        DispatchRequest {
            request_id: "gen-test".to_string(),
            user_id: "u1".to_string(),
            plan: PlanTier::Free,
            payload: GenerateRequest::from_text("出一套测验题"),
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn rate_limited_primary_falls_back_to_fallback_model() {
        // 2 把 Key 在主模型上都被 429，备选模型在第 1 把 Key 上成功。
        let f = fixture(2, vec![Step::Http(429), Step::Http(429), Step::Text("ok")]);

        let out = f.dispatcher.dispatch(request(5_000)).await.unwrap();
        assert_eq!(out.model, "model-b");
        assert_eq!(out.key_id, "key-1");
        assert_eq!(out.attempts, 3);

        let calls = f.backend.calls();
        assert_eq!(
            calls,
            vec![
                ("model-a".to_string(), "s1".to_string()),
                ("model-a".to_string(), "s2".to_string()),
                ("model-b".to_string(), "s1".to_string()),
            ]
        );

        // advance 恰好两次：游标走满一圈回到 key-1。
        assert_eq!(f.pool.status().await.current_index, 0);

        // 恰好一次 commit，金额等于输出文本的估算值。
        let record = f.store.fetch("u1").await.unwrap().unwrap();
        assert_eq!(record.cumulative_tokens, out.tokens_charged);
        assert_eq!(out.tokens_charged, estimate_cost("ok"));
    }

    #[tokio::test]
    async fn both_models_exhausted_is_quota_exceeded() {
        let f = fixture(2, vec![]);

        let err = f.dispatcher.dispatch(request(5_000)).await.unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
        // Key 数 × 2 个模型的上界。
        assert_eq!(f.backend.calls().len(), 4);
        assert!(f.store.fetch("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_keys_fails_without_any_backend_call() {
        let f = fixture(0, vec![Step::Text("unreachable")]);

        let err = f.dispatcher.dispatch(request(5_000)).await.unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted));
        assert!(f.backend.calls().is_empty());
    }

    #[tokio::test]
    async fn timeout_is_terminal_without_rotation() {
        let f = fixture(2, vec![Step::SleepMs(5_000)]);

        let err = f.dispatcher.dispatch(request(50)).await.unwrap_err();
        assert!(matches!(err, AppError::Timeout));
        assert_eq!(f.backend.calls().len(), 1);
        // 未发生轮换。
        assert_eq!(f.pool.status().await.current_index, 0);
        assert!(f.store.fetch("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn network_error_retries_in_place_then_rotates() {
        let f = fixture(2, vec![Step::Net, Step::Net, Step::Text("ok")]);

        let out = f.dispatcher.dispatch(request(5_000)).await.unwrap();
        assert_eq!(out.key_id, "key-2");
        // 原地重试不计入尝试数：两把 Key 各一次尝试。
        assert_eq!(out.attempts, 2);

        let calls = f.backend.calls();
        assert_eq!(
            calls,
            vec![
                ("model-a".to_string(), "s1".to_string()),
                ("model-a".to_string(), "s1".to_string()),
                ("model-a".to_string(), "s2".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn provider_reported_tokens_win_over_estimate() {
        let f = fixture(1, vec![Step::TextWithUsage("一段比较长的输出文本", 77)]);

        let out = f.dispatcher.dispatch(request(5_000)).await.unwrap();
        assert_eq!(out.tokens_charged, 77);

        let record = f.store.fetch("u1").await.unwrap().unwrap();
        assert_eq!(record.cumulative_tokens, 77);
        assert_eq!(f.pool.status().await.keys[0].usage_tokens, 77);
    }

    #[tokio::test]
    async fn empty_candidates_is_invalid_response_without_commit() {
        let f = fixture(1, vec![Step::Empty]);

        let err = f.dispatcher.dispatch(request(5_000)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidResponse));
        assert!(f.store.fetch("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_bad_request_is_terminal() {
        let f = fixture(2, vec![Step::Http(400)]);

        let err = f.dispatcher.dispatch(request(5_000)).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidResponse));
        assert_eq!(f.backend.calls().len(), 1);
    }

    #[tokio::test]
    async fn persistent_network_failure_surfaces_as_network_error() {
        // 1 把 Key × 2 个模型，每次尝试都含一次原地重试，全是传输层失败。
        let f = fixture(1, vec![Step::Net, Step::Net, Step::Net, Step::Net]);

        let err = f.dispatcher.dispatch(request(5_000)).await.unwrap_err();
        assert!(matches!(err, AppError::Network));
        assert_eq!(f.backend.calls().len(), 4);
        assert!(f.store.fetch("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn over_quota_user_is_rejected_before_any_call() {
        let backend = Arc::new(ScriptedBackend::new(vec![Step::Text("unreachable")]));
        let store = Arc::new(MemoryUsageStore::new());
        let pool = Arc::new(KeyPool::new(&["s1".to_string()]));
        // 免费额度只有 1 token，输入估算必然超出。
        let tracker = UsageTracker::with_policy(store, true, 1, 1, 1);
        let models = ModelTable::new(
            ModelSelection {
                primary: "model-a".to_string(),
                fallback: "model-b".to_string(),
            },
            ModelSelection {
                primary: "model-pro".to_string(),
                fallback: "model-a".to_string(),
            },
        );
        let dispatcher = Dispatcher::new(backend.clone(), pool, models, tracker);

        let mut req = request(5_000);
        req.payload = GenerateRequest::from_text("x".repeat(100));
        let err = dispatcher.dispatch(req).await.unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
        assert!(backend.calls().is_empty());
    }
}
