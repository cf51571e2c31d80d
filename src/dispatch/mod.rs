//! 派发层：一次逻辑生成请求的完整编排。
//!
//! 选模型（按档位）→ 选 Key（轮换游标）→ 调用（带时限竞速）→
//! 失败分类（限流换 Key；主模型整轮耗尽换备选模型；网络错误原地
//! 重试一次；超时与坏响应直接终止）→ 成功后记账。

mod dispatcher;
mod retry;

pub use dispatcher::{DispatchRequest, Dispatcher, DispatchOutcome, GenerateBackend};
pub use retry::{is_network_error, should_rotate_key};
