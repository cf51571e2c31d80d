//! 用量追踪：按用户记 token 消耗，并在派发前做配额预检。
//!
//! 用量记录持久化在外部文档存储里（按用户 ID 键控），生命周期跟随
//! 账期，由外部重置；本模块只读写，不负责归零。

pub mod store;
pub mod tracker;

pub use store::{HttpUsageStore, MemoryUsageStore, UsageRecord, UsageStore, build_store};
pub use tracker::{UsageTracker, estimate_cost};
