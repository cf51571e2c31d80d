//! API Key 池。
//!
//! 密钥来自环境变量（有序列表），只存在于进程内存，重启后计数清零。
//! 轮换游标是进程级共享状态：并发请求之间允许竞争（最多造成轮换
//! 公平性和归因的轻微偏差），锁只保证内存安全。

mod manager;
mod types;

pub use manager::{KeyPool, PoolStatus};
pub use types::ApiKey;
