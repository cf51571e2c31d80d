//! 上游模型服务（generateContent 协议）的类型与 HTTP 客户端。

pub mod client;
pub mod types;
