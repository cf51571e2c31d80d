//! 订阅档位到模型的路由表。纯查表，无失败分支。

use crate::config::Config;

/// 订阅档位。请求体里以字符串携带，未知值一律按 free 处理。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
}

impl PlanTier {
    pub fn parse(v: &str) -> Self {
        match v.trim().to_lowercase().as_str() {
            "pro" | "premium" => Self::Pro,
            _ => Self::Free,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
        }
    }
}

/// 一个档位对应的主模型与备选模型。
#[derive(Debug, Clone)]
pub struct ModelSelection {
    pub primary: String,
    pub fallback: String,
}

#[derive(Debug, Clone)]
pub struct ModelTable {
    free: ModelSelection,
    pro: ModelSelection,
}

impl ModelTable {
    pub fn new(free: ModelSelection, pro: ModelSelection) -> Self {
        Self { free, pro }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            ModelSelection {
                primary: cfg.model_free_primary.clone(),
                fallback: cfg.model_free_fallback.clone(),
            },
            ModelSelection {
                primary: cfg.model_pro_primary.clone(),
                fallback: cfg.model_pro_fallback.clone(),
            },
        )
    }

    pub fn route(&self, tier: PlanTier) -> &ModelSelection {
        match tier {
            PlanTier::Free => &self.free,
            PlanTier::Pro => &self.pro,
        }
    }
}
