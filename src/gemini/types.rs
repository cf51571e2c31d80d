use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<SystemInstruction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

impl GenerateRequest {
    /// 单轮纯文本请求。
    pub fn from_text(prompt: impl Into<String>) -> Self {
        Self {
            contents: vec![Content::user_text(prompt)],
            system_instruction: None,
            generation_config: None,
        }
    }

    /// 要求模型输出 JSON（结构化流程用）。
    pub fn json_mode(mut self) -> Self {
        let cfg = self.generation_config.get_or_insert_with(Default::default);
        cfg.response_mime_type = "application/json".to_string();
        self
    }

    /// 拼出全部输入文本（配额预检的估算依据）。
    pub fn prompt_text(&self) -> String {
        let mut out = String::new();
        if let Some(si) = &self.system_instruction {
            for p in &si.parts {
                out.push_str(&p.text);
            }
        }
        for c in &self.contents {
            for p in &c.parts {
                out.push_str(&p.text);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            parts: vec![Part {
                text: text.into(),
                inline_data: None,
            }],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: "model".to_string(),
            parts: vec![Part {
                text: text.into(),
                inline_data: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
}

/// 内嵌媒体（base64 字符串原样承载，不做解码）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInstruction {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "is_zero_i32", default)]
    pub max_output_tokens: i32,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub response_mime_type: String,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}

impl GenerateResponse {
    /// 首个候选的全部文本片段，拼接后返回；没有可用文本时为 None。
    pub fn primary_text(&self) -> Option<String> {
        let cand = self.candidates.first()?;
        let mut out = String::new();
        for p in &cand.content.parts {
            out.push_str(&p.text);
        }
        if out.trim().is_empty() { None } else { Some(out) }
    }

    /// 上游报告的 token 总量（>0 才视为有效）。
    pub fn reported_tokens(&self) -> Option<u64> {
        let usage = self.usage_metadata.as_ref()?;
        if usage.total_token_count > 0 {
            Some(usage.total_token_count as u64)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub content: Content,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub finish_reason: String,
    #[serde(default)]
    pub index: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: i32,
    #[serde(default)]
    pub candidates_token_count: i32,
    #[serde(default)]
    pub total_token_count: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_text_joins_parts_and_rejects_blank() {
        let resp: GenerateResponse = sonic_rs::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"前半"},{"text":"后半"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(resp.primary_text().as_deref(), Some("前半后半"));

        let empty: GenerateResponse = sonic_rs::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"  "}]}}]}"#,
        )
        .unwrap();
        assert!(empty.primary_text().is_none());

        let none: GenerateResponse = sonic_rs::from_str(r#"{"candidates":[]}"#).unwrap();
        assert!(none.primary_text().is_none());
    }

    #[test]
    fn reported_tokens_requires_positive_total() {
        let resp: GenerateResponse = sonic_rs::from_str(
            r#"{"candidates":[],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":20,"totalTokenCount":30}}"#,
        )
        .unwrap();
        assert_eq!(resp.reported_tokens(), Some(30));

        let zero: GenerateResponse =
            sonic_rs::from_str(r#"{"candidates":[],"usageMetadata":{"totalTokenCount":0}}"#)
                .unwrap();
        assert_eq!(zero.reported_tokens(), None);
    }

    #[test]
    fn json_mode_sets_response_mime_type() {
        let req = GenerateRequest::from_text("hi").json_mode();
        assert_eq!(
            req.generation_config.unwrap().response_mime_type,
            "application/json"
        );
    }
}
