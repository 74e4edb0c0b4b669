//! Wire types for the chat-completions gateway API.
//!
//! The gateway advertises models with string-encoded pricing and serves
//! completions in the OpenAI-compatible shape. These types stay private to
//! the infrastructure layer; the ports expose the domain shapes.

use serde::{Deserialize, Serialize};

use crate::domain::ports::model_gateway::{ChatMessage, ModelInfo, ModelPricing};

/// `GET /v1/models` envelope.
#[derive(Debug, Deserialize)]
pub struct ModelListResponse {
    pub data: Vec<WireModel>,
}

/// One catalog entry as served by the gateway.
#[derive(Debug, Deserialize)]
pub struct WireModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub context_length: u64,
    #[serde(default)]
    pub pricing: WirePricing,
    #[serde(default)]
    pub architecture: Option<WireArchitecture>,
    #[serde(default)]
    pub moderated: bool,
}

/// Pricing comes over the wire as decimal strings.
#[derive(Debug, Default, Deserialize)]
pub struct WirePricing {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub completion: String,
}

#[derive(Debug, Deserialize)]
pub struct WireArchitecture {
    #[serde(default)]
    pub input_modalities: Vec<String>,
    #[serde(default)]
    pub output_modalities: Vec<String>,
}

impl From<WireModel> for ModelInfo {
    fn from(wire: WireModel) -> Self {
        let capabilities = wire
            .architecture
            .map(|a| {
                a.input_modalities
                    .into_iter()
                    .chain(a.output_modalities)
                    .collect()
            })
            .unwrap_or_default();
        ModelInfo {
            id: wire.id,
            name: wire.name,
            context_length: wire.context_length,
            pricing: ModelPricing {
                prompt: wire.pricing.prompt.parse().unwrap_or(0.0),
                completion: wire.pricing.completion.parse().unwrap_or(0.0),
            },
            capabilities,
            moderated: wire.moderated,
        }
    }
}

/// `POST /v1/chat/completions` body.
#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
}

/// Non-streamed completion response.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub total_tokens: u64,
}

/// One streamed SSE data payload.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_model_conversion() {
        let wire: WireModel = serde_json::from_str(
            r#"{
                "id": "anthropic/claude-opus-4.6",
                "name": "Claude Opus",
                "context_length": 200000,
                "pricing": {"prompt": "0.000015", "completion": "0.000075"},
                "architecture": {"input_modalities": ["text", "image"], "output_modalities": ["text"]}
            }"#,
        )
        .unwrap();
        let model: ModelInfo = wire.into();
        assert_eq!(model.provider(), "anthropic");
        assert!((model.pricing.prompt - 0.000_015).abs() < 1e-12);
        assert!(model.capabilities.contains(&"image".to_string()));
        assert!(!model.is_free());
    }

    #[test]
    fn test_unparseable_pricing_is_zero() {
        let wire = WireModel {
            id: "x/y".into(),
            name: String::new(),
            context_length: 1,
            pricing: WirePricing {
                prompt: "not-a-number".into(),
                completion: String::new(),
            },
            architecture: None,
            moderated: false,
        };
        let model: ModelInfo = wire.into();
        assert!(model.is_free());
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"choices": [{"delta": {"content": "hel"}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hel"));
    }
}
