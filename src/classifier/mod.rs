//! LLM classification adapter.
//!
//! Sends an episode's title and description (plus the current category
//! vocabulary) to a chat-completion API and parses the raw text reply into
//! a structured category map. An unparseable reply is an expected outcome
//! (`Ok(None)`), not an error; transport and API failures propagate.

mod prompt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::database::{CategoryKind, Episode};
use crate::error::AppError;
use crate::slug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Structured result of classifying one episode: (kind, name) pairs in
/// response order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub categories: Vec<(CategoryKind, String)>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Map a parsed JSON object onto the fixed kind taxonomy.
    ///
    /// Keys are localized labels from the model; unknown keys are ignored,
    /// missing keys mean empty lists, and non-string entries are dropped.
    /// Returns None when the value is not a JSON object at all.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;

        let mut categories = Vec::new();
        for (label, names) in object {
            let Some(kind) = kind_for_label(label) else {
                log::warn!("Ignoring unknown classification label: {}", label);
                continue;
            };
            let Some(names) = names.as_array() else {
                continue;
            };
            for name in names {
                if let Some(name) = name.as_str() {
                    let name = name.trim();
                    if !name.is_empty() {
                        categories.push((kind, name.to_string()));
                    }
                }
            }
        }

        Some(Self { categories })
    }
}

/// Resolve a response key to a category kind, tolerating the accent and
/// phrasing variants the model produces ("època", "epoca",
/// "personatges_rellevants", ...).
fn kind_for_label(label: &str) -> Option<CategoryKind> {
    match slug::normalize(label).as_str() {
        "tematica" | "tema" | "topic" => Some(CategoryKind::Topic),
        "epoca" | "epoques" | "era" => Some(CategoryKind::Era),
        "personatges" | "personatges-rellevants" | "personatge" | "character" => {
            Some(CategoryKind::Character)
        }
        "llocs" | "llocs-rellevants" | "localitzacio" | "lloc" | "location" => {
            Some(CategoryKind::Location)
        }
        _ => None,
    }
}

/// Classifies episodes; production talks to an LLM, tests use fakes.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// `Ok(None)` means the model responded but produced nothing parseable;
    /// the episode simply stays unclassified.
    async fn classify(
        &self,
        episode: &Episode,
        existing_categories: &[String],
    ) -> Result<Option<Classification>, AppError>;
}

/// Chat-completion client (OpenAI-compatible API).
pub struct LlmClassifier {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl LlmClassifier {
    pub fn new(base_url: &str, model: Option<&str>, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
            api_key,
        }
    }

    /// Run one completion with deterministic decoding (temperature 0).
    async fn complete(&self, prompt: &str) -> Result<String, AppError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.0,
        };

        log::info!(
            "Sending classification request: model={}, prompt_len={}",
            self.model,
            prompt.len()
        );

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AppError::Classifier(format!("failed to call LLM API: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Classifier(format!(
                "LLM API returned {}: {}",
                status, body
            )));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| AppError::Classifier(format!("failed to parse LLM response: {}", e)))?;

        result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::Classifier("LLM response contained no choices".to_string()))
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        episode: &Episode,
        existing_categories: &[String],
    ) -> Result<Option<Classification>, AppError> {
        let description = episode.description.as_deref().unwrap_or_default();
        let prompt = prompt::classification_prompt(&episode.title, description, existing_categories);

        let content = self.complete(&prompt).await?;

        match extract_json_from_response(&content) {
            Some(value) => Ok(Classification::from_value(&value)),
            None => {
                log::warn!(
                    "Unparseable classification response for episode {} ({} chars)",
                    episode.id,
                    content.len()
                );
                Ok(None)
            }
        }
    }
}

/// Extract JSON from an LLM reply (handles markdown code fences and
/// surrounding prose).
fn extract_json_from_response(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    // Try to extract from a markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after_marker = &trimmed[start + 7..];
        if let Some(end) = after_marker.find("```") {
            let json_str = after_marker[..end].trim();
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                return Some(json);
            }
        }
    }

    // Fall back to the first balanced object embedded in prose
    if let Some(start) = trimmed.find('{') {
        let mut depth = 0;
        let mut end = start;
        for (i, c) in trimmed[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = start + i + 1;
                        break;
                    }
                }
                _ => {}
            }
        }
        if end > start {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&trimmed[start..end]) {
                return Some(json);
            }
        }
    }

    None
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_response() {
        // Direct JSON
        let json = extract_json_from_response(r#"{"epoca": ["medieval"]}"#);
        assert!(json.is_some());

        // Markdown code block
        let json = extract_json_from_response(
            "Aquí tens el resultat:\n```json\n{\"personatges\": [\"Jaume I\"]}\n```\n",
        );
        assert!(json.is_some());

        // JSON embedded in prose
        let json = extract_json_from_response(
            r#"La classificació és: {"llocs_rellevants": ["Mallorca"]} i res més."#,
        );
        assert!(json.is_some());

        // Plain prose
        assert!(extract_json_from_response("No puc classificar això.").is_none());
    }

    #[test]
    fn test_classification_from_value_maps_localized_labels() {
        let value = serde_json::json!({
            "temàtica": ["Conquesta de Mallorca"],
            "època": ["medieval", "segle XIII"],
            "personatges_rellevants": ["Jaume I"],
            "llocs_rellevants": ["Mallorca", "València"],
        });

        let c = Classification::from_value(&value).unwrap();
        assert_eq!(c.categories.len(), 6);
        assert!(c
            .categories
            .contains(&(CategoryKind::Topic, "Conquesta de Mallorca".to_string())));
        assert!(c
            .categories
            .contains(&(CategoryKind::Era, "segle XIII".to_string())));
        assert!(c
            .categories
            .contains(&(CategoryKind::Character, "Jaume I".to_string())));
        assert!(c
            .categories
            .contains(&(CategoryKind::Location, "València".to_string())));
    }

    #[test]
    fn test_classification_tolerates_missing_and_unknown_keys() {
        let value = serde_json::json!({
            "epoca": ["modern"],
            "comentari": "ignora'm",
            "confidence": 0.9,
        });

        let c = Classification::from_value(&value).unwrap();
        assert_eq!(
            c.categories,
            vec![(CategoryKind::Era, "modern".to_string())]
        );
    }

    #[test]
    fn test_classification_drops_blank_names_and_non_strings() {
        let value = serde_json::json!({
            "personatges": ["", "   ", 42, "Ramon Muntaner"],
        });

        let c = Classification::from_value(&value).unwrap();
        assert_eq!(
            c.categories,
            vec![(CategoryKind::Character, "Ramon Muntaner".to_string())]
        );
    }

    #[test]
    fn test_classification_from_non_object_is_none() {
        assert!(Classification::from_value(&serde_json::json!(["a", "b"])).is_none());
        assert!(Classification::from_value(&serde_json::json!("text")).is_none());
    }
}
