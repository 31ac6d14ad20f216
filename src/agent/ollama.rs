//! Ollama-backed calculation gateway.
//!
//! Each calculation is one chat request: a system prompt fixing the JSON
//! answer contract, then a user prompt describing the cropping system and
//! the target indicator. Refinement replays the stored conversation and
//! appends the user's follow-up.

use crate::agent::gateway::{Calculation, CalculationContext, CalculationGateway, GatewayError};
use crate::models::{
    format_number, Confidence, ConversationMessage, IndicatorValue, Role, Status,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for the Ollama client.
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub ollama_url: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    /// Extra attempts after a retriable failure.
    pub retries: usize,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            model_name: "llama3.2:latest".to_string(),
            temperature: 0.1,
            timeout_seconds: 120,
            retries: 2,
        }
    }
}

/// Message in the chat history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

impl From<&ConversationMessage> for ChatMessage {
    fn from(msg: &ConversationMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        ChatMessage::new(role, msg.content.clone())
    }
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    format: &'static str,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// JSON contract of the model's answer.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelAnswer {
    value: Value,
    applicable: Option<bool>,
    confidence: Option<String>,
    explanation: String,
    assumptions: Vec<String>,
    calculation_steps: Vec<String>,
    sources: Vec<String>,
    caveats: Vec<String>,
}

/// Gateway talking to an Ollama server.
pub struct OllamaGateway {
    config: OllamaConfig,
    http_client: reqwest::Client,
}

impl OllamaGateway {
    /// Create a gateway for the configured model.
    pub fn new(config: OllamaConfig) -> Result<Self, GatewayError> {
        info!(
            "Initializing Ollama gateway with model {} at {}",
            config.model_name, config.ollama_url
        );

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| GatewayError::Connection(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Send a chat, retrying transient failures with a linear backoff.
    async fn chat(&self, messages: Vec<ChatMessage>) -> Result<String, GatewayError> {
        let mut attempt = 0;
        loop {
            match self.chat_once(&messages).await {
                Ok(content) => return Ok(content),
                Err(e) if e.is_retriable() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!("Ollama request failed ({}), retry {}/{}", e, attempt, self.config.retries);
                    tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn chat_once(&self, messages: &[ChatMessage]) -> Result<String, GatewayError> {
        let url = format!("{}/api/chat", self.config.ollama_url);

        let request = OllamaChatRequest {
            model: self.config.model_name.clone(),
            messages: messages.to_vec(),
            stream: false,
            format: "json",
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        debug!("Sending chat request with {} messages", messages.len());

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout(self.config.timeout_seconds)
                } else if e.is_connect() {
                    GatewayError::Connection(self.config.ollama_url.clone())
                } else {
                    GatewayError::Connection(format!("failed to send request: {}", e))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api { status, body });
        }

        let chat_response: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(format!("failed to parse Ollama response: {}", e)))?;

        Ok(chat_response.message.content)
    }
}

#[async_trait]
impl CalculationGateway for OllamaGateway {
    async fn compute(&self, ctx: &CalculationContext) -> Result<Calculation, GatewayError> {
        let prompt = build_prompt(ctx);
        let messages = vec![
            ChatMessage::new("system", SYSTEM_PROMPT),
            ChatMessage::new("user", prompt.clone()),
        ];

        let reply = self.chat(messages).await?;
        let question = ConversationMessage::new(Role::User, prompt);
        parse_calculation(&reply, question)
    }

    async fn refine(
        &self,
        ctx: &CalculationContext,
        prior: &[ConversationMessage],
        user_message: &str,
    ) -> Result<Calculation, GatewayError> {
        let mut messages = vec![ChatMessage::new("system", SYSTEM_PROMPT)];
        if !prior.iter().any(|m| m.role == Role::User) {
            messages.push(ChatMessage::new("user", build_prompt(ctx)));
        }
        messages.extend(prior.iter().map(ChatMessage::from));
        messages.push(ChatMessage::new("user", user_message));

        let reply = self.chat(messages).await?;
        let question = ConversationMessage::new(Role::User, user_message);
        parse_calculation(&reply, question)
    }
}

/// Describe the system and the target slot for the model.
pub fn build_prompt(ctx: &CalculationContext) -> String {
    let system = &ctx.system;
    let step = ctx.step();
    let intervention = ctx.intervention();
    let key = ctx.item.key;

    let mut prompt = String::new();
    prompt.push_str(&format!(
        "Cropping system: {} ({} ha)\n",
        system.name,
        format_number(system.surface)
    ));

    prompt.push_str("Rotation:\n");
    for (i, s) in system.steps.iter().enumerate() {
        let marker = if i == ctx.item.step_index { " <= current" } else { "" };
        prompt.push_str(&format!(
            "  {}. {} [{} → {}]{}\n",
            i + 1,
            s.name,
            s.start_date.as_deref().unwrap_or("?"),
            s.end_date.as_deref().unwrap_or("?"),
            marker
        ));
    }

    prompt.push_str(&format!("\nStep: {}\n", step.name));
    prompt.push_str(&format!("Intervention: {}", intervention.name));
    if let Some(ref date) = intervention.date {
        prompt.push_str(&format!(" ({})", date));
    }
    prompt.push('\n');

    let known: Vec<_> = intervention
        .values
        .iter()
        .filter(|e| e.key != key && e.has_value())
        .collect();
    if !known.is_empty() {
        prompt.push_str("Known values for this intervention:\n");
        for entry in known {
            if let Some(ref value) = entry.value {
                prompt.push_str(&format!(
                    "  - {} ({}): {} [{}]\n",
                    entry.key.label(),
                    entry.key,
                    value,
                    entry.status
                ));
            }
        }
    }

    if !ctx.assumptions.is_empty() {
        prompt.push_str("\nAssumptions:\n");
        if let Some(ref a) = ctx.assumptions.system {
            prompt.push_str(&format!("  - System: {}\n", a));
        }
        if let Some(ref a) = ctx.assumptions.step {
            prompt.push_str(&format!("  - Step: {}\n", a));
        }
        if let Some(ref a) = ctx.assumptions.intervention {
            prompt.push_str(&format!("  - Intervention: {}\n", a));
        }
    }

    prompt.push_str(&format!(
        "\nEstimate the indicator \"{}\" ({}) for this intervention, for one pass over one hectare.\n",
        key.label(),
        key
    ));
    prompt.push_str("Answer with the JSON object described in the instructions.");

    prompt
}

/// Parse the model's reply into a calculation.
///
/// Tolerates prose around the JSON object and numbers sent as strings.
pub fn parse_calculation(
    reply: &str,
    question: ConversationMessage,
) -> Result<Calculation, GatewayError> {
    let json = extract_json_object(reply)
        .ok_or_else(|| GatewayError::InvalidResponse("no JSON object in reply".to_string()))?;
    let answer: ModelAnswer = serde_json::from_str(json)
        .map_err(|e| GatewayError::InvalidResponse(format!("malformed JSON answer: {}", e)))?;

    let value = match answer.value {
        Value::Number(ref n) => n.as_f64().map(IndicatorValue::Number),
        Value::String(ref s) => {
            let normalized = s.trim().replace(',', ".");
            match normalized.parse::<f64>() {
                Ok(n) if n.is_finite() => Some(IndicatorValue::Number(n)),
                _ if s.trim().is_empty() => None,
                _ => Some(IndicatorValue::Text(s.trim().to_string())),
            }
        }
        _ => None,
    };

    let applicable = answer.applicable.unwrap_or(true);
    if applicable && value.is_none() {
        return Err(GatewayError::InvalidResponse(
            "answer has neither a value nor applicable=false".to_string(),
        ));
    }

    let status = if applicable {
        Status::Ia
    } else {
        Status::NotApplicable
    };
    let confidence = answer.confidence.as_deref().and_then(Confidence::parse_loose);

    let content = if answer.explanation.trim().is_empty() {
        match value {
            Some(ref v) => format!("Estimated value: {}", v),
            None => "Not applicable to this intervention.".to_string(),
        }
    } else {
        answer.explanation.trim().to_string()
    };

    let reply_message = ConversationMessage {
        assumptions: answer.assumptions,
        calculation_steps: answer.calculation_steps,
        sources: answer.sources.clone(),
        confidence,
        caveats: answer.caveats,
        ..ConversationMessage::new(Role::Assistant, content)
    };

    Ok(Calculation {
        value,
        status,
        confidence,
        conversation: vec![question, reply_message],
        sources: answer.sources,
    })
}

fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&reply[start..=end])
}

/// System prompt fixing the answer contract.
const SYSTEM_PROMPT: &str = r#"You are an agronomist and farm economist estimating technical, economic and environmental indicators of field operations in a crop rotation.

Answer ONLY with one JSON object:
{
  "value": <number, or null when not applicable>,
  "applicable": <true|false>,
  "confidence": "high" | "medium" | "low",
  "explanation": "<one or two sentences>",
  "assumptions": ["..."],
  "calculation_steps": ["..."],
  "sources": ["..."],
  "caveats": ["..."]
}

Use the assumptions supplied by the user when present. Costs are in EUR per hectare, times in hours per hectare, emissions in kg CO2e per hectare, nitrogen in kg N per hectare.
If the indicator does not apply to the operation (for example irrigation cost of a harvest), set "applicable": false and "value": null."#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorKey;
    use crate::models::{Intervention, Step, System, ValueEntry};
    use crate::scanner::WorkItem;
    use std::sync::Arc;

    fn question() -> ConversationMessage {
        ConversationMessage::new(Role::User, "How much fuel?")
    }

    fn context() -> CalculationContext {
        let mut sowing = Intervention {
            name: "Sowing".to_string(),
            assumptions: Some("Direct drilling".to_string()),
            ..Intervention::default()
        };
        sowing
            .values
            .insert(ValueEntry::user(IndicatorKey::Semences, 120.0));
        let system = System {
            name: "Cereal rotation".to_string(),
            surface: 12.0,
            assumptions: Some("Conventional farm".to_string()),
            steps: vec![Step {
                name: "Wheat".to_string(),
                start_date: Some("2023-10-01".to_string()),
                interventions: vec![sowing],
                ..Step::default()
            }],
            ..System::default()
        };
        let item = WorkItem {
            step_index: 0,
            intervention_index: 0,
            key: IndicatorKey::Gnr,
        };
        CalculationContext::new(Arc::new(system), item).unwrap()
    }

    #[test]
    fn test_ollama_config_default() {
        let config = OllamaConfig::default();
        assert_eq!(config.model_name, "llama3.2:latest");
        assert_eq!(config.retries, 2);
    }

    #[test]
    fn test_build_prompt() {
        let prompt = build_prompt(&context());
        assert!(prompt.contains("Cereal rotation (12 ha)"));
        assert!(prompt.contains("Wheat [2023-10-01 → ?] <= current"));
        assert!(prompt.contains("Seed cost (EUR) (semences): 120 [user]"));
        assert!(prompt.contains("System: Conventional farm"));
        assert!(prompt.contains("Intervention: Direct drilling"));
        assert!(prompt.contains("\"Fuel cost (EUR)\" (gnr)"));
    }

    #[test]
    fn test_parse_numeric_answer() {
        let reply = r#"Here you go:
{"value": 18.5, "applicable": true, "confidence": "medium",
 "explanation": "About 15 l/ha of diesel.", "calculation_steps": ["15 l x 1.23 EUR"],
 "sources": ["Barème d'entraide"]}"#;

        let calc = parse_calculation(reply, question()).unwrap();
        assert_eq!(calc.value, Some(IndicatorValue::Number(18.5)));
        assert_eq!(calc.status, Status::Ia);
        assert_eq!(calc.confidence, Some(Confidence::Medium));
        assert_eq!(calc.conversation.len(), 2);
        assert_eq!(calc.conversation[1].role, Role::Assistant);
        assert_eq!(calc.conversation[1].calculation_steps.len(), 1);
        assert_eq!(calc.sources, vec!["Barème d'entraide".to_string()]);
    }

    #[test]
    fn test_parse_string_number_and_not_applicable() {
        let calc = parse_calculation(r#"{"value": "12,5"}"#, question()).unwrap();
        assert_eq!(calc.value, Some(IndicatorValue::Number(12.5)));
        assert_eq!(calc.confidence, None);

        let calc =
            parse_calculation(r#"{"value": null, "applicable": false}"#, question()).unwrap();
        assert_eq!(calc.status, Status::NotApplicable);
        assert_eq!(calc.value, None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_calculation("I cannot answer", question()),
            Err(GatewayError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_calculation(r#"{"value": null}"#, question()),
            Err(GatewayError::InvalidResponse(_))
        ));
    }
}
