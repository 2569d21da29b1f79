use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use healthism_core::estimator::{
    EstimateError, EstimateInput, NutritionEstimate, NutritionEstimator, SYSTEM_PROMPT,
    parse_estimate, user_prompt,
};

use crate::config::EstimatorSettings;

const MAX_TOKENS: u32 = 500;
const TEMPERATURE: f64 = 0.3;

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

/// Nutrition estimates from an OpenAI-compatible chat-completions endpoint.
pub struct OpenAiEstimator {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    url: String,
}

impl OpenAiEstimator {
    pub fn new(settings: &EstimatorSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "healthism/{} (calorie tracker)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(settings.timeout)
            .connect_timeout(Duration::from_secs(5).min(settings.timeout))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
            url: settings.url.clone(),
        })
    }

    fn request_body(&self, input: &EstimateInput) -> Value {
        let prompt = user_prompt(input);
        let user_content = match input {
            EstimateInput::Text(_) => json!(prompt),
            EstimateInput::Image { base64, .. } => json!([
                { "type": "text", "text": prompt },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/jpeg;base64,{base64}") }
                }
            ]),
        };
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": TEMPERATURE,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": user_content }
            ]
        })
    }
}

fn transport_error(err: &reqwest::Error) -> EstimateError {
    if err.is_timeout() {
        EstimateError::Timeout
    } else if err.is_decode() {
        EstimateError::Unparsable(err.to_string())
    } else {
        EstimateError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl NutritionEstimator for OpenAiEstimator {
    async fn estimate(&self, input: &EstimateInput) -> Result<NutritionEstimate, EstimateError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(EstimateError::Unavailable(
                "OPENAI_API_KEY is not configured".to_string(),
            ));
        };

        let started = std::time::Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(api_key)
            .json(&self.request_body(input))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EstimateError::Unavailable(format!(
                "model API returned HTTP {}",
                status.as_u16()
            )));
        }

        let completion: ChatCompletion = resp.json().await.map_err(|e| transport_error(&e))?;
        let reply = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| EstimateError::Unparsable("empty completion".to_string()))?;

        tracing::debug!(
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "nutrition estimate received"
        );
        parse_estimate(&reply, input.is_image())
    }
}
