use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Confidence, DEFAULT_SERVING_SIZE, EntryType, NewFoodEntry};
use crate::serving::weight_from_label;

/// Label used when the model gives no usable serving size.
pub const UNSPECIFIED_SERVING: &str = "1 serving (weight not specified)";

/// First JSON object in a reply, allowing one level of nested braces.
static JSON_OBJECT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\{(?:[^{}]|\{[^{}]*\})*\}").ok());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NutritionEstimate {
    pub food_name: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fats: f64,
    pub serving_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
}

impl NutritionEstimate {
    /// Turn an estimate into a new entry for `user_id`, logged now.
    pub fn into_new_entry(self, user_id: i64, entry_type: EntryType) -> NewFoodEntry {
        let serving_weight = weight_from_label(&self.serving_size);
        NewFoodEntry {
            user_id,
            food_name: self.food_name,
            calories: Some(self.calories),
            protein: self.protein,
            carbs: self.carbs,
            fats: self.fats,
            serving_size: self.serving_size,
            serving_weight,
            entry_type,
            image_data: None,
            recipe_text: None,
            confidence: self.confidence,
            timestamp: Utc::now(),
        }
    }
}

/// What the estimator is asked about.
#[derive(Debug, Clone)]
pub enum EstimateInput {
    Text(String),
    Image {
        /// Sanitized standard base64, no data-URL prefix.
        base64: String,
        hint: Option<String>,
    },
}

impl EstimateInput {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EstimateError {
    #[error("Nutrition estimator timed out")]
    Timeout,
    #[error("Nutrition estimator unavailable: {0}")]
    Unavailable(String),
    #[error("Nutrition estimator returned unparsable data: {0}")]
    Unparsable(String),
}

/// A source of nutrition estimates for a food description or photo.
#[async_trait]
pub trait NutritionEstimator: Send + Sync {
    async fn estimate(&self, input: &EstimateInput) -> Result<NutritionEstimate, EstimateError>;
}

pub const SYSTEM_PROMPT: &str = "You are a nutritionist with deep knowledge of Indian and South Asian \
dishes as well as packaged foods sold in India. Always quantify portions with measurable units: \
brand and pack weight for packaged foods, household units with grams for home-cooked dishes \
(for example \"2 medium rotis (60g)\"), and pieces with grams for fruit and vegetables. \
Never answer with a bare \"1 serving\". Give your best estimate even when the input is unclear.";

const REPLY_FORMAT: &str = r#"Reply with JSON only, in this shape:
{"food_name": "specific name, with brand and weight when packaged", "calories": number, "protein": grams, "carbs": grams, "fats": grams, "serving_size": "measurable portion, e.g. 1 bowl (250g)", "confidence": "high|medium|low"}"#;

/// User prompt for the given input. Image bytes travel separately.
pub fn user_prompt(input: &EstimateInput) -> String {
    match input {
        EstimateInput::Text(description) => {
            format!("Estimate the nutrition for: {description}\n\n{REPLY_FORMAT}")
        }
        EstimateInput::Image {
            hint: Some(hint), ..
        } => format!("{hint}\n\n{REPLY_FORMAT}"),
        EstimateInput::Image { hint: None, .. } => format!(
            "Identify the food in this photo. Judge the portion from visual cues and, for \
             packaged food, read the brand and pack size if visible.\n\n{REPLY_FORMAT}"
        ),
    }
}

/// Prompt for a recipe. The whole recipe is estimated as a single entry.
pub fn recipe_prompt(recipe_text: &str) -> String {
    format!(
        "Analyze this recipe and estimate the total nutrition of the entire recipe, summing \
         every ingredient. Name the dish and give the full batch as the serving size.\n\n\
         {recipe_text}"
    )
}

/// Prompt for a manual entry with a known portion.
pub fn manual_prompt(food_name: &str, serving_size: &str) -> String {
    format!("{food_name}, serving size: {serving_size}")
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        // models sometimes answer "120 kcal", "4.5g" or "1,200 kcal"
        Value::String(s) => {
            let s: String = s.trim().chars().filter(|c| !matches!(c, ',' | '_')).collect();
            let end = s
                .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
                .unwrap_or(s.len());
            s[..end].parse().ok()
        }
        _ => None,
    }
}

fn non_negative(object: &Value, key: &str) -> Result<f64, EstimateError> {
    match object.get(key).and_then(as_number) {
        None => Ok(0.0),
        Some(v) if v >= 0.0 && v.is_finite() => Ok(v),
        Some(v) => Err(EstimateError::Unparsable(format!("{key} is {v}"))),
    }
}

/// Parse a model reply into an estimate.
///
/// Fails with [`EstimateError::Unparsable`] when the reply holds no JSON
/// object or lacks a food name or calorie count.
pub fn parse_estimate(reply: &str, from_image: bool) -> Result<NutritionEstimate, EstimateError> {
    let json = JSON_OBJECT
        .as_ref()
        .and_then(|re| re.find(reply))
        .ok_or_else(|| EstimateError::Unparsable("no JSON object in reply".to_string()))?;
    let object: Value = serde_json::from_str(json.as_str())
        .map_err(|e| EstimateError::Unparsable(format!("invalid JSON: {e}")))?;

    let food_name = object
        .get("food_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EstimateError::Unparsable("missing food_name".to_string()))?;

    let calories = object
        .get("calories")
        .and_then(as_number)
        .ok_or_else(|| EstimateError::Unparsable("missing calories".to_string()))?;
    if calories < 0.0 || !calories.is_finite() {
        return Err(EstimateError::Unparsable(format!("calories is {calories}")));
    }

    let serving_size = match object.get("serving_size").and_then(Value::as_str).map(str::trim) {
        None | Some("" | DEFAULT_SERVING_SIZE) => UNSPECIFIED_SERVING.to_string(),
        Some(s) => s.to_string(),
    };

    let confidence = object
        .get("confidence")
        .and_then(Value::as_str)
        .and_then(Confidence::parse);

    let food_name = if from_image && confidence == Some(Confidence::Low) {
        format!("{food_name} (estimated)")
    } else {
        food_name.to_string()
    };

    Ok(NutritionEstimate {
        food_name,
        calories,
        protein: non_negative(&object, "protein")?,
        carbs: non_negative(&object, "carbs")?,
        fats: non_negative(&object, "fats")?,
        serving_size,
        confidence,
    })
}
