use anyhow::{Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CALORIE_GOAL: i64 = 2000;
pub const MIN_CALORIE_GOAL: i64 = 500;
pub const MAX_CALORIE_GOAL: i64 = 10_000;

pub const DEFAULT_SERVING_SIZE: &str = "1 serving";

/// How an entry was logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Manual,
    Image,
    Recipe,
    Search,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Image => "image",
            Self::Recipe => "recipe",
            Self::Search => "search",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            // older clients logged camera scans as "camera"
            "image" | "camera" => Ok(Self::Image),
            "recipe" => Ok(Self::Recipe),
            "search" => Ok(Self::Search),
            _ => bail!("Invalid entry type '{s}'. Use: manual, image, recipe, search"),
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for EntryType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EntryType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s).map_err(|e| FromSqlError::Other(e.into()))
    }
}

/// Confidence reported by the nutrition estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Lenient parse used for model output. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl ToSql for Confidence {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Confidence {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s).ok_or_else(|| FromSqlError::Other(format!("bad confidence '{s}'").into()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoodEntry {
    pub id: i64,
    pub user_id: i64,
    pub food_name: String,
    pub calories: f64,
    pub protein: f64,
    pub carbs: f64,
    pub fats: f64,
    pub serving_size: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_weight: Option<f64>,
    pub entry_type: EntryType,
    #[serde(
        rename = "image_base64",
        default,
        skip_serializing_if = "Option::is_none",
        with = "image_base64"
    )]
    pub image_data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone)]
pub struct NewFoodEntry {
    pub user_id: i64,
    pub food_name: String,
    pub calories: Option<f64>,
    pub protein: f64,
    pub carbs: f64,
    pub fats: f64,
    pub serving_size: String,
    pub serving_weight: Option<f64>,
    pub entry_type: EntryType,
    pub image_data: Option<Vec<u8>>,
    pub recipe_text: Option<String>,
    pub confidence: Option<Confidence>,
    pub timestamp: DateTime<Utc>,
}

impl NewFoodEntry {
    /// A bare entry with zeroed macros, logged now.
    pub fn new(user_id: i64, food_name: &str, calories: f64, entry_type: EntryType) -> Self {
        Self {
            user_id,
            food_name: food_name.to_string(),
            calories: Some(calories),
            protein: 0.0,
            carbs: 0.0,
            fats: 0.0,
            serving_size: DEFAULT_SERVING_SIZE.to_string(),
            serving_weight: None,
            entry_type,
            image_data: None,
            recipe_text: None,
            confidence: None,
            timestamp: Utc::now(),
        }
    }

    /// Calendar day the entry belongs to (UTC).
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

/// Partial update of a food entry. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoodEntryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub food_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calories: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protein: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fats: Option<f64>,
}

impl FoodEntryPatch {
    pub fn is_empty(&self) -> bool {
        self.food_name.is_none()
            && self.serving_size.is_none()
            && self.serving_weight.is_none()
            && self.calories.is_none()
            && self.protein.is_none()
            && self.carbs.is_none()
            && self.fats.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub total_calories: f64,
    pub total_protein: f64,
    pub total_carbs: f64,
    pub total_fats: f64,
    pub entries_count: usize,
    pub daily_goal: i64,
    pub remaining_calories: f64,
    pub percentage: f64,
}

impl DailyStats {
    #[allow(clippy::cast_precision_loss)]
    pub fn compute(date: NaiveDate, entries: &[FoodEntry], daily_goal: i64) -> Self {
        let total_calories: f64 = entries.iter().map(|e| e.calories).sum();
        let total_protein: f64 = entries.iter().map(|e| e.protein).sum();
        let total_carbs: f64 = entries.iter().map(|e| e.carbs).sum();
        let total_fats: f64 = entries.iter().map(|e| e.fats).sum();

        let goal = daily_goal as f64;
        let percentage = if daily_goal > 0 {
            (total_calories / goal * 100.0).min(100.0)
        } else {
            0.0
        };

        Self {
            date,
            total_calories,
            total_protein,
            total_carbs,
            total_fats,
            entries_count: entries.len(),
            daily_goal,
            remaining_calories: goal - total_calories,
            percentage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub daily_calorie_goal: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub daily_calorie_goal: i64,
}

// --- Validation ---

pub fn validate_new_entry(entry: &NewFoodEntry) -> Result<()> {
    if entry.food_name.trim().is_empty() {
        bail!("food_name is required");
    }
    let Some(calories) = entry.calories else {
        bail!("calories is required");
    };
    validate_nutrition(Some(calories), Some(entry.protein), Some(entry.carbs), Some(entry.fats))?;
    if entry.serving_weight.is_some_and(|w| w <= 0.0 || !w.is_finite()) {
        bail!("serving_weight must be greater than 0");
    }
    Ok(())
}

pub fn validate_patch(patch: &FoodEntryPatch) -> Result<()> {
    if patch.food_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        bail!("food_name must not be empty");
    }
    if patch
        .serving_size
        .as_deref()
        .is_some_and(|s| s.trim().is_empty())
    {
        bail!("serving_size must not be empty");
    }
    if patch.serving_weight.is_some_and(|w| w <= 0.0 || !w.is_finite()) {
        bail!("serving_weight must be greater than 0");
    }
    validate_nutrition(patch.calories, patch.protein, patch.carbs, patch.fats)
}

fn validate_nutrition(
    calories: Option<f64>,
    protein: Option<f64>,
    carbs: Option<f64>,
    fats: Option<f64>,
) -> Result<()> {
    for (name, value) in [
        ("calories", calories),
        ("protein", protein),
        ("carbs", carbs),
        ("fats", fats),
    ] {
        if value.is_some_and(|v| v < 0.0 || !v.is_finite()) {
            bail!("{name} must not be negative");
        }
    }
    Ok(())
}

pub fn validate_calorie_goal(goal: i64) -> Result<()> {
    if !(MIN_CALORIE_GOAL..=MAX_CALORIE_GOAL).contains(&goal) {
        bail!("Daily calorie goal must be between {MIN_CALORIE_GOAL} and {MAX_CALORIE_GOAL}");
    }
    Ok(())
}

/// Normalize client-supplied base64 image data.
///
/// Strips an optional `data:<mime>;base64,` prefix and any characters outside
/// the standard alphabet, then restores padding. Returns the cleaned string
/// together with the decoded bytes.
pub fn sanitize_image_base64(raw: &str) -> Result<(String, Vec<u8>)> {
    let payload = match raw.split_once("base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => raw,
    };

    let mut cleaned: String = payload
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/'))
        .collect();
    if cleaned.is_empty() {
        bail!("Image data is empty");
    }
    let missing = cleaned.len() % 4;
    if missing != 0 {
        cleaned.extend(std::iter::repeat_n('=', 4 - missing));
    }

    match STANDARD.decode(&cleaned) {
        Ok(bytes) if !bytes.is_empty() => Ok((cleaned, bytes)),
        _ => bail!("Invalid base64 image data. Please try capturing the image again."),
    }
}

mod image_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(data: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match data {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry_with(calories: f64, protein: f64) -> FoodEntry {
        let timestamp = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        FoodEntry {
            id: 1,
            user_id: 1,
            food_name: "Dal".to_string(),
            calories,
            protein,
            carbs: 10.0,
            fats: 2.0,
            serving_size: "1 katori (150ml)".to_string(),
            serving_weight: None,
            entry_type: EntryType::Manual,
            image_data: None,
            recipe_text: None,
            confidence: None,
            timestamp,
            date: timestamp.date_naive(),
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    #[test]
    fn test_entry_type_parse() {
        assert_eq!(EntryType::parse("manual").unwrap(), EntryType::Manual);
        assert_eq!(EntryType::parse("IMAGE").unwrap(), EntryType::Image);
        assert_eq!(EntryType::parse("camera").unwrap(), EntryType::Image);
        assert!(EntryType::parse("barcode").is_err());
    }

    #[test]
    fn test_entry_type_serde_lowercase() {
        let json = serde_json::to_string(&EntryType::Recipe).unwrap();
        assert_eq!(json, "\"recipe\"");
    }

    #[test]
    fn test_confidence_parse_lenient() {
        assert_eq!(Confidence::parse(" High "), Some(Confidence::High));
        assert_eq!(Confidence::parse("unsure"), None);
    }

    #[test]
    fn test_daily_stats_example() {
        let entries = vec![
            entry_with(300.0, 10.0),
            entry_with(500.0, 20.0),
            entry_with(428.0, 5.5),
        ];
        let stats = DailyStats::compute(date(), &entries, 2000);
        assert!((stats.total_calories - 1228.0).abs() < 0.01);
        assert!((stats.total_protein - 35.5).abs() < 0.01);
        assert!((stats.total_carbs - 30.0).abs() < 0.01);
        assert!((stats.remaining_calories - 772.0).abs() < 0.01);
        assert!((stats.percentage - 61.4).abs() < 0.01);
        assert_eq!(stats.entries_count, 3);
        assert_eq!(stats.daily_goal, 2000);
    }

    #[test]
    fn test_daily_stats_over_goal() {
        let entries = vec![entry_with(1500.0, 0.0), entry_with(900.0, 0.0)];
        let stats = DailyStats::compute(date(), &entries, 2000);
        assert!((stats.remaining_calories - -400.0).abs() < f64::EPSILON);
        assert!((stats.percentage - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_daily_stats_zero_goal() {
        let stats = DailyStats::compute(date(), &[entry_with(300.0, 0.0)], 0);
        assert!(stats.percentage.abs() < f64::EPSILON);
        assert!((stats.remaining_calories - -300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_daily_stats_empty() {
        let stats = DailyStats::compute(date(), &[], 2000);
        assert_eq!(stats.entries_count, 0);
        assert!(stats.total_calories.abs() < f64::EPSILON);
        assert!((stats.remaining_calories - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validate_new_entry_requires_name_and_calories() {
        let mut entry = NewFoodEntry::new(1, "Apple", 95.0, EntryType::Manual);
        assert!(validate_new_entry(&entry).is_ok());

        entry.food_name = "   ".to_string();
        assert!(validate_new_entry(&entry).is_err());

        entry.food_name = "Apple".to_string();
        entry.calories = None;
        let err = validate_new_entry(&entry).unwrap_err();
        assert!(err.to_string().contains("calories"));
    }

    #[test]
    fn test_validate_new_entry_rejects_negative_macros() {
        let mut entry = NewFoodEntry::new(1, "Apple", 95.0, EntryType::Manual);
        entry.fats = -1.0;
        assert!(validate_new_entry(&entry).is_err());
    }

    #[test]
    fn test_validate_patch() {
        assert!(validate_patch(&FoodEntryPatch::default()).is_ok());
        assert!(
            validate_patch(&FoodEntryPatch {
                serving_weight: Some(0.0),
                ..Default::default()
            })
            .is_err()
        );
        assert!(
            validate_patch(&FoodEntryPatch {
                food_name: Some(String::new()),
                ..Default::default()
            })
            .is_err()
        );
    }

    #[test]
    fn test_validate_calorie_goal_bounds() {
        assert!(validate_calorie_goal(500).is_ok());
        assert!(validate_calorie_goal(10_000).is_ok());
        assert!(validate_calorie_goal(499).is_err());
        assert!(validate_calorie_goal(10_001).is_err());
    }

    #[test]
    fn test_sanitize_image_base64() {
        // "hello" -> aGVsbG8=
        let (cleaned, bytes) = sanitize_image_base64("aGVs\nbG8").unwrap();
        assert_eq!(cleaned, "aGVsbG8=");
        assert_eq!(bytes, b"hello");

        let (_, bytes) = sanitize_image_base64("data:image/jpeg;base64,aGVsbG8=").unwrap();
        assert_eq!(bytes, b"hello");

        assert!(sanitize_image_base64("!!!").is_err());
    }

    #[test]
    fn test_food_entry_json_uses_image_base64() {
        let mut entry = entry_with(100.0, 1.0);
        entry.image_data = Some(b"hello".to_vec());
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["image_base64"], "aGVsbG8=");
        assert_eq!(value["entry_type"], "manual");
        assert_eq!(value["date"], "2024-03-01");

        let back: FoodEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back.image_data.as_deref(), Some(&b"hello"[..]));
    }
}
