//! Keeps an entry's display name and serving-size label in step with its
//! serving weight.
//!
//! Labels produced by the estimator look like `"1 large bowl (250g)"` and names
//! like `"Chicken Biryani (approx. 250g)"`. When only the weight is edited, the
//! gram token in both strings is rewritten so neither shows a stale weight.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::{FoodEntry, FoodEntryPatch};

/// `(250g)`, `(250 g)`, `(62.5g)`, `(approx. 250g)`
static WEIGHT_TOKEN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\(\s*(?:approx\.?\s*)?(\d+(?:\.\d+)?)\s*g\s*\)").ok()
});

/// A count at the start of a label: `1 `, `2.5 `, `1/2 `
static LEADING_COUNT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*\d+(?:[./]\d+)?\s+").ok());

static PARENTHESIZED: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\([^)]*\)").ok());

static SIZE_WORDS: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:small|medium|large|big)\b").ok());

fn replace_all(pattern: &LazyLock<Option<Regex>>, text: &str) -> String {
    match pattern.as_ref() {
        Some(re) => re.replace_all(text, " ").into_owned(),
        None => text.to_string(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Render grams without a trailing `.0`.
pub fn format_weight(grams: f64) -> String {
    if grams.fract().abs() < f64::EPSILON {
        format!("{grams:.0}")
    } else {
        format!("{grams}")
    }
}

/// The gram weight embedded in a label, if any.
pub fn weight_from_label(label: &str) -> Option<f64> {
    WEIGHT_TOKEN
        .as_ref()?
        .captures(label)?
        .get(1)?
        .as_str()
        .parse()
        .ok()
}

pub fn has_weight_token(label: &str) -> bool {
    WEIGHT_TOKEN.as_ref().is_some_and(|re| re.is_match(label))
}

/// `"1 large bowl (250g)"` with 100 becomes `"large bowl (100g)"`.
pub fn regenerate_serving_size(serving_size: &str, grams: f64) -> String {
    let without_token = replace_all(&WEIGHT_TOKEN, serving_size);
    let base = match LEADING_COUNT.as_ref() {
        Some(re) => re.replace(&without_token, "").into_owned(),
        None => without_token,
    };
    let base = collapse_whitespace(&base);
    let weight = format_weight(grams);
    if base.is_empty() {
        format!("({weight}g)")
    } else {
        format!("{base} ({weight}g)")
    }
}

/// `"Chicken Biryani (approx. 250g)"` with 100 becomes
/// `"Chicken Biryani (approx. 100g)"`.
pub fn regenerate_food_name(food_name: &str, grams: f64) -> String {
    let base = collapse_whitespace(&replace_all(&WEIGHT_TOKEN, food_name));
    format!("{base} (approx. {}g)", format_weight(grams))
}

fn same_weight(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

/// Rewrite the gram tokens in a name and serving label that disagree with
/// `grams`. Strings without a token are returned unchanged.
pub fn align_weight(food_name: &str, serving_size: &str, grams: f64) -> (String, String) {
    let label = match weight_from_label(serving_size) {
        Some(w) if !same_weight(w, grams) => regenerate_serving_size(serving_size, grams),
        _ => serving_size.to_string(),
    };
    let name = match weight_from_label(food_name) {
        Some(w) if !same_weight(w, grams) => regenerate_food_name(food_name, grams),
        _ => food_name.to_string(),
    };
    (name, label)
}

/// Display name for an entry whose serving label was replaced.
///
/// The base food type is the old name without parenthesized text, a leading
/// count or size words. If the new label already mentions it, the label is the
/// new name; otherwise the base is appended to the label.
pub fn derive_food_name(old_name: &str, new_serving: &str) -> String {
    let base = replace_all(&PARENTHESIZED, old_name);
    let base = match LEADING_COUNT.as_ref() {
        Some(re) => re.replace(&base, "").into_owned(),
        None => base,
    };
    let base = collapse_whitespace(&replace_all(&SIZE_WORDS, &base));
    let serving = new_serving.trim();

    if base.is_empty() || serving.to_lowercase().contains(&base.to_lowercase()) {
        serving.to_string()
    } else {
        format!("{serving} {base}")
    }
}

/// Apply a partial update to an entry, keeping name, label and weight
/// consistent.
///
/// - A new `serving_size` without a `food_name` relabels the entry and takes
///   its weight from the new label.
/// - A new `serving_weight` without a `serving_size` rewrites the gram token in
///   the existing label and, unless `food_name` is set, in the name.
/// - Explicit values always win over derived ones.
pub fn apply_patch(entry: &FoodEntry, patch: &FoodEntryPatch) -> FoodEntry {
    let mut updated = entry.clone();

    if let Some(serving_size) = patch.serving_size.as_deref() {
        let serving_size = serving_size.trim();
        updated.serving_size = serving_size.to_string();
        updated.serving_weight = weight_from_label(serving_size);
        if patch.food_name.is_none() {
            updated.food_name = derive_food_name(&entry.food_name, serving_size);
        }
    }

    if let Some(grams) = patch.serving_weight {
        updated.serving_weight = Some(grams);
        if patch.serving_size.is_none() {
            if has_weight_token(&entry.serving_size) {
                updated.serving_size = regenerate_serving_size(&entry.serving_size, grams);
            }
            if patch.food_name.is_none() && has_weight_token(&entry.food_name) {
                updated.food_name = regenerate_food_name(&entry.food_name, grams);
            }
        }
    }

    if let Some(food_name) = patch.food_name.as_deref() {
        updated.food_name = food_name.trim().to_string();
    }
    if let Some(calories) = patch.calories {
        updated.calories = calories;
    }
    if let Some(protein) = patch.protein {
        updated.protein = protein;
    }
    if let Some(carbs) = patch.carbs {
        updated.carbs = carbs;
    }
    if let Some(fats) = patch.fats {
        updated.fats = fats;
    }

    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryType;
    use chrono::{TimeZone, Utc};

    fn entry(food_name: &str, serving_size: &str, serving_weight: Option<f64>) -> FoodEntry {
        let timestamp = Utc.with_ymd_and_hms(2024, 5, 10, 8, 30, 0).unwrap();
        FoodEntry {
            id: 7,
            user_id: 1,
            food_name: food_name.to_string(),
            calories: 450.0,
            protein: 12.0,
            carbs: 60.0,
            fats: 15.0,
            serving_size: serving_size.to_string(),
            serving_weight,
            entry_type: EntryType::Image,
            image_data: None,
            recipe_text: None,
            confidence: None,
            timestamp,
            date: timestamp.date_naive(),
        }
    }

    #[test]
    fn test_format_weight() {
        assert_eq!(format_weight(100.0), "100");
        assert_eq!(format_weight(62.5), "62.5");
    }

    #[test]
    fn test_weight_from_label() {
        assert_eq!(weight_from_label("1 large bowl (250g)"), Some(250.0));
        assert_eq!(weight_from_label("2 rotis (60.5 g)"), Some(60.5));
        assert_eq!(weight_from_label("Biryani (approx. 300g)"), Some(300.0));
        assert_eq!(weight_from_label("1 katori dal (150ml)"), None);
        assert_eq!(weight_from_label("1 serving"), None);
    }

    #[test]
    fn test_regenerate_serving_size() {
        assert_eq!(
            regenerate_serving_size("1 large bowl (250g)", 100.0),
            "large bowl (100g)"
        );
        assert_eq!(
            regenerate_serving_size("large bowl (250 g)", 62.5),
            "large bowl (62.5g)"
        );
        assert_eq!(regenerate_serving_size("(250g)", 80.0), "(80g)");
    }

    #[test]
    fn test_regenerate_food_name() {
        assert_eq!(
            regenerate_food_name("Chicken Biryani (approx. 250g)", 100.0),
            "Chicken Biryani (approx. 100g)"
        );
        assert_eq!(
            regenerate_food_name("Poha (200g)", 150.0),
            "Poha (approx. 150g)"
        );
    }

    #[test]
    fn test_derive_food_name() {
        assert_eq!(derive_food_name("1 medium banana (120g)", "2 bananas"), "2 bananas");
        assert_eq!(derive_food_name("Banana", "2 pieces"), "2 pieces Banana");
        assert_eq!(
            derive_food_name("2 large Rotis", "3 rotis (90g)"),
            "3 rotis (90g)"
        );
        assert_eq!(derive_food_name("(estimated)", "1 plate"), "1 plate");
    }

    #[test]
    fn test_align_weight() {
        assert_eq!(
            align_weight("Chicken Biryani (approx. 250g)", "1 small plate (150g)", 150.0),
            (
                "Chicken Biryani (approx. 150g)".to_string(),
                "1 small plate (150g)".to_string()
            )
        );
        assert_eq!(
            align_weight("Poha", "1 plate (200g)", 120.0),
            ("Poha".to_string(), "plate (120g)".to_string())
        );
        assert_eq!(
            align_weight("Chai", "1 cup", 150.0),
            ("Chai".to_string(), "1 cup".to_string())
        );
    }

    #[test]
    fn test_weight_only_patch_regenerates_label_and_name() {
        let existing = entry(
            "Chicken Biryani (approx. 250g)",
            "1 large bowl (250g)",
            Some(250.0),
        );
        let patch = FoodEntryPatch {
            serving_weight: Some(100.0),
            ..Default::default()
        };
        let updated = apply_patch(&existing, &patch);

        assert_eq!(updated.serving_size, "large bowl (100g)");
        assert_eq!(updated.food_name, "Chicken Biryani (approx. 100g)");
        assert_eq!(updated.serving_weight, Some(100.0));
        assert!(!updated.serving_size.contains("250"));
        assert!(!updated.food_name.contains("250"));
    }

    #[test]
    fn test_weight_only_patch_leaves_plain_labels() {
        let existing = entry("Masala Dosa", "1 dosa", None);
        let patch = FoodEntryPatch {
            serving_weight: Some(180.0),
            ..Default::default()
        };
        let updated = apply_patch(&existing, &patch);

        assert_eq!(updated.serving_size, "1 dosa");
        assert_eq!(updated.food_name, "Masala Dosa");
        assert_eq!(updated.serving_weight, Some(180.0));
    }

    #[test]
    fn test_weight_patch_keeps_explicit_name() {
        let existing = entry("Rice (approx. 250g)", "1 bowl (250g)", Some(250.0));
        let patch = FoodEntryPatch {
            serving_weight: Some(150.0),
            food_name: Some("Jeera Rice".to_string()),
            ..Default::default()
        };
        let updated = apply_patch(&existing, &patch);

        assert_eq!(updated.food_name, "Jeera Rice");
        assert_eq!(updated.serving_size, "bowl (150g)");
    }

    #[test]
    fn test_serving_size_patch_relabels() {
        let existing = entry("1 medium banana (120g)", "1 medium banana (120g)", Some(120.0));
        let patch = FoodEntryPatch {
            serving_size: Some("2 small bananas (180g)".to_string()),
            ..Default::default()
        };
        let updated = apply_patch(&existing, &patch);

        assert_eq!(updated.serving_size, "2 small bananas (180g)");
        assert_eq!(updated.food_name, "2 small bananas (180g)");
        assert_eq!(updated.serving_weight, Some(180.0));
    }

    #[test]
    fn test_serving_size_and_weight_both_explicit() {
        let existing = entry("Dal (approx. 150g)", "1 katori (150g)", Some(150.0));
        let patch = FoodEntryPatch {
            serving_size: Some("2 katori".to_string()),
            serving_weight: Some(300.0),
            ..Default::default()
        };
        let updated = apply_patch(&existing, &patch);

        assert_eq!(updated.serving_size, "2 katori");
        assert_eq!(updated.serving_weight, Some(300.0));
        assert_eq!(updated.food_name, "2 katori Dal");
    }

    #[test]
    fn test_empty_patch_is_identity() {
        let existing = entry("Idli", "2 idlis (80g)", Some(80.0));
        let updated = apply_patch(&existing, &FoodEntryPatch::default());
        assert_eq!(updated, existing);
    }
}
