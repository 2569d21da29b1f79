use std::path::Path;
use std::process;

use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::api::{AnalyzeImageRequest, ManualFoodRequest, UpdateFoodRequest};
use crate::client::{ApiClient, ClientError};
use crate::config::Config;
use healthism_core::models::FoodEntry;

use super::helpers::{format_entry_line, json_error, require_session};

fn print_logged(entry: &FoodEntry, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entry)?);
    } else {
        println!("Logged {}", format_entry_line(entry));
        if let Some(confidence) = entry.confidence {
            println!("  Confidence: {}", confidence.as_str());
        }
    }
    Ok(())
}

fn exit_not_found(message: &str, json: bool) -> ! {
    if json {
        println!("{}", json_error(message));
    } else {
        eprintln!("{message}");
    }
    process::exit(2);
}

pub(crate) async fn cmd_log(config: &Config, req: &ManualFoodRequest, json: bool) -> Result<()> {
    if req.food_name.trim().is_empty() {
        bail!("Food name must not be empty");
    }
    let session = require_session(config)?;
    let entry = ApiClient::for_session(&session)?
        .log_manual(&session, req)
        .await?;
    print_logged(&entry, json)
}

pub(crate) async fn cmd_scan(
    config: &Config,
    image: &Path,
    hint: Option<String>,
    json: bool,
) -> Result<()> {
    let bytes = std::fs::read(image)
        .with_context(|| format!("Failed to read image: {}", image.display()))?;
    if bytes.is_empty() {
        bail!("Image file is empty: {}", image.display());
    }

    let session = require_session(config)?;
    let entry = ApiClient::for_session(&session)?
        .analyze_image(
            &session,
            &AnalyzeImageRequest {
                image_base64: STANDARD.encode(&bytes),
                hint,
            },
        )
        .await?;
    print_logged(&entry, json)
}

pub(crate) async fn cmd_recipe(
    config: &Config,
    text: Option<String>,
    file: Option<&Path>,
    json: bool,
) -> Result<()> {
    let recipe_text = match (text, file) {
        (Some(t), None) => t,
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read recipe: {}", path.display()))?,
        (Some(_), Some(_)) => bail!("Give the recipe as text or --file, not both"),
        (None, None) => bail!("Give the recipe as text or with --file"),
    };
    if recipe_text.trim().is_empty() {
        bail!("Recipe is empty");
    }

    let session = require_session(config)?;
    let entry = ApiClient::for_session(&session)?
        .analyze_recipe(&session, &recipe_text)
        .await?;
    print_logged(&entry, json)
}

pub(crate) async fn cmd_search(config: &Config, query: &str, save: bool, json: bool) -> Result<()> {
    let session = require_session(config)?;
    let client = ApiClient::for_session(&session)?;

    if save {
        let entry = client.search_and_save(&session, query).await?;
        return print_logged(&entry, json);
    }

    let estimate = client.search(&session, query).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&estimate)?);
    } else {
        let name = &estimate.food_name;
        let serving = &estimate.serving_size;
        let cal = estimate.calories;
        let p = estimate.protein;
        let c = estimate.carbs;
        let f = estimate.fats;
        println!("{name} | {serving}");
        println!("  {cal:.0} kcal | P:{p:.0}g C:{c:.0}g F:{f:.0}g");
        println!("\nNot logged. Re-run with --save to add it to today.");
    }
    Ok(())
}

pub(crate) async fn cmd_update(
    config: &Config,
    entry_id: i64,
    req: &UpdateFoodRequest,
    json: bool,
) -> Result<()> {
    if req.is_empty() {
        bail!("Nothing to update. Provide at least one of --name, --serving, or --weight");
    }

    let session = require_session(config)?;
    match ApiClient::for_session(&session)?
        .update_entry(&session, entry_id, req)
        .await
    {
        Ok(entry) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            } else {
                println!("Updated {}", format_entry_line(&entry));
            }
            Ok(())
        }
        Err(ClientError::NotFound(_)) => {
            exit_not_found(&format!("Entry {entry_id} not found"), json)
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) async fn cmd_delete(config: &Config, entry_id: i64, json: bool) -> Result<()> {
    let session = require_session(config)?;
    match ApiClient::for_session(&session)?
        .delete_entry(&session, entry_id)
        .await
    {
        Ok(()) => {
            if json {
                println!("{}", serde_json::json!({ "deleted": entry_id }));
            } else {
                println!("Deleted entry {entry_id}");
            }
            Ok(())
        }
        Err(ClientError::NotFound(_)) => {
            exit_not_found(&format!("Entry {entry_id} not found"), json)
        }
        Err(e) => Err(e.into()),
    }
}
