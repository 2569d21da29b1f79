use anyhow::Result;
use chrono::Utc;
use std::process;

use crate::client::ApiClient;
use crate::config::Config;

use super::helpers::{parse_date, print_entries_table, print_stats, require_session};

pub(crate) async fn cmd_today(config: &Config, json: bool) -> Result<()> {
    let session = require_session(config)?;
    let entries = ApiClient::for_session(&session)?.today(&session).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        let date = Utc::now().date_naive();
        eprintln!("No entries for {date}");
        process::exit(2);
    }

    print_entries_table(&entries);
    let total: f64 = entries.iter().map(|e| e.calories).sum();
    println!("  TOTAL: {total:.0} kcal");
    Ok(())
}

pub(crate) async fn cmd_history(config: &Config, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let session = require_session(config)?;
    let entries = ApiClient::for_session(&session)?
        .history(&session, date)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        eprintln!("No entries for {date}");
        process::exit(2);
    }

    println!("=== {date} ===\n");
    print_entries_table(&entries);
    Ok(())
}

pub(crate) async fn cmd_stats(config: &Config, date: Option<String>, json: bool) -> Result<()> {
    let date = parse_date(date)?;
    let session = require_session(config)?;
    let stats = ApiClient::for_session(&session)?
        .daily_stats(&session, date)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(&stats);
    }
    Ok(())
}
