use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::io::{self, BufRead, Write};
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use crate::client::Session;
use crate::config::Config;
use healthism_core::models::{DailyStats, FoodEntry};

/// Dates are UTC to match how the server buckets entries.
pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    let today = Utc::now().date_naive();
    match date_str {
        None => Ok(today),
        Some(s) => match s.as_str() {
            "today" => Ok(today),
            "yesterday" => Ok(today - chrono::Duration::days(1)),
            "tomorrow" => Ok(today + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

pub(crate) fn require_session(config: &Config) -> Result<Session> {
    match Session::load(&config.session_path())? {
        Some(session) => Ok(session),
        None => bail!("Not logged in. Run `healthism login` first"),
    }
}

/// Read a password from stdin, prompting on stderr.
pub(crate) fn read_password(prompt: &str) -> Result<String> {
    eprint!("{prompt}: ");
    io::stderr().flush()?;
    let stdin = io::stdin();
    let line = stdin.lock().lines().next().context("No input")??;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("Password must not be empty");
    }
    Ok(password)
}

pub(crate) fn password_or_prompt(password: Option<String>) -> Result<String> {
    match password {
        Some(p) if !p.is_empty() => Ok(p),
        _ => read_password("Password"),
    }
}

pub(crate) fn format_entry_line(e: &FoodEntry) -> String {
    let id = e.id;
    let name = &e.food_name;
    let serving = &e.serving_size;
    let cal = no_neg_zero(e.calories);
    let p = no_neg_zero(e.protein);
    let c = no_neg_zero(e.carbs);
    let f = no_neg_zero(e.fats);
    format!("[{id}] {name} | {serving} | {cal:.0} kcal | P:{p:.0}g C:{c:.0}g F:{f:.0}g")
}

pub(crate) fn print_entries_table(entries: &[FoodEntry]) {
    #[derive(Tabled)]
    struct EntryRow {
        #[tabled(rename = "ID")]
        id: i64,
        #[tabled(rename = "Time")]
        time: String,
        #[tabled(rename = "Food")]
        name: String,
        #[tabled(rename = "Serving")]
        serving: String,
        #[tabled(rename = "Cal")]
        calories: String,
        #[tabled(rename = "P")]
        protein: String,
        #[tabled(rename = "C")]
        carbs: String,
        #[tabled(rename = "F")]
        fats: String,
        #[tabled(rename = "Type")]
        entry_type: String,
    }

    let rows: Vec<EntryRow> = entries
        .iter()
        .map(|e| EntryRow {
            id: e.id,
            time: e.timestamp.format("%H:%M").to_string(),
            name: truncate(&e.food_name, 35),
            serving: truncate(&e.serving_size, 25),
            calories: format!("{:.0}", no_neg_zero(e.calories)),
            protein: format!("{:.1}", no_neg_zero(e.protein)),
            carbs: format!("{:.1}", no_neg_zero(e.carbs)),
            fats: format!("{:.1}", no_neg_zero(e.fats)),
            entry_type: e.entry_type.to_string(),
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(4..8)).with(Alignment::right()))
        .to_string();
    println!("{table}");
}

pub(crate) fn print_stats(stats: &DailyStats) {
    let date = stats.date;
    let total = no_neg_zero(stats.total_calories);
    let goal = stats.daily_goal;
    let remaining = no_neg_zero(stats.remaining_calories);
    let pct = stats.percentage;
    let p = no_neg_zero(stats.total_protein);
    let c = no_neg_zero(stats.total_carbs);
    let f = no_neg_zero(stats.total_fats);
    let count = stats.entries_count;

    println!("=== {date} ===\n");
    println!("  EATEN:     {total:.0} kcal ({count} entries)");
    println!("  GOAL:      {goal} kcal");
    if remaining < 0.0 {
        let over = -remaining;
        println!("  OVER:      {over:.0} kcal");
    } else {
        println!("  REMAINING: {remaining:.0} kcal");
    }
    println!("  PROGRESS:  {} {pct:.1}%", progress_bar(pct, 20));
    println!("  MACROS:    P:{p:.0}g C:{c:.0}g F:{f:.0}g");
}

/// `percentage` is already capped at 100.
pub(crate) fn progress_bar(percentage: f64, width: usize) -> String {
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let filled = ((percentage.clamp(0.0, 100.0) / 100.0) * width as f64).round() as usize;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}
