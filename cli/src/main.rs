mod api;
mod auth;
mod client;
mod commands;
mod config;
mod logging;
mod openai;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

use crate::api::{ManualFoodRequest, UpdateFoodRequest};
use crate::commands::{
    cmd_delete, cmd_goal, cmd_history, cmd_log, cmd_login, cmd_logout, cmd_me, cmd_recipe,
    cmd_register, cmd_scan, cmd_search, cmd_stats, cmd_today, cmd_update,
};
use crate::config::{Config, DEFAULT_PORT, ServerSettings};
use healthism_core::db::Database;
use healthism_core::models::DEFAULT_CALORIE_GOAL;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8001";

#[derive(Parser)]
#[command(
    name = "healthism",
    version,
    about = "Calorie tracker with AI nutrition estimates",
    long_about = "Calorie tracker with AI nutrition estimates.\n\n\
        Run `healthism serve` to start the API, then `healthism register` or\n\
        `healthism login` to sign in and log food from the command line."
)]
struct Cli {
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
    },
    /// Create an account and log in
    Register {
        username: String,
        email: String,
        /// Password (prompted on stdin if omitted)
        #[arg(long)]
        password: Option<String>,
        /// Daily calorie goal
        #[arg(long, default_value_t = DEFAULT_CALORIE_GOAL)]
        goal: i64,
        /// Server URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log in and store the session
    Login {
        username: String,
        /// Password (prompted on stdin if omitted)
        #[arg(long)]
        password: Option<String>,
        /// Server URL
        #[arg(long, default_value = DEFAULT_SERVER)]
        server: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget the stored session
    Logout {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the logged-in profile
    Me {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the daily calorie goal
    Goal {
        /// Daily calories (500-10000)
        calories: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log a food by description; calories are estimated unless given
    Log {
        /// Food name (e.g. "masala dosa")
        food: String,
        /// Portion (e.g. "2 rotis (60g)", "1 bowl")
        #[arg(short, long)]
        serving: Option<String>,
        /// Portion weight in grams
        #[arg(short, long)]
        weight: Option<f64>,
        /// Calories, skips the estimate
        #[arg(long)]
        calories: Option<f64>,
        /// Protein in grams (with --calories)
        #[arg(long)]
        protein: Option<f64>,
        /// Carbs in grams (with --calories)
        #[arg(long)]
        carbs: Option<f64>,
        /// Fats in grams (with --calories)
        #[arg(long)]
        fats: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log a food from a photo
    Scan {
        /// Path to the image file
        image: PathBuf,
        /// Extra context for the estimate (e.g. "homemade, half portion")
        #[arg(long)]
        hint: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Log a dish from its recipe
    Recipe {
        /// Recipe text
        text: Option<String>,
        /// Read the recipe from a file
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Estimate nutrition for a food without logging it
    Search {
        /// Search query
        query: String,
        /// Log the result as an entry
        #[arg(long)]
        save: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show today's entries
    Today {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show entries for a date
    History {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show calorie totals against the daily goal
    Stats {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Update an entry's name, serving size or weight
    Update {
        /// Entry ID to update
        entry_id: i64,
        /// New display name
        #[arg(long)]
        name: Option<String>,
        /// New serving size (re-estimates nutrition)
        #[arg(short, long)]
        serving: Option<String>,
        /// New weight in grams
        #[arg(short, long)]
        weight: Option<f64>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an entry by ID
    Delete {
        /// Entry ID to delete
        entry_id: i64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let directives = if matches!(cli.command, Commands::Serve { .. }) {
        "healthism=info,healthism_core=info,tower_http=info"
    } else {
        "warn"
    };
    logging::init(cli.log_json, directives);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;

    match cli.command {
        Commands::Serve { port, bind } => {
            let db = Database::open(&config.db_path)?;
            let settings = ServerSettings::from_env(&config)?;
            server::start_server(db, settings, port, &bind).await
        }
        Commands::Register {
            username,
            email,
            password,
            goal,
            server,
            json,
        } => cmd_register(&config, &server, &username, &email, password, goal, json).await,
        Commands::Login {
            username,
            password,
            server,
            json,
        } => cmd_login(&config, &server, &username, password, json).await,
        Commands::Logout { json } => cmd_logout(&config, json),
        Commands::Me { json } => cmd_me(&config, json).await,
        Commands::Goal { calories, json } => cmd_goal(&config, calories, json).await,
        Commands::Log {
            food,
            serving,
            weight,
            calories,
            protein,
            carbs,
            fats,
            json,
        } => {
            let req = ManualFoodRequest {
                food_name: food,
                serving_size: serving,
                serving_weight: weight,
                calories,
                protein,
                carbs,
                fats,
            };
            cmd_log(&config, &req, json).await
        }
        Commands::Scan { image, hint, json } => cmd_scan(&config, &image, hint, json).await,
        Commands::Recipe { text, file, json } => {
            cmd_recipe(&config, text, file.as_deref(), json).await
        }
        Commands::Search { query, save, json } => cmd_search(&config, &query, save, json).await,
        Commands::Today { json } => cmd_today(&config, json).await,
        Commands::History { date, json } => cmd_history(&config, date, json).await,
        Commands::Stats { date, json } => cmd_stats(&config, date, json).await,
        Commands::Update {
            entry_id,
            name,
            serving,
            weight,
            json,
        } => {
            let req = UpdateFoodRequest {
                food_name: name,
                serving_size: serving,
                serving_weight: weight,
            };
            cmd_update(&config, entry_id, &req, json).await
        }
        Commands::Delete { entry_id, json } => cmd_delete(&config, entry_id, json).await,
    }
}
