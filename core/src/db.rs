use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{
    DailyStats, FoodEntry, FoodEntryPatch, NewFoodEntry, NewUser, User, validate_calorie_goal,
    validate_new_entry, validate_patch,
};
use crate::serving::{apply_patch, weight_from_label};

const DATE_FORMAT: &str = "%Y-%m-%d";

const ENTRY_COLUMNS: &str = "id, user_id, food_name, calories, protein, carbs, fats, serving_size,
     serving_weight, entry_type, image_data, recipe_text, confidence, timestamp, date";

pub struct Database {
    conn: Connection,
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn text_conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS users (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    username TEXT NOT NULL UNIQUE,
                    email TEXT NOT NULL UNIQUE,
                    password_hash TEXT NOT NULL,
                    daily_calorie_goal INTEGER NOT NULL DEFAULT 2000,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS food_entries (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id INTEGER NOT NULL REFERENCES users(id),
                    food_name TEXT NOT NULL,
                    calories REAL NOT NULL,
                    protein REAL NOT NULL DEFAULT 0,
                    carbs REAL NOT NULL DEFAULT 0,
                    fats REAL NOT NULL DEFAULT 0,
                    serving_size TEXT NOT NULL,
                    serving_weight REAL,
                    entry_type TEXT NOT NULL,
                    image_data BLOB,
                    recipe_text TEXT,
                    confidence TEXT,
                    timestamp TEXT NOT NULL,
                    date TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_food_entries_user_date ON food_entries(user_id, date);

                PRAGMA user_version = 1;",
            )?;
        }

        Ok(())
    }

    // --- Users ---

    fn user_from_row(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            daily_calorie_goal: row.get(4)?,
            created_at: row.get(5)?,
        })
    }

    pub fn insert_user(&self, user: &NewUser) -> Result<User> {
        let username = user.username.trim();
        let email = user.email.trim();
        if username.is_empty() {
            bail!("Username must not be empty");
        }
        if !email.contains('@') {
            bail!("Invalid email address '{email}'");
        }
        validate_calorie_goal(user.daily_calorie_goal)?;
        if self.username_taken(username)? {
            bail!("Username already registered");
        }
        if self.email_taken(email)? {
            bail!("Email already registered");
        }

        let now = format_timestamp(&Utc::now());
        self.conn.execute(
            "INSERT INTO users (username, email, password_hash, daily_calorie_goal, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                username,
                email,
                user.password_hash,
                user.daily_calorie_goal,
                now
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_user(id)?.context("User not found after insert")
    }

    pub fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, username, email, password_hash, daily_calorie_goal, created_at
                 FROM users WHERE id = ?1",
                params![id],
                Self::user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .conn
            .query_row(
                "SELECT id, username, email, password_hash, daily_calorie_goal, created_at
                 FROM users WHERE username = ?1",
                params![username],
                Self::user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    pub fn username_taken(&self, username: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE username = ?1",
            params![username],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn email_taken(&self, email: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM users WHERE lower(email) = lower(?1)",
            params![email],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Returns false when the user does not exist.
    pub fn set_calorie_goal(&self, user_id: i64, goal: i64) -> Result<bool> {
        validate_calorie_goal(goal)?;
        let rows = self.conn.execute(
            "UPDATE users SET daily_calorie_goal = ?1 WHERE id = ?2",
            params![goal, user_id],
        )?;
        Ok(rows > 0)
    }

    // --- Food entries ---

    // Expects ENTRY_COLUMNS order.
    fn food_entry_from_row(row: &rusqlite::Row) -> rusqlite::Result<FoodEntry> {
        let timestamp: String = row.get(13)?;
        let timestamp = DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| text_conversion_error(13, e))?
            .with_timezone(&Utc);
        let date: String = row.get(14)?;
        let date =
            NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| text_conversion_error(14, e))?;

        Ok(FoodEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            food_name: row.get(2)?,
            calories: row.get(3)?,
            protein: row.get(4)?,
            carbs: row.get(5)?,
            fats: row.get(6)?,
            serving_size: row.get(7)?,
            serving_weight: row.get(8)?,
            entry_type: row.get(9)?,
            image_data: row.get(10)?,
            recipe_text: row.get(11)?,
            confidence: row.get(12)?,
            timestamp,
            date,
        })
    }

    pub fn insert_food_entry(&self, entry: &NewFoodEntry) -> Result<FoodEntry> {
        validate_new_entry(entry)?;
        let calories = entry.calories.context("calories is required")?;
        let serving_weight = entry
            .serving_weight
            .or_else(|| weight_from_label(&entry.serving_size));
        let date = entry.date().format(DATE_FORMAT).to_string();

        self.conn.execute(
            "INSERT INTO food_entries (user_id, food_name, calories, protein, carbs, fats,
                serving_size, serving_weight, entry_type, image_data, recipe_text, confidence,
                timestamp, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                entry.user_id,
                entry.food_name.trim(),
                calories,
                entry.protein,
                entry.carbs,
                entry.fats,
                entry.serving_size.trim(),
                serving_weight,
                entry.entry_type,
                entry.image_data,
                entry.recipe_text,
                entry.confidence,
                format_timestamp(&entry.timestamp),
                date,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_food_entry(id, entry.user_id)?
            .context("Food entry not found after insert")
    }

    /// Fetch an entry owned by `owner`. Entries of other users are reported
    /// as absent.
    pub fn get_food_entry(&self, id: i64, owner: i64) -> Result<Option<FoodEntry>> {
        let entry = self
            .conn
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM food_entries WHERE id = ?1 AND user_id = ?2"),
                params![id, owner],
                Self::food_entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Apply a partial update. Returns `None` when the entry is missing or
    /// belongs to another user.
    pub fn update_food_entry(
        &self,
        id: i64,
        owner: i64,
        patch: &FoodEntryPatch,
    ) -> Result<Option<FoodEntry>> {
        let Some(existing) = self.get_food_entry(id, owner)? else {
            return Ok(None);
        };
        validate_patch(patch)?;
        if patch.is_empty() {
            return Ok(Some(existing));
        }

        let updated = apply_patch(&existing, patch);
        self.conn.execute(
            "UPDATE food_entries
             SET food_name = ?1, serving_size = ?2, serving_weight = ?3,
                 calories = ?4, protein = ?5, carbs = ?6, fats = ?7
             WHERE id = ?8 AND user_id = ?9",
            params![
                updated.food_name,
                updated.serving_size,
                updated.serving_weight,
                updated.calories,
                updated.protein,
                updated.carbs,
                updated.fats,
                id,
                owner,
            ],
        )?;
        self.get_food_entry(id, owner)
    }

    /// Returns false when the entry is missing or belongs to another user.
    pub fn delete_food_entry(&self, id: i64, owner: i64) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM food_entries WHERE id = ?1 AND user_id = ?2",
            params![id, owner],
        )?;
        Ok(rows > 0)
    }

    /// All entries `owner` logged on `date` (UTC), oldest first.
    pub fn list_entries_by_date(&self, owner: i64, date: NaiveDate) -> Result<Vec<FoodEntry>> {
        let date_str = date.format(DATE_FORMAT).to_string();
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM food_entries
             WHERE user_id = ?1 AND date = ?2
             ORDER BY timestamp, id"
        ))?;
        let entries = stmt
            .query_map(params![owner, date_str], Self::food_entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn compute_daily_stats(&self, owner: i64, date: NaiveDate, goal: i64) -> Result<DailyStats> {
        let entries = self.list_entries_by_date(owner, date)?;
        Ok(DailyStats::compute(date, &entries, goal))
    }
}
