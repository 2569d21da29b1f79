//! Typed client for the REST API.
//!
//! There is no ambient login state: a [`Session`] is loaded from disk by the
//! caller and handed to every authenticated request.

use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::api::{
    AnalyzeImageRequest, AnalyzeRecipeRequest, ErrorResponse, LoginRequest,
    ManualFoodRequest, Profile, RegisterRequest, SearchRequest, TokenResponse, UpdateFoodRequest,
    UpdateGoalRequest,
};
use crate::config::restrict_permissions;
use healthism_core::estimator::NutritionEstimate;
use healthism_core::models::{DailyStats, FoodEntry};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A logged-in user's credentials for one server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub server_url: String,
    pub username: String,
    pub access_token: String,
}

impl Session {
    pub fn load(path: &Path) -> Result<Option<Session>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))?;
        let session = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt session file: {}", path.display()))?;
        Ok(Some(session))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .with_context(|| format!("Failed to write session file: {}", path.display()))?;
        file.write_all(raw.as_bytes())
            .with_context(|| format!("Failed to write session file: {}", path.display()))?;
        // mode only applies on create; tighten an older file too
        restrict_permissions(path)
    }

    /// Remove the session file. Returns false if there was none.
    pub fn clear(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove session file: {}", path.display()))?;
        Ok(true)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}. Run `healthism login` to sign in again")]
    Auth(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Upstream(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("Could not reach server: {0}")]
    Transport(String),
    #[error("Unexpected response from server: {0}")]
    Decode(String),
}

/// Map a non-success response to the matching error kind.
fn error_for_status(status: StatusCode, body: &str) -> ClientError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error)
        .ok()
        .filter(|m| !m.is_empty())
        .or_else(|| Some(body.trim().to_string()).filter(|b| !b.is_empty()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("Unknown error")
                .to_string()
        });

    match status {
        StatusCode::BAD_REQUEST => ClientError::Validation(message),
        StatusCode::UNAUTHORIZED => ClientError::Auth(message),
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => ClientError::NotFound(message),
        StatusCode::BAD_GATEWAY => ClientError::Upstream(message),
        StatusCode::GATEWAY_TIMEOUT => ClientError::Timeout(message),
        _ => ClientError::Server {
            status: status.as_u16(),
            message,
        },
    }
}

fn transport_error(err: &reqwest::Error) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(err.to_string())
    } else {
        ClientError::Transport(err.to_string())
    }
}

pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("healthism-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Client for the server a session was issued by.
    pub fn for_session(session: &Session) -> Result<Self> {
        Self::new(&session.server_url)
    }

    fn request(&self, method: Method, path: &str, session: Option<&Session>) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match session {
            Some(s) => builder.bearer_auth(&s.access_token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, ClientError> {
        let resp = builder.send().await.map_err(|e| transport_error(&e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), "request failed");
        Err(error_for_status(status, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ClientError> {
        let resp = self.send(builder).await?;
        resp.json().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(e.to_string())
            } else {
                ClientError::Decode(e.to_string())
            }
        })
    }

    fn session_for(&self, username: &str, token: TokenResponse) -> Session {
        Session {
            server_url: self.base_url.clone(),
            username: username.to_string(),
            access_token: token.access_token,
        }
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<Session, ClientError> {
        let token: TokenResponse = self
            .send_json(
                self.request(Method::POST, "/api/auth/register", None)
                    .json(req),
            )
            .await?;
        Ok(self.session_for(req.username.trim(), token))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<Session, ClientError> {
        let req = LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        };
        let token: TokenResponse = self
            .send_json(self.request(Method::POST, "/api/auth/login", None).json(&req))
            .await?;
        Ok(self.session_for(username.trim(), token))
    }

    pub async fn me(&self, session: &Session) -> Result<Profile, ClientError> {
        self.send_json(self.request(Method::GET, "/api/auth/me", Some(session)))
            .await
    }

    pub async fn update_goal(&self, session: &Session, goal: i64) -> Result<Profile, ClientError> {
        self.send_json(
            self.request(Method::PUT, "/api/auth/update-goal", Some(session))
                .json(&UpdateGoalRequest {
                    daily_calorie_goal: goal,
                }),
        )
        .await
    }

    pub async fn log_manual(
        &self,
        session: &Session,
        req: &ManualFoodRequest,
    ) -> Result<FoodEntry, ClientError> {
        self.send_json(
            self.request(Method::POST, "/api/food/manual", Some(session))
                .json(req),
        )
        .await
    }

    pub async fn analyze_image(
        &self,
        session: &Session,
        req: &AnalyzeImageRequest,
    ) -> Result<FoodEntry, ClientError> {
        self.send_json(
            self.request(Method::POST, "/api/food/analyze-image", Some(session))
                .json(req),
        )
        .await
    }

    pub async fn analyze_recipe(
        &self,
        session: &Session,
        recipe_text: &str,
    ) -> Result<FoodEntry, ClientError> {
        self.send_json(
            self.request(Method::POST, "/api/food/analyze-recipe", Some(session))
                .json(&AnalyzeRecipeRequest {
                    recipe_text: recipe_text.to_string(),
                }),
        )
        .await
    }

    /// Estimate without storing anything.
    pub async fn search(
        &self,
        session: &Session,
        query: &str,
    ) -> Result<NutritionEstimate, ClientError> {
        self.send_json(
            self.request(Method::POST, "/api/food/search", Some(session))
                .json(&SearchRequest {
                    query: query.to_string(),
                    save: false,
                }),
        )
        .await
    }

    /// Estimate and log the result as a `search` entry.
    pub async fn search_and_save(
        &self,
        session: &Session,
        query: &str,
    ) -> Result<FoodEntry, ClientError> {
        self.send_json(
            self.request(Method::POST, "/api/food/search", Some(session))
                .json(&SearchRequest {
                    query: query.to_string(),
                    save: true,
                }),
        )
        .await
    }

    pub async fn today(&self, session: &Session) -> Result<Vec<FoodEntry>, ClientError> {
        self.send_json(self.request(Method::GET, "/api/food/today", Some(session)))
            .await
    }

    pub async fn history(
        &self,
        session: &Session,
        date: NaiveDate,
    ) -> Result<Vec<FoodEntry>, ClientError> {
        self.send_json(
            self.request(Method::GET, "/api/food/history", Some(session))
                .query(&[("date", date.format("%Y-%m-%d").to_string())]),
        )
        .await
    }

    pub async fn daily_stats(
        &self,
        session: &Session,
        date: NaiveDate,
    ) -> Result<DailyStats, ClientError> {
        self.send_json(
            self.request(Method::GET, "/api/stats/daily", Some(session))
                .query(&[("date", date.format("%Y-%m-%d").to_string())]),
        )
        .await
    }

    pub async fn update_entry(
        &self,
        session: &Session,
        id: i64,
        req: &UpdateFoodRequest,
    ) -> Result<FoodEntry, ClientError> {
        self.send_json(
            self.request(Method::PUT, &format!("/api/food/{id}"), Some(session))
                .json(req),
        )
        .await
    }

    pub async fn delete_entry(&self, session: &Session, id: i64) -> Result<(), ClientError> {
        self.send(self.request(Method::DELETE, &format!("/api/food/{id}"), Some(session)))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{Behaviour, FakeEstimator, biryani, spawn_app};
    use std::sync::Arc;

    fn register_request(username: &str) -> RegisterRequest {
        RegisterRequest {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password: "hunter22".to_string(),
            daily_calorie_goal: 2000,
        }
    }

    async fn signed_in() -> (ApiClient, Session) {
        let url = spawn_app(Arc::new(FakeEstimator::replying(biryani()))).await;
        let client = ApiClient::new(&url).unwrap();
        let session = client.register(&register_request("asha")).await.unwrap();
        (client, session)
    }

    #[test]
    fn test_error_for_status_mapping() {
        let body = r#"{"error": "food_name is required"}"#;
        assert!(matches!(
            error_for_status(StatusCode::BAD_REQUEST, body),
            ClientError::Validation(m) if m == "food_name is required"
        ));
        assert!(matches!(
            error_for_status(StatusCode::UNAUTHORIZED, body),
            ClientError::Auth(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::FORBIDDEN, body),
            ClientError::NotFound(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::NOT_FOUND, body),
            ClientError::NotFound(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::BAD_GATEWAY, body),
            ClientError::Upstream(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::GATEWAY_TIMEOUT, body),
            ClientError::Timeout(_)
        ));
        assert!(matches!(
            error_for_status(StatusCode::INTERNAL_SERVER_ERROR, ""),
            ClientError::Server { status: 500, message } if message == "Internal Server Error"
        ));
        assert!(matches!(
            error_for_status(StatusCode::SERVICE_UNAVAILABLE, "down for maintenance"),
            ClientError::Server { status: 503, message } if message == "down for maintenance"
        ));
    }

    #[test]
    fn test_session_save_load_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.json");

        assert!(Session::load(&path).unwrap().is_none());
        assert!(!Session::clear(&path).unwrap());

        let session = Session {
            server_url: "http://127.0.0.1:8001".to_string(),
            username: "asha".to_string(),
            access_token: "token".to_string(),
        };
        session.save(&path).unwrap();
        assert_eq!(Session::load(&path).unwrap(), Some(session));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        assert!(Session::clear(&path).unwrap());
        assert!(Session::load(&path).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_session_save_tightens_existing_file() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.json");
        std::fs::write(&path, "stale contents that are longer than the new session").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        let session = Session {
            server_url: "http://127.0.0.1:8001".to_string(),
            username: "asha".to_string(),
            access_token: "t".to_string(),
        };
        session.save(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(Session::load(&path).unwrap(), Some(session));
    }

    #[test]
    fn test_corrupt_session_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Session::load(&path).is_err());
    }

    #[tokio::test]
    async fn test_register_login_me() {
        let (client, session) = signed_in().await;
        assert_eq!(session.username, "asha");
        assert!(session.server_url.starts_with("http://127.0.0.1:"));

        let profile = client.me(&session).await.unwrap();
        assert_eq!(profile.email, "asha@example.com");

        let again = client.login("asha", "hunter22").await.unwrap();
        assert_eq!(client.me(&again).await.unwrap(), profile);

        let err = client.login("asha", "nope").await.unwrap_err();
        assert!(matches!(err, ClientError::Auth(_)));
    }

    #[tokio::test]
    async fn test_stale_session_is_auth_error() {
        let (client, session) = signed_in().await;
        let stale = Session {
            access_token: "expired".to_string(),
            ..session
        };
        assert!(matches!(client.today(&stale).await, Err(ClientError::Auth(_))));
    }

    #[tokio::test]
    async fn test_log_list_update_delete() {
        let (client, session) = signed_in().await;

        let entry = client
            .log_manual(
                &session,
                &ManualFoodRequest {
                    food_name: "Chicken Biryani (approx. 250g)".to_string(),
                    serving_size: Some("1 large bowl (250g)".to_string()),
                    calories: Some(480.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let today = client.today(&session).await.unwrap();
        assert_eq!(today, vec![entry.clone()]);
        let history = client.history(&session, entry.date).await.unwrap();
        assert_eq!(history.len(), 1);

        let stats = client.daily_stats(&session, entry.date).await.unwrap();
        assert_eq!(stats.entries_count, 1);
        assert!((stats.remaining_calories - 1520.0).abs() < 0.01);

        let updated = client
            .update_entry(
                &session,
                entry.id,
                &UpdateFoodRequest {
                    serving_weight: Some(100.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.serving_size, "large bowl (100g)");

        client.delete_entry(&session, entry.id).await.unwrap();
        let err = client.delete_entry(&session, entry.id).await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_validation_error_surfaces_message() {
        let (client, session) = signed_in().await;
        let err = client
            .log_manual(&session, &ManualFoodRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Validation(ref m) if m == "food_name is required"));
    }

    #[tokio::test]
    async fn test_search_with_and_without_save() {
        let (client, session) = signed_in().await;

        let estimate = client.search(&session, "biryani").await.unwrap();
        assert_eq!(estimate, biryani());
        assert!(client.today(&session).await.unwrap().is_empty());

        let entry = client.search_and_save(&session, "biryani").await.unwrap();
        assert_eq!(entry.entry_type, healthism_core::models::EntryType::Search);
        assert_eq!(client.today(&session).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_estimator_timeout_is_timeout_error() {
        let url = spawn_app(Arc::new(FakeEstimator::new(Behaviour::Timeout))).await;
        let client = ApiClient::new(&url).unwrap();
        let session = client.register(&register_request("asha")).await.unwrap();

        let err = client.analyze_recipe(&session, "rice, dal").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        // nothing listens on the discard port
        let client = ApiClient::new("http://127.0.0.1:9").unwrap();
        let err = client.login("asha", "hunter22").await.unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
    }
}
