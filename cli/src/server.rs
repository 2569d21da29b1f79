use std::sync::{Arc, Mutex};

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::api::{
    AnalyzeImageRequest, AnalyzeRecipeRequest, ErrorResponse, HealthResponse, LoginRequest,
    ManualFoodRequest, Profile, RegisterRequest, SearchRequest, TokenResponse, UpdateFoodRequest,
    UpdateGoalRequest,
};
use crate::auth::{AuthError, TokenIssuer, bearer_token, hash_password, verify_password};
use crate::config::ServerSettings;
use crate::openai::OpenAiEstimator;
use healthism_core::db::Database;
use healthism_core::estimator::{
    EstimateError, EstimateInput, NutritionEstimate, NutritionEstimator, manual_prompt,
    recipe_prompt,
};
use healthism_core::models::{
    DEFAULT_SERVING_SIZE, DailyStats, EntryType, FoodEntry, FoodEntryPatch, NewFoodEntry, NewUser,
    sanitize_image_base64, validate_calorie_goal, validate_new_entry, validate_patch,
};
use healthism_core::serving::{align_weight, derive_food_name, weight_from_label};

const BODY_LIMIT: usize = 20 * 1024 * 1024; // 20 MB, room for a camera photo
const SERVICE_NAME: &str = "Healthism Calorie Tracker API";

#[derive(Clone)]
struct AppState {
    db: Arc<Mutex<Database>>,
    estimator: Arc<dyn NutritionEstimator>,
    tokens: Arc<TokenIssuer>,
    password_cost: u32,
}

/// The authenticated caller, loaded fresh for every request.
#[derive(Clone)]
struct CurrentUser {
    id: i64,
    username: String,
    email: String,
    daily_calorie_goal: i64,
}

#[derive(Deserialize)]
struct DateQuery {
    date: Option<String>,
}

// --- Error handling ---

enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    Upstream(String),
    Timeout(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => {
                let mut response =
                    (StatusCode::UNAUTHORIZED, Json(ErrorResponse { error: msg })).into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                return response;
            }
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            Self::Internal(err) => {
                tracing::error!(error = format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::Unauthorized(err.to_string())
    }
}

impl From<EstimateError> for ApiError {
    fn from(err: EstimateError) -> Self {
        match err {
            EstimateError::Timeout => Self::Timeout(err.to_string()),
            EstimateError::Unavailable(_) | EstimateError::Unparsable(_) => {
                Self::Upstream(err.to_string())
            }
        }
    }
}

fn bad_request(err: &anyhow::Error) -> ApiError {
    ApiError::BadRequest(format!("{err}"))
}

fn entry_not_found(id: i64) -> ApiError {
    ApiError::NotFound(format!("Food entry {id} not found"))
}

fn parse_date_param(date: Option<&str>) -> Result<NaiveDate, ApiError> {
    match date {
        None | Some("") => Ok(Utc::now().date_naive()),
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .map_err(|_| ApiError::BadRequest(format!("Invalid date '{d}'. Use YYYY-MM-DD"))),
    }
}

// --- Middleware ---

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let claims = state.tokens.verify(bearer_token(auth_header)?)?;

    let user = {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        db.get_user_by_username(&claims.sub)
            .context("database error")?
    }
    .ok_or(AuthError::Invalid)?;

    request.extensions_mut().insert(CurrentUser {
        id: user.id,
        username: user.username,
        email: user.email,
        daily_calorie_goal: user.daily_calorie_goal,
    });
    Ok(next.run(request).await)
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Shared steps ---

async fn estimate(state: &AppState, input: EstimateInput) -> Result<NutritionEstimate, ApiError> {
    state.estimator.estimate(&input).await.map_err(|e| {
        warn!(error = %e, "nutrition estimate failed");
        ApiError::from(e)
    })
}

fn store_entry(state: &AppState, entry: &NewFoodEntry) -> Result<FoodEntry, ApiError> {
    validate_new_entry(entry).map_err(|e| bad_request(&e))?;
    let db = state
        .db
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let stored = db
        .insert_food_entry(entry)
        .context("failed to insert food entry")?;
    info!(
        entry_id = stored.id,
        entry_type = %stored.entry_type,
        calories = stored.calories,
        "food entry logged"
    );
    Ok(stored)
}

fn non_empty(value: &str, field: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ApiError::BadRequest(format!("{field} is required")));
    }
    Ok(value.to_string())
}

// --- Handlers: public ---

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
    })
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let username = non_empty(&req.username, "username")?;
    let email = non_empty(&req.email, "email")?;
    if !email.contains('@') {
        return Err(ApiError::BadRequest(format!(
            "Invalid email address '{email}'"
        )));
    }
    if req.password.is_empty() {
        return Err(ApiError::BadRequest("password is required".to_string()));
    }
    validate_calorie_goal(req.daily_calorie_goal).map_err(|e| bad_request(&e))?;

    {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if db.username_taken(&username).context("database error")? {
            return Err(ApiError::BadRequest(
                "Username already registered".to_string(),
            ));
        }
        if db.email_taken(&email).context("database error")? {
            return Err(ApiError::BadRequest("Email already registered".to_string()));
        }
    }

    let password_hash = hash_password(req.password, state.password_cost).await?;

    let user = {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // a concurrent registration may have taken the name meanwhile
        db.insert_user(&NewUser {
            username,
            email,
            password_hash,
            daily_calorie_goal: req.daily_calorie_goal,
        })
        .map_err(|e| bad_request(&e))?
    };

    info!(username = %user.username, "user registered");
    let access_token = state.tokens.issue(&user.username)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let rejected = || ApiError::Unauthorized("Incorrect username or password".to_string());

    let user = {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        db.get_user_by_username(req.username.trim())
            .context("database error")?
    }
    .ok_or_else(rejected)?;

    if !verify_password(req.password, user.password_hash.clone()).await? {
        return Err(rejected());
    }

    let access_token = state.tokens.issue(&user.username)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".to_string(),
    }))
}

// --- Handlers: account ---

async fn me(Extension(user): Extension<CurrentUser>) -> Json<Profile> {
    Json(Profile {
        username: user.username,
        email: user.email,
        daily_calorie_goal: user.daily_calorie_goal,
    })
}

async fn update_goal(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<UpdateGoalRequest>,
) -> Result<Json<Profile>, ApiError> {
    validate_calorie_goal(req.daily_calorie_goal).map_err(|e| bad_request(&e))?;
    {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        db.set_calorie_goal(user.id, req.daily_calorie_goal)
            .context("database error")?;
    }
    Ok(Json(Profile {
        username: user.username,
        email: user.email,
        daily_calorie_goal: req.daily_calorie_goal,
    }))
}

// --- Handlers: logging food ---

async fn log_manual(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<ManualFoodRequest>,
) -> Result<(StatusCode, Json<FoodEntry>), ApiError> {
    let food_name = non_empty(&req.food_name, "food_name")?;
    let requested_serving = req
        .serving_size
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let mut entry = if let Some(calories) = req.calories {
        NewFoodEntry {
            protein: req.protein.unwrap_or(0.0),
            carbs: req.carbs.unwrap_or(0.0),
            fats: req.fats.unwrap_or(0.0),
            serving_size: requested_serving.unwrap_or_else(|| DEFAULT_SERVING_SIZE.to_string()),
            serving_weight: req.serving_weight,
            ..NewFoodEntry::new(user.id, &food_name, calories, EntryType::Manual)
        }
    } else {
        let prompt_serving = requested_serving.as_deref().unwrap_or(DEFAULT_SERVING_SIZE);
        let estimate = estimate(
            &state,
            EstimateInput::Text(manual_prompt(&food_name, prompt_serving)),
        )
        .await?;
        let mut entry = estimate.into_new_entry(user.id, EntryType::Manual);
        // the caller's portion wins over the model's
        if let Some(serving) = requested_serving {
            entry.serving_weight = weight_from_label(&serving);
            entry.serving_size = serving;
        }
        if req.serving_weight.is_some() {
            entry.serving_weight = req.serving_weight;
        }
        entry
    };

    if let Some(grams) = entry.serving_weight {
        let (name, label) = align_weight(&entry.food_name, &entry.serving_size, grams);
        entry.food_name = name;
        entry.serving_size = label;
    }

    let entry = store_entry(&state, &entry)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn analyze_image(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<AnalyzeImageRequest>,
) -> Result<(StatusCode, Json<FoodEntry>), ApiError> {
    if req.image_base64.trim().is_empty() {
        return Err(ApiError::BadRequest("image_base64 is required".to_string()));
    }
    let (base64, image_bytes) =
        sanitize_image_base64(&req.image_base64).map_err(|e| bad_request(&e))?;
    let hint = req
        .hint
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());

    let estimate = estimate(&state, EstimateInput::Image { base64, hint }).await?;
    let mut entry = estimate.into_new_entry(user.id, EntryType::Image);
    entry.image_data = Some(image_bytes);

    let entry = store_entry(&state, &entry)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn analyze_recipe(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<AnalyzeRecipeRequest>,
) -> Result<(StatusCode, Json<FoodEntry>), ApiError> {
    let recipe_text = non_empty(&req.recipe_text, "recipe_text")?;

    let estimate = estimate(&state, EstimateInput::Text(recipe_prompt(&recipe_text))).await?;
    let mut entry = estimate.into_new_entry(user.id, EntryType::Recipe);
    entry.recipe_text = Some(recipe_text);

    let entry = store_entry(&state, &entry)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

async fn search_food(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(req): Json<SearchRequest>,
) -> Result<Response, ApiError> {
    let query = non_empty(&req.query, "query")?;
    let estimate = estimate(&state, EstimateInput::Text(query)).await?;

    if !req.save {
        return Ok(Json(estimate).into_response());
    }
    let entry = store_entry(&state, &estimate.into_new_entry(user.id, EntryType::Search))?;
    Ok((StatusCode::CREATED, Json(entry)).into_response())
}

// --- Handlers: reading ---

fn entries_for(state: &AppState, user_id: i64, date: NaiveDate) -> Result<Vec<FoodEntry>, ApiError> {
    let db = state
        .db
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    Ok(db
        .list_entries_by_date(user_id, date)
        .context("database error")?)
}

async fn today(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> Result<Json<Vec<FoodEntry>>, ApiError> {
    let entries = entries_for(&state, user.id, Utc::now().date_naive())?;
    Ok(Json(entries))
}

async fn history(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(params): Query<DateQuery>,
) -> Result<Json<Vec<FoodEntry>>, ApiError> {
    let date = parse_date_param(params.date.as_deref())?;
    let entries = entries_for(&state, user.id, date)?;
    Ok(Json(entries))
}

async fn daily_stats(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(params): Query<DateQuery>,
) -> Result<Json<DailyStats>, ApiError> {
    let date = parse_date_param(params.date.as_deref())?;
    let stats = {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        db.compute_daily_stats(user.id, date, user.daily_calorie_goal)
            .context("database error")?
    };
    Ok(Json(stats))
}

// --- Handlers: editing ---

async fn update_food(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateFoodRequest>,
) -> Result<Json<FoodEntry>, ApiError> {
    if req.is_empty() {
        return Err(ApiError::BadRequest(
            "At least one field must be provided".to_string(),
        ));
    }

    let existing = {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        db.get_food_entry(id, user.id).context("database error")?
    }
    .ok_or_else(|| entry_not_found(id))?;

    let mut patch = FoodEntryPatch {
        food_name: req.food_name,
        serving_size: req.serving_size,
        serving_weight: req.serving_weight,
        ..Default::default()
    };
    validate_patch(&patch).map_err(|e| bad_request(&e))?;

    // A new portion description changes the nutrition, so ask again.
    if let Some(serving_size) = patch.serving_size.as_deref() {
        let food_name = patch
            .food_name
            .clone()
            .unwrap_or_else(|| derive_food_name(&existing.food_name, serving_size));
        let estimate = estimate(
            &state,
            EstimateInput::Text(manual_prompt(&food_name, serving_size)),
        )
        .await?;
        patch.calories = Some(estimate.calories);
        patch.protein = Some(estimate.protein);
        patch.carbs = Some(estimate.carbs);
        patch.fats = Some(estimate.fats);
    }

    let updated = {
        let db = state
            .db
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        db.update_food_entry(id, user.id, &patch)
            .context("failed to update food entry")?
    }
    .ok_or_else(|| entry_not_found(id))?;

    Ok(Json(updated))
}

async fn delete_food(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let db = state
        .db
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if db
        .delete_food_entry(id, user.id)
        .context("database error")?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(entry_not_found(id))
    }
}

fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/me", get(me))
        .route("/api/auth/update-goal", put(update_goal))
        .route("/api/food/manual", post(log_manual))
        .route("/api/food/analyze-image", post(analyze_image))
        .route("/api/food/analyze-recipe", post(analyze_recipe))
        .route("/api/food/search", post(search_food))
        .route("/api/food/today", get(today))
        .route("/api/food/history", get(history))
        .route("/api/food/{id}", put(update_food).delete(delete_food))
        .route("/api/stats/daily", get(daily_stats))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .merge(protected)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    db: Database,
    settings: ServerSettings,
    port: u16,
    bind: &str,
) -> anyhow::Result<()> {
    if settings.estimator.api_key.is_none() {
        warn!("OPENAI_API_KEY is not set; nutrition estimates will fail with 502");
    }
    let estimator = OpenAiEstimator::new(&settings.estimator)?;

    let state = AppState {
        db: Arc::new(Mutex::new(db)),
        estimator: Arc::new(estimator),
        tokens: Arc::new(TokenIssuer::new(
            &settings.secret_key,
            settings.token_expire_minutes,
        )),
        password_cost: bcrypt::DEFAULT_COST,
    };

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}"))
        .await
        .with_context(|| format!("failed to bind {bind}:{port}"))?;
    info!(
        model = %settings.estimator.model,
        "Listening on http://{bind}:{port}"
    );
    axum::serve(listener, app).await?;

    Ok(())
}
