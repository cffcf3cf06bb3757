use axum::{extract::State, routing::get, Json, Router};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::entities::preferences::AutoApproveMode;
use crate::errors::ServiceError;
use crate::AppState;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PreferencesBody {
    pub site_name: String,
    pub auto_approve_mode: AutoApproveMode,
    /// Required when mode is `auto_approve_below`
    pub auto_approve_limit: Option<Decimal>,
}

/// Current approval-policy settings. Before any settings have been saved the
/// defaults apply: every order needs manual approval.
#[utoipa::path(
    get,
    path = "/api/v1/preferences",
    responses((status = 200, description = "Current preferences", body = PreferencesBody)),
    tag = "preferences"
)]
pub async fn get_preferences(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PreferencesBody>, ServiceError> {
    let body = match state.services.preferences.get().await? {
        Some(prefs) => PreferencesBody {
            site_name: prefs.site_name,
            auto_approve_mode: prefs.auto_approve_mode,
            auto_approve_limit: prefs.auto_approve_limit,
        },
        None => PreferencesBody {
            site_name: String::new(),
            auto_approve_mode: AutoApproveMode::default(),
            auto_approve_limit: None,
        },
    };
    Ok(Json(body))
}

#[utoipa::path(
    put,
    path = "/api/v1/preferences",
    request_body = PreferencesBody,
    responses(
        (status = 200, description = "Preferences saved", body = PreferencesBody),
        (status = 400, description = "Invalid preferences")
    ),
    tag = "preferences"
)]
pub async fn put_preferences(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PreferencesBody>,
) -> Result<Json<PreferencesBody>, ServiceError> {
    let saved = state
        .services
        .preferences
        .upsert(body.site_name, body.auto_approve_mode, body.auto_approve_limit)
        .await?;

    Ok(Json(PreferencesBody {
        site_name: saved.site_name,
        auto_approve_mode: saved.auto_approve_mode,
        auto_approve_limit: saved.auto_approve_limit,
    }))
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/preferences", get(get_preferences).put(put_preferences))
}
