//! Role CRUD HTTP API
//!
//! Served on `role_api_port`, independent of the audio path. The core only
//! reads the current default role; everything else exists for management
//! frontends.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::{Role, RoleStore};

#[derive(Debug, Deserialize)]
pub struct RolePayload {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub voice: String,
}

impl RolePayload {
    fn into_role(self) -> (Option<String>, Role) {
        let id = self.id.clone();
        (
            id,
            Role {
                name: self.name,
                description: self.description,
                prompt: self.prompt,
                voice: self.voice,
                is_default: false,
            },
        )
    }
}

pub fn router(store: Arc<RoleStore>) -> Router {
    Router::new()
        .route("/api/roles", get(list_roles).post(create_role))
        .route("/api/roles/default", get(get_default))
        .route(
            "/api/roles/{id}",
            get(get_role).put(update_role).delete(delete_role),
        )
        .route("/api/roles/{id}/default", post(set_default))
        .with_state(store)
}

async fn list_roles(State(store): State<Arc<RoleStore>>) -> impl IntoResponse {
    Json(json!({ "roles": store.all() }))
}

async fn get_role(
    State(store): State<Arc<RoleStore>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match store.get(&id) {
        Some(role) => (StatusCode::OK, Json(json!({ "role": role }))),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "role not found" }))),
    }
}

async fn create_role(
    State(store): State<Arc<RoleStore>>,
    Json(payload): Json<RolePayload>,
) -> impl IntoResponse {
    let (id, role) = payload.into_role();
    let id = id.unwrap_or_else(|| role.name.to_lowercase().replace(' ', "_"));
    if !store.add(&id, role.clone()) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("role id {id:?} already exists") })),
        );
    }
    (StatusCode::CREATED, Json(json!({ "id": id, "role": role })))
}

async fn update_role(
    State(store): State<Arc<RoleStore>>,
    Path(id): Path<String>,
    Json(payload): Json<RolePayload>,
) -> impl IntoResponse {
    let (_, role) = payload.into_role();
    match store.update(&id, role) {
        Some(updated) => (StatusCode::OK, Json(json!({ "id": id, "role": updated }))),
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "role not found" }))),
    }
}

async fn delete_role(
    State(store): State<Arc<RoleStore>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if store.delete(&id) {
        (StatusCode::OK, Json(json!({ "success": true })))
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "role not found or is the default role" })),
        )
    }
}

async fn get_default(State(store): State<Arc<RoleStore>>) -> impl IntoResponse {
    match store.default_role() {
        Some((id, role)) => (StatusCode::OK, Json(json!({ "id": id, "role": role }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no default role set" })),
        ),
    }
}

async fn set_default(
    State(store): State<Arc<RoleStore>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if store.set_default(&id) {
        (StatusCode::OK, Json(json!({ "success": true })))
    } else {
        (StatusCode::NOT_FOUND, Json(json!({ "error": "role not found" })))
    }
}
