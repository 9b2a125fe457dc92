use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::reconcile::ReconcileError;

use super::AppState;

pub async fn refresh_map(State(state): State<AppState>) -> Result<Json<Value>, ReconcileError> {
    let summary = state.reconciler.run().await?;

    Ok(Json(json!({
        "status": "success",
        "did_count": summary.did_count,
        "publisher_count": summary.publisher_count,
    })))
}
