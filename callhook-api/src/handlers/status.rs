use axum::extract::State;
use axum::Json;
use serde_derive::Serialize;
use serde_json::{json, Value};
use sysinfo::{MemoryRefreshKind, System};

use super::AppState;

const MEMORY_WARNING_MB: f64 = 400.0;

#[derive(Serialize)]
pub struct Health {
    ok: bool,
    realtime_dids: usize,
}

pub async fn healthz(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        ok: true,
        realtime_dids: state.cache.len(),
    })
}

struct MemoryUsage {
    process_mb: f64,
    system_percent: f64,
}

fn memory_usage() -> MemoryUsage {
    let mut sys = System::new();
    sys.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());

    let process_bytes = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| {
            sys.refresh_process(pid);
            sys.process(pid).map(|process| process.memory())
        })
        .unwrap_or_default();

    let total = sys.total_memory();
    let system_percent = if total == 0 {
        0.0
    } else {
        sys.used_memory() as f64 * 100.0 / total as f64
    };

    MemoryUsage {
        process_mb: process_bytes as f64 / (1024.0 * 1024.0),
        system_percent,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub async fn debug_stats(State(state): State<AppState>) -> Json<Value> {
    let processed_calls = match state.ingestor.ledger().len().await {
        Ok(count) => count,
        Err(e) => return Json(json!({"status": "error", "error": e.to_string()})),
    };

    let campaign_filtering = if state.campaigns.is_empty() {
        Value::from("None")
    } else {
        Value::from(state.campaigns.campaigns().collect::<Vec<_>>())
    };

    let memory = memory_usage();

    Json(json!({
        "status": "ok",
        "processed_calls": processed_calls,
        "queue_size": state.ingestor.pending().await,
        "realtime_dids": state.cache.len(),
        "campaign_filtering": campaign_filtering,
        "google_sheets_configured": state.store_configured,
        "memory_usage_mb": round2(memory.process_mb),
        "memory_percent": round2(memory.system_percent),
        "memory_warning": memory.process_mb > MEMORY_WARNING_MB,
    }))
}
