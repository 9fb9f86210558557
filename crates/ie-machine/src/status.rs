//! Read-only `axum` status surface (§4.10). Off by default; `ie-machined`
//! only serves this when `IE_STATUS_BIND` resolves to a bind address.
//! Never mutates `Machine` state.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::{Machine, MachineConfig};

#[derive(Debug, Serialize)]
struct WorkerStatus {
    cpu_type: u32,
    label: &'static str,
    frozen: bool,
    suspected_stuck: bool,
}

async fn workers(State(machine): State<Arc<Machine>>) -> Json<Vec<WorkerStatus>> {
    let snapshots = machine
        .manager()
        .get_active_workers()
        .into_iter()
        .map(|w| WorkerStatus {
            cpu_type: w.cpu_type.code(),
            label: w.label,
            frozen: w.frozen,
            suspected_stuck: w.suspected_stuck,
        })
        .collect();
    Json(snapshots)
}

async fn config(State(machine): State<Arc<Machine>>) -> Json<MachineConfig> {
    Json(machine.config().clone())
}

pub fn router(machine: Arc<Machine>) -> Router {
    Router::new()
        .route("/status/workers", get(workers))
        .route("/status/config", get(config))
        .with_state(machine)
}
