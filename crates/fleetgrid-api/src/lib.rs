//! fleetgrid-api — REST control surface.
//!
//! The callback half of the launch gate (instances report bootstrap
//! completion and heartbeats here, the way user-data scripts call a
//! complete-lifecycle-action endpoint) plus operator control over the
//! capacity envelope and read access to the fleet.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/lifecycle/complete` | Resolve an instance's launch hold |
//! | POST | `/api/v1/lifecycle/heartbeat` | Extend an instance's launch hold |
//! | GET | `/api/v1/group` | Current capacity configuration |
//! | PUT | `/api/v1/group` | Replace capacity configuration (validated) |
//! | GET | `/api/v1/instances` | List instance records |
//! | GET | `/api/v1/instances/{id}` | Get one instance record |
//! | GET | `/api/v1/warm-pool` | List parked warm-pool entries |
//! | POST | `/api/v1/reconcile` | Trigger an immediate reconcile pass |

pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post, put};
use axum::Router;
use tokio::sync::Notify;

use fleetgrid_hooks::LifecycleHookCoordinator;
use fleetgrid_state::StateStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub hooks: Arc<LifecycleHookCoordinator>,
    /// Nudges the scaling controller's reconcile loop.
    pub reconcile: Arc<Notify>,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/lifecycle/complete", post(handlers::complete_lifecycle))
        .route("/lifecycle/heartbeat", post(handlers::heartbeat_lifecycle))
        .route("/group", get(handlers::get_group))
        .route("/group", put(handlers::put_group))
        .route("/instances", get(handlers::list_instances))
        .route("/instances/{id}", get(handlers::get_instance))
        .route("/warm-pool", get(handlers::list_warm_pool))
        .route("/reconcile", post(handlers::trigger_reconcile))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
