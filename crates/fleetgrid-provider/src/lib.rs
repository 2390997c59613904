//! fleetgrid-provider — the seams to the outside world.
//!
//! The controller core never talks to a cloud SDK directly. Everything it
//! needs from the environment is expressed as two narrow async traits:
//!
//! - [`CloudProvider`] — launch, terminate, describe instances
//! - [`TargetGroup`] — register/deregister traffic targets, read target health
//!
//! Calls through these seams are wrapped in [`retry::RetryPolicy`]: bounded
//! attempts, exponential backoff, a per-call timeout, and transient-only
//! retry classification. [`sim::SimCloud`] implements both traits in memory
//! for tests and local runs.

pub mod error;
pub mod retry;
pub mod sim;

pub use error::{ProviderError, ProviderResult};
pub use retry::RetryPolicy;
pub use sim::SimCloud;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleetgrid_state::{HealthStatus, InstanceId};

/// Launch parameters handed to the provider.
///
/// Placement fields (`availability_zones`, `subnet_ids`) and the bootstrap
/// payload (`user_data`) are opaque to the controller — it carries them,
/// it never interprets them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchSpec {
    pub instance_type: String,
    pub availability_zones: Vec<String>,
    pub subnet_ids: Vec<String>,
    pub user_data: Option<String>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            instance_type: "t2.micro".to_string(),
            availability_zones: Vec::new(),
            subnet_ids: Vec::new(),
            user_data: None,
        }
    }
}

/// Provider-side view of an instance, as reported by `describe_instances`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DescribedInstance {
    pub id: InstanceId,
    pub state: RemoteState,
}

/// Coarse instance state at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Pending,
    Running,
    Stopped,
    Terminated,
}

/// Compute provider seam: the only way the controller creates or destroys
/// capacity.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Request a new instance. Returns the provider-assigned id.
    async fn launch_instance(&self, spec: &LaunchSpec) -> ProviderResult<InstanceId>;

    /// Request termination of an instance.
    async fn terminate_instance(&self, id: &InstanceId) -> ProviderResult<()>;

    /// Enumerate instances as the provider sees them.
    async fn describe_instances(&self) -> ProviderResult<Vec<DescribedInstance>>;
}

/// Load-balancer target set seam.
#[async_trait]
pub trait TargetGroup: Send + Sync {
    /// Attach instances to the traffic-receiving target set.
    async fn register_targets(&self, ids: &[InstanceId]) -> ProviderResult<()>;

    /// Detach instances from the target set.
    async fn deregister_targets(&self, ids: &[InstanceId]) -> ProviderResult<()>;

    /// Health of each registered target.
    async fn describe_target_health(
        &self,
    ) -> ProviderResult<HashMap<InstanceId, HealthStatus>>;

    /// Currently registered target ids.
    async fn registered_targets(&self) -> ProviderResult<Vec<InstanceId>>;
}

/// Shared handle to a provider implementation.
pub type DynProvider = Arc<dyn CloudProvider>;

/// Shared handle to a target group implementation.
pub type DynTargetGroup = Arc<dyn TargetGroup>;
