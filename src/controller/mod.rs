pub mod apiservice;
pub mod apply;
pub mod context;
pub mod copied;
pub mod error;
pub mod events;
pub mod gc;
pub mod install;
pub mod olm_config;
pub mod orphans;
pub mod reconciler;
pub mod requirements;
pub mod state_machine;
pub mod status;

pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use requirements::{ClusterLookup, KubeLookup};
pub use state_machine::{ComponentHealth, CsvEvent, CsvStateMachine, TransitionContext};
pub use status::{ConditionBuilder, StatusManager};
