//! Common types for the TrainJob operator: CRDs, errors, events, and metrics

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name reported by the controller in events and field managers
pub const CONTROLLER_NAME: &str = "trainops-operator";

/// API group owning the TrainJob resource
pub const GROUP_NAME: &str = "trainops.dev";

/// Label carrying the replica type (chief, master, worker, ps, evaluator)
pub const LABEL_REPLICA_TYPE: &str = "replica-type";

/// Label carrying the replica slot index within its type
pub const LABEL_REPLICA_INDEX: &str = "replica-index";

/// Label carrying the owning API group
pub const LABEL_GROUP_NAME: &str = "group-name";

/// Deprecated job-name label. Retained for compatibility with older selectors.
pub const LABEL_JOB_NAME: &str = "job-name";

/// Label marking the pod elected to the master role
pub const LABEL_JOB_ROLE: &str = "job-role";

/// Value of [`LABEL_JOB_ROLE`] on the elected master pod
pub const JOB_ROLE_MASTER: &str = "master";

/// Name of the training container the controller manages
pub const DEFAULT_CONTAINER_NAME: &str = "tensorflow";

/// Default port exposed by each replica for in-cluster RPC
pub const DEFAULT_PORT: i32 = 2222;

/// Name of the default container port
pub const DEFAULT_PORT_NAME: &str = "trainjob-port";
