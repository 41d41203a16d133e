//! Reconciliation core for the TrainJob operator
//!
//! A level-triggered control loop that diffs declared replica groups against
//! observed pods and per-pod services, injects cluster topology into created
//! pods, enforces backoff/deadline/restart policies, coordinates with a gang
//! scheduler, and publishes status back to the TrainJob resource.
//!
//! The core consumes three seams wired in by the binary: a [`store::Store`]
//! (cache snapshots), a [`store::Mutator`] (cluster writes), and an event
//! publisher. Everything else in this crate is deterministic logic over
//! those seams, which is what the test suite exercises.

pub mod config;
pub mod dispatcher;
pub mod expectations;
pub mod fake;
pub mod job;
pub mod meta;
pub mod pod;
pub mod podgroup;
pub mod queue;
pub mod service;
pub mod slots;
pub mod status;
pub mod store;
pub mod tf_config;

pub use config::ControllerConfig;
pub use dispatcher::Dispatcher;
pub use expectations::{Expectations, ResourceKind};
pub use job::JobReconciler;
pub use queue::WorkQueue;
pub use store::{KubeMutator, KubeStore, Mutator, Store};
