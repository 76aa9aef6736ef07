//! Service layer: registry, cycle runner, delegation, liveness, curation.

pub mod builtin_handlers;
pub mod cancel;
pub mod claim_worker;
pub mod curation;
pub mod cycle_runner;
pub mod daemon;
pub mod delegation;
pub mod liveness;
pub mod registry;
pub mod retry;
pub mod sanitizer;

pub use builtin_handlers::{register_builtin_tasks, BuiltinDeps};
pub use cancel::CancelToken;
pub use claim_worker::{ClaimWorker, TaskWork};
pub use cycle_runner::{exit_code_for, CycleRunner, CycleSummary};
pub use daemon::Daemon;
pub use delegation::{DelegationMessage, DelegationService, MessageDispatcher};
pub use liveness::{
    evaluate_health, FailoverManager, HealthCheckHandler, HealthStatus, InfraHeartbeatSidecar,
};
pub use registry::{
    CycleHandler, HandlerContext, HandlerReport, HeartbeatTask, RegistryFilter, TaskRegistry,
    TicketRoute,
};
pub use retry::{FailurePolicy, RetryPolicy};
pub use sanitizer::Sanitizer;
