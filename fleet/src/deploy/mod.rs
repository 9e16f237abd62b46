//! Deployment module

pub mod coordinator;
pub mod fsm;
pub mod plan;
pub mod progress;
pub mod rollback;
pub mod tester;
pub mod worker;

pub use coordinator::{
    ActiveGuard, ActiveTargets, BatchFeed, BatchHandle, BatchSnapshot, CoordinatorOptions,
    DeploymentCoordinator,
};
pub use progress::ProgressView;
pub use rollback::RollbackController;
pub use tester::ConnectionTester;
pub use worker::DeploymentWorker;
