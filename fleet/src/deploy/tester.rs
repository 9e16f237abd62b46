//! Connection testing
//!
//! A test either authenticates to the target or reports why it could not.
//! The tester holds no mutable state and never writes target status; callers
//! turn each result into a [`StatusUpdate`](crate::registry::StatusUpdate).

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::models::target::{ServerTarget, ServerTestResult};
use crate::transport::RemoteExecutor;

const AUTH_FAILED_MESSAGE: &str = "SSH authentication failed. Check your SSH key and username.";

/// Checks reachability and credentials of targets
#[derive(Clone)]
pub struct ConnectionTester {
    executor: Arc<dyn RemoteExecutor>,
}

impl ConnectionTester {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Test one target
    pub async fn test(&self, target: &ServerTarget) -> ServerTestResult {
        let (success, message) = match self.executor.check_connection(target).await {
            Ok(true) => (true, format!("Connected to {}", target.address())),
            Ok(false) => (false, AUTH_FAILED_MESSAGE.to_string()),
            Err(e) => (false, format!("Connection failed: {}", e.summary())),
        };

        if success {
            info!("Connection test to {} succeeded", target.address());
        } else {
            warn!("Connection test to {} failed: {}", target.address(), message);
        }

        ServerTestResult {
            server_id: target.id.clone(),
            success,
            message,
        }
    }

    /// Test several targets concurrently. Results keep the input order.
    pub async fn test_many(&self, targets: &[ServerTarget]) -> Vec<ServerTestResult> {
        info!("Testing {} server connection(s)", targets.len());
        join_all(targets.iter().map(|t| self.test(t))).await
    }
}
