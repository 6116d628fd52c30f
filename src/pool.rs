//! Controller pool
//!
//! Owns every [`ControllerConnection`] and fans connect / poll operations out
//! across them concurrently. Failures are collected per controller instead of
//! short-circuiting, so a degraded pool still yields data from the healthy
//! controllers.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::controller::{client_for, ClientError, ControllerConnection, RawValue};
use crate::telemetry as m;
use crate::registry::TagRegistry;

/// One controller's failure
#[derive(Debug)]
pub struct ControllerFailure {
    pub controller: String,
    pub error: ClientError,
}

impl fmt::Display for ControllerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.controller, self.error)
    }
}

/// Aggregate of per-controller failures
#[derive(Debug)]
pub struct PoolError {
    pub failures: Vec<ControllerFailure>,
}

impl PoolError {
    /// Names of the failing controllers
    pub fn controllers(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.controller.as_str()).collect()
    }
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} controller(s) failed", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for PoolError {}

/// Result of one poll across all controllers
#[derive(Debug, Default)]
pub struct PollOutcome {
    /// Raw values keyed by `controller/tag`
    pub values: HashMap<String, RawValue>,
    /// Controllers that produced nothing this round
    pub failures: Vec<ControllerFailure>,
}

impl PollOutcome {
    /// Some controllers failed; `values` may still hold usable data
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Split into the merged values and an aggregate error, if any
    pub fn into_parts(self) -> (HashMap<String, RawValue>, Option<PoolError>) {
        let error = if self.failures.is_empty() {
            None
        } else {
            Some(PoolError {
                failures: self.failures,
            })
        };
        (self.values, error)
    }
}

pub struct ControllerPool {
    connections: Vec<ControllerConnection>,
}

impl ControllerPool {
    pub fn new(connections: Vec<ControllerConnection>) -> Self {
        Self { connections }
    }

    /// One connection per registered controller, using its configured driver
    pub fn from_registry(registry: &TagRegistry, read_timeout: Option<Duration>) -> Self {
        let connections = registry
            .controllers()
            .map(|spec| {
                ControllerConnection::new(
                    spec.name.clone(),
                    registry.tags_for(&spec.name).to_vec(),
                    client_for(spec),
                    read_timeout,
                )
            })
            .collect();
        Self::new(connections)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    pub fn connections(&self) -> &[ControllerConnection] {
        &self.connections
    }

    /// Connect every controller. Controllers that connect stay connected even
    /// when others fail; the error lists each failure with its cause.
    pub async fn connect_all(&mut self) -> Result<(), PoolError> {
        let attempts = self.connections.iter_mut().map(|conn| async move {
            let result = conn.connect().await;
            (conn.name().to_string(), result)
        });

        let failures: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|(controller, result)| {
                result.err().map(|error| {
                    warn!(controller = %controller, error = %error, "Controller connect failed");
                    ControllerFailure { controller, error }
                })
            })
            .collect();

        let connected = self.connected_count();
        metrics::gauge!(m::CONNECTED_CONTROLLERS).set(connected as f64);
        info!(
            "Connected {}/{} controllers",
            connected,
            self.connections.len()
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(PoolError { failures })
        }
    }

    /// Best-effort disconnect; safe to call repeatedly
    pub async fn disconnect_all(&mut self) {
        join_all(self.connections.iter_mut().map(|conn| conn.disconnect())).await;
        metrics::gauge!(m::CONNECTED_CONTROLLERS).set(0.0);
    }

    /// Read every controller's tags concurrently and merge the results.
    ///
    /// Disconnected controllers are skipped and reported as failures. The
    /// call returns once every read has finished or failed.
    pub async fn poll_all(&mut self) -> PollOutcome {
        let reads = self.connections.iter_mut().map(|conn| async move {
            let result = conn.read().await;
            (conn.name().to_string(), result)
        });
        let results = join_all(reads).await;

        let mut outcome = PollOutcome::default();
        for (controller, result) in results {
            match result {
                Ok(values) => outcome.values.extend(values),
                Err(error) => {
                    metrics::counter!(m::CONTROLLER_READ_ERRORS, "controller" => controller.clone())
                        .increment(1);
                    warn!(controller = %controller, error = %error, "Controller read failed");
                    outcome.failures.push(ControllerFailure { controller, error });
                }
            }
        }
        outcome
    }
}
