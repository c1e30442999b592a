//! Fan-out over the federation
//!
//! Every replicated step goes through [`execute_task_with_all_operators`]: one
//! task per selected operator, all joined, and either every result or the
//! complete list of failures comes back. Callers never see a partial map.

use std::collections::BTreeMap;
use std::future::Future;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{FederationConfig, SigningOperator};
use crate::logging::{log_detached_failure, log_fanout_failure, EventCategory};
use crate::transport::TransportError;

/// Which operators a fan-out addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorSelection {
    All,
    ExcludeSelf,
    /// This operator plus the lowest-indexed peers, `n` in total
    Threshold(usize),
}

impl OperatorSelection {
    pub fn operators<'a>(&self, config: &'a FederationConfig) -> Vec<&'a SigningOperator> {
        match self {
            OperatorSelection::All => config.operators.iter().collect(),
            OperatorSelection::ExcludeSelf => config
                .operators
                .iter()
                .filter(|o| o.index != config.index)
                .collect(),
            OperatorSelection::Threshold(n) => {
                let mut selected: Vec<&SigningOperator> = config
                    .operators
                    .iter()
                    .filter(|o| o.index == config.index)
                    .collect();
                selected.extend(config.operators.iter().filter(|o| o.index != config.index));
                selected.truncate(*n);
                selected.sort_by_key(|o| o.index);
                selected
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("{} operator(s) failed: {}", .failures.len(), describe(.failures))]
    OperatorsFailed {
        failures: BTreeMap<String, TransportError>,
    },
}

fn describe(failures: &BTreeMap<String, TransportError>) -> String {
    failures
        .iter()
        .map(|(id, err)| format!("{}: {}", id, err))
        .collect::<Vec<_>>()
        .join("; ")
}

impl FanoutError {
    pub fn failures(&self) -> &BTreeMap<String, TransportError> {
        match self {
            FanoutError::OperatorsFailed { failures } => failures,
        }
    }

    /// Identifiers of the failing operators
    pub fn failed_operators(&self) -> Vec<String> {
        self.failures().keys().cloned().collect()
    }

    /// True when every failure is a transport-level outage
    pub fn is_unavailability(&self) -> bool {
        self.failures()
            .values()
            .all(|e| !matches!(e, TransportError::Rejected { .. }))
    }
}

/// Run `task` against every selected operator concurrently
///
/// Returns identifier -> result when all succeed. A panicking task counts as
/// a failure of its operator.
pub async fn execute_task_with_all_operators<T, F, Fut>(
    config: &FederationConfig,
    selection: OperatorSelection,
    task: F,
) -> Result<BTreeMap<String, T>, FanoutError>
where
    T: Send + 'static,
    F: Fn(SigningOperator) -> Fut,
    Fut: Future<Output = Result<T, TransportError>> + Send + 'static,
{
    let selected = selection.operators(config);
    let selected_count = selected.len();
    let mut set = JoinSet::new();
    for operator in selected {
        let identifier = operator.identifier.clone();
        let handle = tokio::spawn(task(operator.clone()));
        set.spawn(async move { (identifier, handle.await) });
    }

    let mut results = BTreeMap::new();
    let mut failures = BTreeMap::new();
    while let Some(joined) = set.join_next().await {
        let (identifier, outcome) = match joined {
            Ok(pair) => pair,
            // the wrapper only awaits a handle and cannot panic itself
            Err(e) => {
                let identifier = format!("task-{}", e);
                (identifier, Err(e))
            }
        };
        match outcome {
            Ok(Ok(value)) => {
                results.insert(identifier, value);
            }
            Ok(Err(err)) => {
                tracing::warn!(operator = %identifier, error = %err, "Operator task failed");
                failures.insert(identifier, err);
            }
            Err(join_error) => {
                tracing::error!(operator = %identifier, error = %join_error, "Operator task panicked");
                failures.insert(identifier, TransportError::TaskFailed(join_error.to_string()));
            }
        }
    }

    if failures.is_empty() {
        Ok(results)
    } else {
        let err = FanoutError::OperatorsFailed { failures };
        log_fanout_failure(selected_count, &err.failed_operators(), err.is_unavailability());
        Err(err)
    }
}

/// Run `future` without tying its outcome to the caller
///
/// Errors and panics are logged against `correlation_id`. The returned handle
/// only tells the caller when the task is over.
pub fn spawn_detached<F, E>(
    category: EventCategory,
    task: &'static str,
    correlation_id: String,
    future: F,
) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let inner = tokio::spawn(future);
    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log_detached_failure(category, task, &correlation_id, &err.to_string()),
            Err(join_error) => log_detached_failure(
                category,
                task,
                &correlation_id,
                &format!("task panicked: {}", join_error),
            ),
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::operator_identifier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    pub(crate) fn test_config(index: u32, n: u32) -> FederationConfig {
        let operators = (0..n)
            .map(|i| SigningOperator {
                index: i,
                identifier: operator_identifier(i),
                address: format!("http://127.0.0.1:{}", 9001 + i),
                identity_public_key: hex::encode(
                    crate::keys::public_key_from_private_key(&[(i + 1) as u8; 32]).unwrap(),
                ),
            })
            .collect();
        FederationConfig {
            index,
            bind_address: "127.0.0.1:0".to_string(),
            threshold: 2,
            network: Default::default(),
            identity_key_path: String::new(),
            log_level: "info".to_string(),
            log_json: false,
            dkg: Default::default(),
            allowed_origins: Vec::new(),
            operators,
        }
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let config = test_config(0, 3);
        let results = execute_task_with_all_operators(&config, OperatorSelection::All, |op| async move {
            Ok::<_, TransportError>(op.index * 10)
        })
        .await
        .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[&operator_identifier(2)], 20);
    }

    #[tokio::test]
    async fn test_exclude_self_and_threshold() {
        let config = test_config(1, 4);
        let excluded = OperatorSelection::ExcludeSelf.operators(&config);
        assert_eq!(excluded.len(), 3);
        assert!(excluded.iter().all(|o| o.index != 1));

        let threshold = OperatorSelection::Threshold(2).operators(&config);
        let indices: Vec<u32> = threshold.iter().map(|o| o.index).collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_failure_waits_for_all_and_reports_every_failure() {
        let config = test_config(0, 3);
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();

        let result = execute_task_with_all_operators(&config, OperatorSelection::All, move |op| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20 * u64::from(op.index))).await;
                counter.fetch_add(1, Ordering::SeqCst);
                if op.index == 0 {
                    Err(TransportError::Rejected {
                        status: 400,
                        code: "INVALID_REQUEST".to_string(),
                        message: "bad".to_string(),
                    })
                } else {
                    Ok(op.index)
                }
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.failed_operators(), vec![operator_identifier(0)]);
        assert!(!err.is_unavailability());
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let config = test_config(0, 2);
        let result = execute_task_with_all_operators(&config, OperatorSelection::All, |op| async move {
            if op.index == 1 {
                panic!("operator task blew up");
            }
            Ok::<_, TransportError>(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(
            err.failures().get(&operator_identifier(1)),
            Some(TransportError::TaskFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_detached_task_failure_does_not_propagate() {
        let failed = spawn_detached(EventCategory::System, "test", "x".to_string(), async {
            Err::<(), _>("boom")
        });
        assert!(failed.await.is_ok());

        let panicked = spawn_detached(EventCategory::System, "test", "y".to_string(), async {
            if true {
                panic!("detached panic");
            }
            Ok::<(), String>(())
        });
        assert!(panicked.await.is_ok());
    }
}
