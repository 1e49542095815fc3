//! Dependency-aware parallel delegation scheduling.
//!
//! When a response requests several delegations and parallel dispatch is
//! enabled, the scheduler builds a dependency DAG from each target
//! profile's `dependencies[]` (filtered to the agents actually in the
//! batch), computes topological levels, and runs each level concurrently
//! bounded by a semaphore. A level starts only after the previous level
//! finished.
//!
//! ```text
//! batch: [backend, frontend, qa]      qa.dependencies = [backend, frontend]
//!
//! level 0:  backend ──┐   frontend ──┐      (run concurrently)
//! level 1:            └──── qa ──────┘      (starts after both finish)
//! ```
//!
//! Failure semantics: with `continue_delegations_on_failure = false` a
//! single failure cancels outstanding work in the current and later
//! levels and surfaces. Otherwise the failed delegation is captured and
//! its dependents in later levels are marked `skipped`. Results always
//! come back in input order, one per request.

use crate::automatosx::cancellation::CancellationToken;
use crate::automatosx::delegation::{
    skipped_result, DelegationError, DelegationRequest, DelegationResult, DelegationStatus,
};
use crate::automatosx::executor::{AgentExecutor, ExecutionOptions};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Run a delegation batch level by level. See the module docs.
///
/// Returns a boxed trait-object future (rather than `async fn`) so the
/// mutual recursion with `delegate_to_agent` (which spawns tasks that call
/// back into this function) has a concrete, opaque `Send` type to terminate
/// on instead of an infinitely-expanding one.
pub(crate) fn execute_parallel<'a>(
    executor: &'a Arc<AgentExecutor>,
    requests: Vec<DelegationRequest>,
    options: &'a ExecutionOptions,
) -> Pin<Box<dyn Future<Output = Result<Vec<DelegationResult>, DelegationError>> + Send + 'a>> {
    Box::pin(execute_parallel_inner(executor, requests, options))
}

async fn execute_parallel_inner(
    executor: &Arc<AgentExecutor>,
    requests: Vec<DelegationRequest>,
    options: &ExecutionOptions,
) -> Result<Vec<DelegationResult>, DelegationError> {
    let profiles = executor
        .profiles
        .as_ref()
        .ok_or(DelegationError::NotConfigured)?;

    let n = requests.len();

    // In-batch dependency edges: deps[i] holds the indices i waits on.
    let mut index_by_name: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, request) in requests.iter().enumerate() {
        index_by_name
            .entry(request.to_agent.as_str())
            .or_default()
            .push(i);
    }
    let mut deps: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, request) in requests.iter().enumerate() {
        let profile = match profiles.load_profile(&request.to_agent) {
            Ok(profile) => profile,
            // An unloadable profile has no usable dependency list; the
            // dispatch itself will report the real error.
            Err(_) => continue,
        };
        for dependency in &profile.dependencies {
            if let Some(indices) = index_by_name.get(dependency.as_str()) {
                for &j in indices {
                    if j != i && !deps[i].contains(&j) {
                        deps[i].push(j);
                    }
                }
            }
        }
    }

    let levels = topological_levels(&deps).ok_or_else(|| {
        let mut agents: Vec<String> = requests.iter().map(|r| r.to_agent.clone()).collect();
        agents.dedup();
        DelegationError::DependencyCycle { agents }
    })?;

    let max_concurrent = options
        .max_concurrent_delegations
        .unwrap_or(executor.defaults.max_concurrent_agents)
        .max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrent));

    // One token for the whole batch; an abort cancels everything still
    // in flight, including later retry sleeps.
    let batch_token = match &options.cancellation_token {
        Some(parent) => parent.child(),
        None => CancellationToken::new(),
    };
    let child_options = ExecutionOptions {
        cancellation_token: Some(batch_token.clone()),
        ..options.clone()
    };

    log::debug!(
        "Parallel delegation: {} requests across {} levels (max {} concurrent)",
        n,
        levels.len(),
        max_concurrent
    );

    let mut results: Vec<Option<DelegationResult>> = (0..n).map(|_| None).collect();
    let mut terminal = vec![false; n];

    for level in levels {
        let mut to_run = Vec::new();
        for &i in &level {
            match deps[i].iter().find(|&&j| terminal[j]) {
                Some(&j) => {
                    results[i] = Some(skipped_result(&requests[i], &requests[j].to_agent));
                    terminal[i] = true;
                }
                None => to_run.push(i),
            }
        }

        let mut handles = Vec::with_capacity(to_run.len());
        for i in to_run {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("scheduler semaphore is never closed");
            let executor = executor.clone();
            let request = requests[i].clone();
            let opts = child_options.clone();
            handles.push((
                i,
                tokio::spawn(async move {
                    let _permit = permit;
                    executor.delegate_to_agent(request, &opts).await
                }),
            ));
        }

        let mut abort: Option<String> = None;
        for (i, handle) in handles {
            match handle.await {
                Ok(Ok(result)) => {
                    if result.status == DelegationStatus::Failure {
                        terminal[i] = true;
                        if !options.default_continue() && abort.is_none() {
                            abort = Some(format!(
                                "delegation to '{}' failed: {}",
                                result.to_agent, result.response.content
                            ));
                            batch_token.cancel();
                        }
                    }
                    results[i] = Some(result);
                }
                Ok(Err(err)) => {
                    batch_token.cancel();
                    return Err(err);
                }
                Err(join_err) => {
                    batch_token.cancel();
                    return Err(DelegationError::ExecutionFailed(format!(
                        "delegation task panicked: {}",
                        join_err
                    )));
                }
            }
        }
        if let Some(message) = abort {
            return Err(DelegationError::ExecutionFailed(message));
        }
    }

    Ok(results
        .into_iter()
        .map(|slot| slot.expect("every request produced a result"))
        .collect())
}

/// Kahn's algorithm, grouped by level. Returns `None` on a cycle.
fn topological_levels(deps: &[Vec<usize>]) -> Option<Vec<Vec<usize>>> {
    let n = deps.len();
    let mut indegree: Vec<usize> = deps.iter().map(|d| d.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, dep_list) in deps.iter().enumerate() {
        for &j in dep_list {
            dependents[j].push(i);
        }
    }

    let mut frontier: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    let mut levels = Vec::new();
    let mut processed = 0;

    while !frontier.is_empty() {
        frontier.sort_unstable();
        processed += frontier.len();
        let mut next = Vec::new();
        for &i in &frontier {
            for &k in &dependents[i] {
                indegree[k] -= 1;
                if indegree[k] == 0 {
                    next.push(k);
                }
            }
        }
        levels.push(std::mem::take(&mut frontier));
        frontier = next;
    }

    if processed == n {
        Some(levels)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn independent_nodes_form_one_level() {
        let deps = vec![vec![], vec![], vec![]];
        let levels = topological_levels(&deps).unwrap();
        assert_eq!(levels, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn chain_forms_sequential_levels() {
        // 1 depends on 0, 2 depends on 1.
        let deps = vec![vec![], vec![0], vec![1]];
        let levels = topological_levels(&deps).unwrap();
        assert_eq!(levels, vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn diamond_groups_independent_work() {
        // 1 and 2 depend on 0; 3 depends on both.
        let deps = vec![vec![], vec![0], vec![0], vec![1, 2]];
        let levels = topological_levels(&deps).unwrap();
        assert_eq!(levels, vec![vec![0], vec![1, 2], vec![3]]);
    }

    #[test]
    fn cycle_is_detected() {
        let deps = vec![vec![1], vec![0]];
        assert!(topological_levels(&deps).is_none());
    }
}
