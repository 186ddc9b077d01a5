//! The DAG scheduler: builds the unit dependency graph once, then drives
//! dispatch and the completion/failure cascades described by the
//! authoritative unit state machine.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use choo_db::models::UnitStatus;
use thiserror::Error;

/// Errors raised while building the schedule.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("dependency cycle detected: {0}")]
    CycleDetected(String),

    #[error("unit {unit:?} depends on unknown unit {dependency:?}")]
    MissingDependency { unit: String, dependency: String },
}

/// Reason returned by `dispatch()` when no unit is ready to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Unit(usize),
    NoReadyUnits,
    AtCapacity,
    AllComplete,
    AllBlocked,
}

#[derive(Debug, Clone)]
struct UnitNode {
    id: String,
    deps: Vec<String>,
    dependents: Vec<String>,
    status: UnitStatus,
    blocked_by: Option<String>,
}

/// In-memory DAG scheduler for one run's set of units.
///
/// Construction builds forward edges (`unit -> deps`) and reverse edges
/// (`dep -> dependents`); `dispatch`/`complete`/`fail`/`transition` then
/// drive the state machine under a single internal lock so the cascades
/// stay exhaustive and synchronous.
pub struct Scheduler {
    inner: Mutex<Inner>,
}

struct Inner {
    nodes: HashMap<String, UnitNode>,
    order: Vec<String>,
    ready_queue: VecDeque<String>,
    parallelism: usize,
}

/// The next unit to dispatch, paired with its discovery-order index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub unit_id: String,
}

impl Scheduler {
    /// Build the DAG for a set of `(unit_id, depends_on)` pairs, in discovery
    /// order. Validates there are no missing dependencies and no cycles.
    pub fn schedule(
        units: &[(String, Vec<String>)],
        parallelism: usize,
    ) -> Result<Scheduler, SchedulerError> {
        let known: HashSet<&str> = units.iter().map(|(id, _)| id.as_str()).collect();
        for (id, deps) in units {
            for dep in deps {
                if !known.contains(dep.as_str()) {
                    return Err(SchedulerError::MissingDependency {
                        unit: id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        detect_cycle(units)?;

        let mut nodes = HashMap::new();
        let mut order = Vec::with_capacity(units.len());
        for (id, deps) in units {
            nodes.insert(
                id.clone(),
                UnitNode {
                    id: id.clone(),
                    deps: deps.clone(),
                    dependents: Vec::new(),
                    status: UnitStatus::Pending,
                    blocked_by: None,
                },
            );
            order.push(id.clone());
        }
        for (id, deps) in units {
            for dep in deps {
                nodes.get_mut(dep).unwrap().dependents.push(id.clone());
            }
        }

        // Units with no dependencies start `ready` immediately and are
        // enqueued in discovery order.
        let mut ready_queue = VecDeque::new();
        for id in &order {
            if nodes[id].deps.is_empty() {
                nodes.get_mut(id).unwrap().status = UnitStatus::Ready;
                ready_queue.push_back(id.clone());
            }
        }

        Ok(Scheduler {
            inner: Mutex::new(Inner {
                nodes,
                order,
                ready_queue,
                parallelism: parallelism.max(1),
            }),
        })
    }

    /// Pop the next ready unit and transition it to `in_progress`, or report
    /// why nothing was dispatched.
    pub fn dispatch(&self) -> DispatchOutcomeWithId {
        let mut inner = self.inner.lock().unwrap();
        let active_count = inner
            .nodes
            .values()
            .filter(|n| n.status.is_active())
            .count();

        if active_count >= inner.parallelism {
            return DispatchOutcomeWithId::AtCapacity;
        }

        if let Some(id) = inner.ready_queue.pop_front() {
            let node = inner.nodes.get_mut(&id).unwrap();
            node.status = UnitStatus::InProgress;
            return DispatchOutcomeWithId::Unit(id);
        }

        let all_terminal = inner.nodes.values().all(|n| n.status.is_terminal());
        if all_terminal {
            return DispatchOutcomeWithId::AllComplete;
        }

        let all_non_terminal_blocked = inner
            .nodes
            .values()
            .filter(|n| !n.status.is_terminal())
            .all(|n| n.status == UnitStatus::Blocked);
        if all_non_terminal_blocked {
            return DispatchOutcomeWithId::AllBlocked;
        }

        DispatchOutcomeWithId::NoReadyUnits
    }

    /// Record a unit's completion and cascade readiness to its dependents.
    ///
    /// Returns the ids newly transitioned `pending -> ready`, in the order
    /// their gate was satisfied (not necessarily discovery order).
    pub fn complete(&self, unit_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.nodes.get_mut(unit_id) else {
            return Vec::new();
        };
        node.status = UnitStatus::Complete;

        let dependents = inner.nodes[unit_id].dependents.clone();
        let mut newly_ready = Vec::new();
        for dependent_id in dependents {
            let ready = {
                let dependent = &inner.nodes[&dependent_id];
                dependent.status == UnitStatus::Pending
                    && dependent
                        .deps
                        .iter()
                        .all(|d| inner.nodes[d].status == UnitStatus::Complete)
            };
            if ready {
                inner.nodes.get_mut(&dependent_id).unwrap().status = UnitStatus::Ready;
                inner.ready_queue.push_back(dependent_id.clone());
                newly_ready.push(dependent_id);
            }
        }
        newly_ready
    }

    /// Record a unit's failure and cascade-block every non-terminal
    /// transitive dependent, synchronously and exhaustively.
    ///
    /// Returns the ids newly transitioned to `blocked`.
    pub fn fail(&self, unit_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.nodes.contains_key(unit_id) {
            return Vec::new();
        }
        inner.nodes.get_mut(unit_id).unwrap().status = UnitStatus::Failed;

        let mut blocked = Vec::new();
        let mut frontier: VecDeque<String> = inner.nodes[unit_id].dependents.clone().into();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(id) = frontier.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let is_non_terminal = !inner.nodes[&id].status.is_terminal();
            if is_non_terminal {
                inner.ready_queue.retain(|q| q != &id);
                let node = inner.nodes.get_mut(&id).unwrap();
                node.status = UnitStatus::Blocked;
                node.blocked_by = Some(unit_id.to_string());
                blocked.push(id.clone());
                frontier.extend(inner.nodes[&id].dependents.clone());
            }
        }
        blocked
    }

    /// Attempt an explicit status transition outside the dispatch/complete/
    /// fail cascades (e.g. `in_progress -> pr_open` for PR-phase workflows).
    /// Invalid transitions are reported, never silently coerced.
    pub fn transition(&self, unit_id: &str, to: UnitStatus) -> Result<(), String> {
        let mut inner = self.inner.lock().unwrap();
        let Some(node) = inner.nodes.get_mut(unit_id) else {
            return Ok(());
        };
        if !node.status.can_transition_to(to) {
            return Err(format!(
                "invalid transition for unit {unit_id}: {} -> {to}",
                node.status
            ));
        }
        node.status = to;
        Ok(())
    }

    pub fn get_state(&self, unit_id: &str) -> Option<UnitStatus> {
        self.inner.lock().unwrap().nodes.get(unit_id).map(|n| n.status)
    }

    pub fn blocked_by(&self, unit_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .get(unit_id)
            .and_then(|n| n.blocked_by.clone())
    }

    pub fn all_states(&self) -> Vec<(String, UnitStatus)> {
        let inner = self.inner.lock().unwrap();
        inner
            .order
            .iter()
            .map(|id| (id.clone(), inner.nodes[id].status))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.status.is_active())
            .count()
    }

    pub fn is_complete(&self) -> bool {
        self.inner
            .lock()
            .unwrap()
            .nodes
            .values()
            .all(|n| n.status.is_terminal())
    }

    pub fn has_failures(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .nodes
            .values()
            .any(|n| matches!(n.status, UnitStatus::Failed | UnitStatus::Blocked))
    }

    /// Maximum achievable parallel width at each depth: repeated peeling of
    /// the zero-indegree frontier over the dependency graph (levels are
    /// computed over the *original* graph, not live state).
    pub fn levels(units: &[(String, Vec<String>)]) -> Vec<Vec<String>> {
        let mut remaining: HashMap<&str, HashSet<&str>> = units
            .iter()
            .map(|(id, deps)| (id.as_str(), deps.iter().map(String::as_str).collect()))
            .collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let frontier: Vec<&str> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(id, _)| *id)
                .collect();
            if frontier.is_empty() {
                break; // malformed graph; schedule() would have already rejected it
            }
            let mut level: Vec<String> = frontier.iter().map(|s| s.to_string()).collect();
            level.sort();
            for id in &frontier {
                remaining.remove(id);
            }
            for deps in remaining.values_mut() {
                for id in &frontier {
                    deps.remove(id);
                }
            }
            levels.push(level);
        }
        levels
    }
}

/// [`DispatchOutcome`] carrying the dispatched unit's id, distinct from the
/// reason codes which carry nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcomeWithId {
    Unit(String),
    NoReadyUnits,
    AtCapacity,
    AllComplete,
    AllBlocked,
}

/// Detect a dependency cycle via Kahn's algorithm; on failure, DFS recovers
/// one offending cycle path for the error message.
///
/// The recovered path must be trimmed at the first occurrence of the
/// revisited node: DFS may have walked a non-cyclic prefix before looping
/// back onto a node it already visited, and only the suffix starting at
/// that node's first occurrence is actually the cycle.
fn detect_cycle(units: &[(String, Vec<String>)]) -> Result<(), SchedulerError> {
    let mut in_degree: HashMap<&str, usize> =
        units.iter().map(|(id, _)| (id.as_str(), 0)).collect();
    let mut adj: HashMap<&str, Vec<&str>> = units.iter().map(|(id, _)| (id.as_str(), Vec::new())).collect();

    for (id, deps) in units {
        for dep in deps {
            adj.get_mut(dep.as_str()).unwrap().push(id.as_str());
            *in_degree.get_mut(id.as_str()).unwrap() += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut sorted = 0usize;
    let mut degree = in_degree.clone();
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            let d = degree.get_mut(next).unwrap();
            *d -= 1;
            if *d == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted == units.len() {
        return Ok(());
    }

    // DFS from any node still carrying nonzero in-degree to recover a cycle path.
    let remaining: Vec<&str> = degree
        .iter()
        .filter(|(_, d)| **d > 0)
        .map(|(id, _)| *id)
        .collect();
    let deps_by_id: HashMap<&str, &Vec<String>> =
        units.iter().map(|(id, deps)| (id.as_str(), deps)).collect();

    let start = remaining[0];
    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let next = deps_by_id[current]
            .iter()
            .map(String::as_str)
            .find(|d| remaining.contains(d))
            .unwrap_or(start);
        if let Some(pos) = path.iter().position(|&n| n == next) {
            path.push(next);
            let cycle = &path[pos..];
            return Err(SchedulerError::CycleDetected(cycle.join(" -> ")));
        }
        path.push(next);
        current = next;
    }
}
