//! Dependency graph construction, cycle detection, and execution layering.
//!
//! Dependencies are never declared explicitly: they are derived from the
//! references a step embeds in its inputs, condition, and `forEach` source,
//! plus an implicit edge from every conditional branch member back to its
//! conditional. Layering uses Kahn's algorithm over a `petgraph` digraph so
//! that every layer holds the maximal set of mutually independent steps.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde_json::{Map, Value};
use weft_types::workflow::{ExecutionPlan, StepDefinition, StepKind};

use super::definition::WorkflowError;
use super::references::{extract_expression_references, extract_references, is_ignored_root};

/// Step ID -> IDs it depends on.
pub type DependencyGraph = BTreeMap<String, BTreeSet<String>>;

// ---------------------------------------------------------------------------
// Step view (shared by typed steps and raw JSON during validation)
// ---------------------------------------------------------------------------

/// The parts of a step that contribute dependencies.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepView<'a> {
    pub id: &'a str,
    pub kind: Option<StepKind>,
    pub inputs: Option<&'a Map<String, Value>>,
    pub condition: Option<&'a str>,
    pub for_each: Option<&'a str>,
}

impl<'a> From<&'a StepDefinition> for StepView<'a> {
    fn from(step: &'a StepDefinition) -> Self {
        Self {
            id: &step.id,
            kind: Some(step.tool),
            inputs: Some(&step.inputs),
            condition: step.condition.as_deref(),
            for_each: step.for_each.as_deref(),
        }
    }
}

/// Every path root a step refers to, including `inputs`/`defaults` and
/// iteration variables.
pub(crate) fn step_references(view: &StepView<'_>) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();

    if let Some(inputs) = view.inputs {
        for value in inputs.values() {
            refs.extend(extract_references(value));
        }
        // `conditional` and `filter` take a bare expression in `inputs.condition`.
        if matches!(view.kind, Some(StepKind::Conditional | StepKind::Filter)) {
            if let Some(Value::String(expr)) = inputs.get("condition") {
                refs.extend(extract_expression_references(expr));
            }
        }
    }
    if let Some(condition) = view.condition {
        refs.extend(extract_expression_references(condition));
    }
    if let Some(source) = view.for_each {
        refs.extend(extract_expression_references(source));
    }

    refs
}

/// IDs listed in a conditional's `then` and `else` branches.
pub(crate) fn branch_members(inputs: &Map<String, Value>) -> impl Iterator<Item = &str> {
    ["then", "else"]
        .into_iter()
        .filter_map(|key| inputs.get(key).and_then(Value::as_array))
        .flatten()
        .filter_map(Value::as_str)
}

pub(crate) fn graph_from_views(views: &[StepView<'_>]) -> DependencyGraph {
    let mut graph: DependencyGraph = BTreeMap::new();
    for view in views {
        let deps = graph.entry(view.id.to_string()).or_default();
        deps.extend(
            step_references(view)
                .into_iter()
                .filter(|root| !is_ignored_root(root)),
        );
    }

    // Branch members must not run before the branch decision exists.
    for view in views {
        if view.kind != Some(StepKind::Conditional) {
            continue;
        }
        let Some(inputs) = view.inputs else { continue };
        for member in branch_members(inputs) {
            if member == view.id {
                continue;
            }
            if let Some(deps) = graph.get_mut(member) {
                deps.insert(view.id.to_string());
            }
        }
    }

    graph
}

// ---------------------------------------------------------------------------
// Public graph API
// ---------------------------------------------------------------------------

/// Build the dependency graph for a set of steps.
///
/// Dependency sets may name roots that are not steps (iteration variables,
/// dangling references); the planner ignores those and the validator reports
/// them.
pub fn build_dependency_graph(steps: &[StepDefinition]) -> DependencyGraph {
    let views: Vec<StepView<'_>> = steps.iter().map(StepView::from).collect();
    graph_from_views(&views)
}

/// Build an execution plan, grouping steps into maximally parallel layers.
///
/// Kahn's algorithm:
///
/// 1. Build a `DiGraph` with step IDs as nodes and dependency -> dependent edges,
///    keeping only dependencies that are themselves steps.
/// 2. Collect every step whose in-degree is zero into the next layer.
/// 3. Remove them and decrement the in-degree of their dependents.
///
/// Layers list steps in definition order. Returns `WorkflowError::PlanStalled`
/// if steps remain but none is ready, which only happens for cyclic input.
pub fn build_execution_plan(steps: &[StepDefinition]) -> Result<ExecutionPlan, WorkflowError> {
    let graph = build_dependency_graph(steps);
    let order: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    plan_layers(&order, &graph)
}

/// Kahn layering over an existing graph, visiting nodes in `order`.
pub fn plan_layers(order: &[&str], graph: &DependencyGraph) -> Result<ExecutionPlan, WorkflowError> {
    if order.is_empty() {
        return Ok(ExecutionPlan::default());
    }

    let mut dag = DiGraph::<&str, ()>::new();
    let mut id_to_idx: HashMap<&str, NodeIndex> = HashMap::new();
    for id in order {
        id_to_idx.entry(*id).or_insert_with(|| dag.add_node(*id));
    }

    for id in order {
        let to_idx = id_to_idx[id];
        for dep in graph.get(*id).into_iter().flatten() {
            if let Some(&from_idx) = id_to_idx.get(dep.as_str()) {
                dag.update_edge(from_idx, to_idx, ());
            }
        }
    }

    let mut in_degree: HashMap<NodeIndex, usize> = dag
        .node_indices()
        .map(|n| (n, dag.neighbors_directed(n, Direction::Incoming).count()))
        .collect();

    let mut remaining: Vec<NodeIndex> = dag.node_indices().collect();
    let mut layers: Vec<Vec<String>> = Vec::new();

    while !remaining.is_empty() {
        let (ready, rest): (Vec<NodeIndex>, Vec<NodeIndex>) = std::mem::take(&mut remaining)
            .into_iter()
            .partition(|n| in_degree.get(n).copied().unwrap_or(0) == 0);

        if ready.is_empty() {
            return Err(WorkflowError::PlanStalled {
                remaining: rest.iter().map(|n| dag[*n].to_string()).collect(),
            });
        }

        for node in &ready {
            for dependent in dag.neighbors_directed(*node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }

        layers.push(ready.iter().map(|n| dag[*n].to_string()).collect());
        remaining = rest;
    }

    Ok(ExecutionPlan { layers })
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

/// Find dependency cycles with a three-colour depth-first search.
///
/// Roots are visited in `order`; the first cycle reachable from each unvisited
/// root is reported as a closed path (`["a", "b", "a"]`) following dependency
/// edges. Dependencies that are not graph keys are ignored.
pub fn detect_cycles(graph: &DependencyGraph, order: &[&str]) -> Vec<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = graph.keys().map(|k| (k.as_str(), Mark::White)).collect();
    let mut cycles = Vec::new();

    for root in order {
        if marks.get(root).copied() != Some(Mark::White) {
            continue;
        }
        let mut stack: Vec<&str> = Vec::new();
        if let Some(cycle) = visit(root, graph, &mut marks, &mut stack) {
            cycles.push(cycle);
            // Abandoned frames stay gray otherwise and would fake later cycles.
            for id in stack {
                marks.insert(id, Mark::Black);
            }
        }
    }

    cycles
}

fn visit<'a>(
    id: &'a str,
    graph: &'a DependencyGraph,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    marks.insert(id, Mark::Gray);
    stack.push(id);

    for dep in graph.get(id).into_iter().flatten() {
        match marks.get(dep.as_str()).copied() {
            Some(Mark::White) => {
                if let Some(cycle) = visit(dep, graph, marks, stack) {
                    return Some(cycle);
                }
            }
            Some(Mark::Gray) => {
                let start = stack.iter().position(|s| *s == dep).unwrap_or(0);
                let mut path: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(dep.clone());
                return Some(path);
            }
            Some(Mark::Black) | None => {}
        }
    }

    stack.pop();
    marks.insert(id, Mark::Black);
    None
}

// ---------------------------------------------------------------------------
// Transitive dependency closure
// ---------------------------------------------------------------------------

/// Returns the transitive closure of all step dependencies for a given step.
///
/// If `step_id` is not in the graph, returns an empty set.
pub fn transitive_dependencies(step_id: &str, graph: &DependencyGraph) -> BTreeSet<String> {
    let mut visited = BTreeSet::new();
    let mut stack = vec![step_id];

    while let Some(current) = stack.pop() {
        for dep in graph.get(current).into_iter().flatten() {
            if graph.contains_key(dep) && visited.insert(dep.clone()) {
                stack.push(dep.as_str());
            }
        }
    }

    visited
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
