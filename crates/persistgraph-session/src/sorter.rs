//! Dependency ordering of subjects.
//!
//! Subjects that write are arranged into phases: every subject in a phase
//! only depends on subjects in earlier phases. Edges come from three places:
//!
//! - a pending reference (`T -> H`): holder `H` stores the key of inserted
//!   subject `T`, so `T` is written first
//! - a removal (`H -> T`): removed holder `H` still references removed
//!   target `T`, so `H` is deleted first
//! - an update before a removal (`U -> T`): `U` stops referencing removed
//!   `T`, so the update runs before the delete
//!
//! Cycles are broken on a nullable edge: the holder is written with NULL
//! and a deferred assignment fills the reference once both rows exist.
//! A cycle with no nullable edge fails with `CircularRelations`.

use crate::subject::{ChangeValue, ColumnChange, OperationKind, SubjectId, SubjectSet};
use persistgraph_core::{
    DiffStrategy, Identifier, IdentityKey, PersistError, RelationMetadata, Result, Value,
};
use std::collections::{HashMap, HashSet};

/// Why one subject must precede another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Reference,
    Removal,
    UpdateBeforeRemove,
}

/// `from` must be written before `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: SubjectId,
    pub to: SubjectId,
    pub relation: String,
    pub kind: EdgeKind,
    pub breakable: bool,
}

/// How a broken edge is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakKind {
    /// Fill the holder's reference after both rows are inserted.
    DeferredUpdate,
    /// Clear the holder's reference before either row is deleted.
    DetachBeforeRemove,
}

/// An edge removed to break a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokenEdge {
    pub holder: SubjectId,
    pub target: SubjectId,
    pub relation: String,
    pub kind: BreakKind,
    /// Join-column values to write to the holder.
    pub changes: Vec<ColumnChange>,
}

/// Phases in execution order plus the edges broken to get there.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedPlan {
    pub phases: Vec<Vec<SubjectId>>,
    pub broken: Vec<BrokenEdge>,
}

impl SortedPlan {
    /// Total number of subjects across all phases.
    pub fn len(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }
}

pub struct DependencySorter;

impl DependencySorter {
    /// Collect the dependency edges between writing subjects.
    pub fn edges(set: &SubjectSet) -> Vec<DependencyEdge> {
        let mut edges: Vec<DependencyEdge> = Vec::new();
        let mut seen = HashSet::new();
        let mut push = |edge: DependencyEdge| {
            if seen.insert((edge.from, edge.to, edge.relation.clone(), edge.kind)) {
                edges.push(edge);
            }
        };

        for holder in set.iter().filter(|s| s.is_write()) {
            let metadata = holder.metadata();
            match holder.kind {
                OperationKind::Insert | OperationKind::Update => {
                    for change in &holder.change_set {
                        let (Some(target), Some(relation)) =
                            (change.new.referenced(), change.relation.as_ref())
                        else {
                            continue;
                        };
                        if set.get(target).map(|t| t.kind) != Some(OperationKind::Insert) {
                            continue;
                        }
                        let breakable = metadata
                            .find_relation(relation)
                            .is_some_and(|r| r.nullable);
                        push(DependencyEdge {
                            from: target,
                            to: holder.id(),
                            relation: relation.clone(),
                            kind: EdgeKind::Reference,
                            breakable,
                        });
                    }

                    if holder.kind == OperationKind::Update {
                        for relation in owning_relations(&metadata.relations) {
                            let touched = holder
                                .change_set
                                .iter()
                                .any(|c| c.relation.as_deref() == Some(relation.name.as_str()));
                            if !touched {
                                continue;
                            }
                            let Some(old) = previous_target(set, holder.id(), relation) else {
                                continue;
                            };
                            if old != holder.id()
                                && set.get(old).map(|t| t.kind) == Some(OperationKind::Remove)
                            {
                                push(DependencyEdge {
                                    from: holder.id(),
                                    to: old,
                                    relation: relation.name.clone(),
                                    kind: EdgeKind::UpdateBeforeRemove,
                                    breakable: false,
                                });
                            }
                        }
                    }
                }
                OperationKind::Remove => {
                    for relation in owning_relations(&metadata.relations) {
                        let mut targets: Vec<SubjectId> = holder.linked(&relation.name).collect();
                        targets.extend(previous_target(set, holder.id(), relation));
                        for target in targets {
                            if target == holder.id()
                                || set.get(target).map(|t| t.kind) != Some(OperationKind::Remove)
                            {
                                continue;
                            }
                            push(DependencyEdge {
                                from: holder.id(),
                                to: target,
                                relation: relation.name.clone(),
                                kind: EdgeKind::Removal,
                                breakable: relation.nullable,
                            });
                        }
                    }
                }
                OperationKind::NoOp => {}
            }
        }
        edges
    }

    /// Arrange writing subjects into phases, breaking nullable cycles.
    ///
    /// Breaking an insert edge rewrites the holder's change set so it no
    /// longer references the target; the returned [`BrokenEdge`] carries the
    /// values the deferred assignment must write.
    #[tracing::instrument(level = "debug", skip(set))]
    pub fn sort(set: &mut SubjectSet) -> Result<SortedPlan> {
        let nodes: Vec<SubjectId> = set.iter().filter(|s| s.is_write()).map(|s| s.id()).collect();
        let edges = Self::edges(set);
        let mut active = vec![true; edges.len()];
        let mut placed: HashSet<SubjectId> = HashSet::new();
        let mut plan = SortedPlan::default();

        loop {
            let remaining: Vec<SubjectId> =
                nodes.iter().copied().filter(|n| !placed.contains(n)).collect();
            if remaining.is_empty() {
                break;
            }

            let mut in_degree: HashMap<SubjectId, usize> =
                remaining.iter().map(|n| (*n, 0)).collect();
            for (edge, _) in edges.iter().zip(&active).filter(|(_, a)| **a) {
                if placed.contains(&edge.from) || placed.contains(&edge.to) {
                    continue;
                }
                *in_degree.entry(edge.to).or_default() += 1;
            }

            let ready: Vec<SubjectId> = remaining
                .iter()
                .copied()
                .filter(|n| in_degree.get(n).copied().unwrap_or(0) == 0)
                .collect();
            if !ready.is_empty() {
                placed.extend(ready.iter().copied());
                plan.phases.push(ready);
                continue;
            }

            let cycle = find_cycle(&remaining, &edges, &active, &placed);
            let Some(index) = cycle.iter().copied().find(|i| edges[*i].breakable) else {
                let mut path: Vec<String> = cycle
                    .iter()
                    .filter_map(|i| set.get(edges[*i].from))
                    .map(|s| s.entity_name().to_string())
                    .collect();
                if let Some(first) = path.first().cloned() {
                    path.push(first);
                }
                return Err(PersistError::circular_relations(path).into());
            };

            active[index] = false;
            let broken = break_edge(set, &edges[index]);
            tracing::debug!(
                holder = %broken.holder,
                target = %broken.target,
                relation = %broken.relation,
                "Broke dependency cycle on nullable relation"
            );
            plan.broken.push(broken);
        }

        tracing::debug!(
            phases = plan.phases.len(),
            broken = plan.broken.len(),
            "Subjects sorted"
        );
        Ok(plan)
    }
}

fn owning_relations(relations: &[RelationMetadata]) -> impl Iterator<Item = &RelationMetadata> {
    relations
        .iter()
        .filter(|r| r.behaviour().diff == DiffStrategy::JoinColumns)
}

/// Subject the holder's snapshot currently references through `relation`.
fn previous_target(
    set: &SubjectSet,
    holder: SubjectId,
    relation: &RelationMetadata,
) -> Option<SubjectId> {
    let subject = set.get(holder)?;
    let snapshot = subject.snapshot.as_ref()?;
    let pairs: Option<Vec<(String, Value)>> = relation
        .join_columns
        .iter()
        .map(|jc| {
            snapshot
                .value(&jc.column)
                .filter(|v| !v.is_null())
                .map(|v| (jc.referenced_column.clone(), v.clone()))
        })
        .collect();
    let identifier = Identifier::new(pairs?);
    set.by_identity(&IdentityKey::new(relation.target.clone(), &identifier))
}

/// Depth-first search for a cycle among the unplaced nodes; returns the
/// edge indices around it.
fn find_cycle(
    remaining: &[SubjectId],
    edges: &[DependencyEdge],
    active: &[bool],
    placed: &HashSet<SubjectId>,
) -> Vec<usize> {
    let mut adjacency: HashMap<SubjectId, Vec<usize>> = HashMap::new();
    for (index, edge) in edges.iter().enumerate() {
        if active[index] && !placed.contains(&edge.from) && !placed.contains(&edge.to) {
            adjacency.entry(edge.from).or_default().push(index);
        }
    }

    let mut visited = HashSet::new();
    for start in remaining {
        if visited.contains(start) {
            continue;
        }
        let mut path_nodes = Vec::new();
        let mut path_edges = Vec::new();
        if let Some(cycle) = detect_cycle_dfs(
            *start,
            edges,
            &adjacency,
            &mut visited,
            &mut path_nodes,
            &mut path_edges,
        ) {
            return cycle;
        }
    }
    Vec::new()
}

fn detect_cycle_dfs(
    node: SubjectId,
    edges: &[DependencyEdge],
    adjacency: &HashMap<SubjectId, Vec<usize>>,
    visited: &mut HashSet<SubjectId>,
    path_nodes: &mut Vec<SubjectId>,
    path_edges: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited.insert(node);
    path_nodes.push(node);

    for index in adjacency.get(&node).map(Vec::as_slice).unwrap_or_default() {
        let next = edges[*index].to;
        if let Some(position) = path_nodes.iter().position(|n| *n == next) {
            let mut cycle = path_edges[position..].to_vec();
            cycle.push(*index);
            return Some(cycle);
        }
        if !visited.contains(&next) {
            path_edges.push(*index);
            if let Some(cycle) =
                detect_cycle_dfs(next, edges, adjacency, visited, path_nodes, path_edges)
            {
                return Some(cycle);
            }
            path_edges.pop();
        }
    }

    path_nodes.pop();
    None
}

fn break_edge(set: &mut SubjectSet, edge: &DependencyEdge) -> BrokenEdge {
    match edge.kind {
        EdgeKind::Reference => {
            let holder = edge.to;
            let mut deferred = Vec::new();
            if let Some(subject) = set.get_mut(holder) {
                let inserting = subject.kind == OperationKind::Insert;
                let matches = |c: &ColumnChange| {
                    c.relation.as_deref() == Some(edge.relation.as_str())
                        && c.new.referenced() == Some(edge.from)
                };
                deferred = subject
                    .change_set
                    .iter()
                    .filter(|c| matches(c))
                    .cloned()
                    .collect();
                if inserting {
                    for change in subject.change_set.iter_mut().filter(|c| matches(c)) {
                        change.new = ChangeValue::Value(Value::Null);
                    }
                } else {
                    subject.change_set.retain(|c| !matches(c));
                }
            }
            BrokenEdge {
                holder,
                target: edge.from,
                relation: edge.relation.clone(),
                kind: BreakKind::DeferredUpdate,
                changes: deferred,
            }
        }
        EdgeKind::Removal | EdgeKind::UpdateBeforeRemove => {
            let holder = edge.from;
            let changes = set
                .get(holder)
                .and_then(|s| {
                    let relation = s.metadata().find_relation(&edge.relation)?;
                    Some(
                        relation
                            .join_columns
                            .iter()
                            .map(|jc| ColumnChange {
                                column: jc.column.clone(),
                                old: s.old_value(&jc.column).cloned(),
                                new: ChangeValue::Value(Value::Null),
                                relation: Some(edge.relation.clone()),
                            })
                            .collect(),
                    )
                })
                .unwrap_or_default();
            BrokenEdge {
                holder,
                target: edge.to,
                relation: edge.relation.clone(),
                kind: BreakKind::DetachBeforeRemove,
                changes,
            }
        }
    }
}
