//! Call graph for return-type propagation
//!
//! Nodes are routines, edges are `(caller, callee, call site)` triples.
//! Every callee owns an exit node remembering which blocks read its return
//! type and which return mask they were last shown.

use crate::dataflow::{BlockKey, TypeMask};
use crate::program::RoutineId;
use indexmap::IndexSet;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

/// Position of a call: the calling block and the call's order inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSite {
    pub block: BlockKey,
    pub ordinal: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallEdge {
    pub caller: RoutineId,
    pub callee: RoutineId,
    pub site: CallSite,
}

/// Subscribers and last published return mask of a routine
#[derive(Debug, Clone, Default)]
pub struct ExitNode {
    pub subscribers: IndexSet<BlockKey>,
    pub published: Option<TypeMask>,
}

#[derive(Debug, Default)]
struct GraphInner {
    edges: IndexSet<CallEdge>,
    callees: FxHashMap<RoutineId, IndexSet<RoutineId>>,
    callers: FxHashMap<RoutineId, IndexSet<RoutineId>>,
    exits: FxHashMap<RoutineId, ExitNode>,
}

/// Concurrent call graph, all updates go through one lock
#[derive(Debug, Default)]
pub struct CallGraph {
    inner: Mutex<GraphInner>,
}

impl CallGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the edge and subscribe the calling block, `true` if the edge is new
    pub fn add_call(&self, site: CallSite, callee: RoutineId) -> bool {
        let caller = site.block.routine;
        let mut inner = self.inner.lock();
        let inserted = inner.edges.insert(CallEdge { caller, callee, site });
        inner.callees.entry(caller).or_default().insert(callee);
        inner.callers.entry(callee).or_default().insert(caller);
        inner.exits.entry(callee).or_default().subscribers.insert(site.block);
        inserted
    }

    pub fn published(&self, routine: RoutineId) -> Option<TypeMask> {
        self.inner.lock().exits.get(&routine).and_then(|exit| exit.published)
    }

    /// Store the return mask; yields the subscribers to ping when it changed
    /// or when this is the first publication
    pub fn publish(&self, routine: RoutineId, mask: TypeMask) -> Option<Vec<BlockKey>> {
        let mut inner = self.inner.lock();
        let exit = inner.exits.entry(routine).or_default();
        if exit.published == Some(mask) {
            return None;
        }
        exit.published = Some(mask);
        Some(exit.subscribers.iter().copied().collect())
    }

    pub fn exit_node(&self, routine: RoutineId) -> Option<ExitNode> {
        self.inner.lock().exits.get(&routine).cloned()
    }

    pub fn callees_of(&self, routine: RoutineId) -> Vec<RoutineId> {
        self.inner
            .lock()
            .callees
            .get(&routine)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn callers_of(&self, routine: RoutineId) -> Vec<RoutineId> {
        self.inner
            .lock()
            .callers
            .get(&routine)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn edges(&self) -> Vec<CallEdge> {
        self.inner.lock().edges.iter().copied().collect()
    }

    /// `roots` plus every routine that calls one of them, directly or not
    pub fn transitive_callers(&self, roots: &[RoutineId]) -> IndexSet<RoutineId> {
        let inner = self.inner.lock();
        let mut seen: IndexSet<RoutineId> = roots.iter().copied().collect();
        let mut stack: Vec<RoutineId> = roots.to_vec();
        while let Some(routine) = stack.pop() {
            if let Some(callers) = inner.callers.get(&routine) {
                for &caller in callers {
                    if seen.insert(caller) {
                        stack.push(caller);
                    }
                }
            }
        }
        seen
    }

    /// Forget what a routine published and the calls it made, its exit
    /// subscribers stay so callers still get pinged
    pub fn reset_routine(&self, routine: RoutineId) {
        let mut inner = self.inner.lock();
        if let Some(exit) = inner.exits.get_mut(&routine) {
            exit.published = None;
        }
        inner.edges.retain(|edge| edge.caller != routine);
        if let Some(callees) = inner.callees.remove(&routine) {
            for callee in callees {
                if let Some(callers) = inner.callers.get_mut(&callee) {
                    callers.shift_remove(&routine);
                }
            }
        }
        for exit in inner.exits.values_mut() {
            exit.subscribers.retain(|block| block.routine != routine);
        }
    }

    pub fn strongly_connected_components(&self) -> Vec<Vec<RoutineId>> {
        let inner = self.inner.lock();
        let mut nodes: IndexSet<RoutineId> = IndexSet::new();
        for edge in &inner.edges {
            nodes.insert(edge.caller);
            nodes.insert(edge.callee);
        }
        tarjan_scc(&inner.callees, &nodes)
    }

    /// Routines on call cycles through any of `routines`, sorted
    pub fn cycles_through(&self, routines: &[RoutineId]) -> Vec<RoutineId> {
        let wanted: FxHashSet<RoutineId> = routines.iter().copied().collect();
        let self_loops: FxHashSet<RoutineId> = {
            let inner = self.inner.lock();
            inner
                .edges
                .iter()
                .filter(|edge| edge.caller == edge.callee)
                .map(|edge| edge.caller)
                .collect()
        };
        let mut found: Vec<RoutineId> = self
            .strongly_connected_components()
            .into_iter()
            .filter(|scc| scc.len() > 1 || scc.iter().any(|r| self_loops.contains(r)))
            .filter(|scc| scc.iter().any(|r| wanted.contains(r)))
            .flatten()
            .collect();
        found.sort();
        found.dedup();
        found
    }
}

// ---------------------------------------------------------------------------
// Tarjan's SCC algorithm
// ---------------------------------------------------------------------------

struct TarjanState {
    index_counter: usize,
    stack: Vec<RoutineId>,
    on_stack: FxHashSet<RoutineId>,
    indices: FxHashMap<RoutineId, usize>,
    lowlinks: FxHashMap<RoutineId, usize>,
    sccs: Vec<Vec<RoutineId>>,
}

fn tarjan_scc(
    graph: &FxHashMap<RoutineId, IndexSet<RoutineId>>,
    nodes: &IndexSet<RoutineId>,
) -> Vec<Vec<RoutineId>> {
    let mut state = TarjanState {
        index_counter: 0,
        stack: Vec::new(),
        on_stack: FxHashSet::default(),
        indices: FxHashMap::default(),
        lowlinks: FxHashMap::default(),
        sccs: Vec::new(),
    };

    for &node in nodes {
        if !state.indices.contains_key(&node) {
            strongconnect(node, graph, &mut state);
        }
    }

    state.sccs
}

fn strongconnect(
    v: RoutineId,
    graph: &FxHashMap<RoutineId, IndexSet<RoutineId>>,
    state: &mut TarjanState,
) {
    let idx = state.index_counter;
    state.index_counter += 1;
    state.indices.insert(v, idx);
    state.lowlinks.insert(v, idx);
    state.stack.push(v);
    state.on_stack.insert(v);

    if let Some(callees) = graph.get(&v) {
        for &w in callees {
            if !state.indices.contains_key(&w) {
                strongconnect(w, graph, state);
                let w_low = state.lowlinks[&w];
                if w_low < state.lowlinks[&v] {
                    state.lowlinks.insert(v, w_low);
                }
            } else if state.on_stack.contains(&w) {
                let w_idx = state.indices[&w];
                if w_idx < state.lowlinks[&v] {
                    state.lowlinks.insert(v, w_idx);
                }
            }
        }
    }

    // v is the root of a component
    if state.lowlinks[&v] == state.indices[&v] {
        let mut scc = Vec::new();
        while let Some(w) = state.stack.pop() {
            state.on_stack.remove(&w);
            scc.push(w);
            if w == v {
                break;
            }
        }
        state.sccs.push(scc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::BlockId;

    fn site(routine: u32, block: u32) -> CallSite {
        CallSite {
            block: BlockKey::new(RoutineId(routine), BlockId(block)),
            ordinal: 0,
        }
    }

    #[test]
    fn test_add_call_subscribes_block() {
        let graph = CallGraph::new();
        assert!(graph.add_call(site(0, 2), RoutineId(1)));
        assert!(!graph.add_call(site(0, 2), RoutineId(1)));

        let exit = graph.exit_node(RoutineId(1)).unwrap();
        assert_eq!(exit.subscribers.len(), 1);
        assert_eq!(graph.callees_of(RoutineId(0)), vec![RoutineId(1)]);
        assert_eq!(graph.callers_of(RoutineId(1)), vec![RoutineId(0)]);
    }

    #[test]
    fn test_publish_only_reports_changes() {
        let graph = CallGraph::new();
        graph.add_call(site(0, 3), RoutineId(1));

        let first = graph.publish(RoutineId(1), TypeMask::BOTTOM).unwrap();
        assert_eq!(first, vec![BlockKey::new(RoutineId(0), BlockId(3))]);
        assert!(graph.publish(RoutineId(1), TypeMask::BOTTOM).is_none());
        assert!(graph.publish(RoutineId(1), TypeMask::LONG).is_some());
        assert_eq!(graph.published(RoutineId(1)), Some(TypeMask::LONG));
    }

    #[test]
    fn test_mutual_recursion_forms_one_component() {
        let graph = CallGraph::new();
        graph.add_call(site(0, 0), RoutineId(1));
        graph.add_call(site(1, 0), RoutineId(0));
        graph.add_call(site(1, 0), RoutineId(2));

        let sccs = graph.strongly_connected_components();
        assert!(sccs.iter().any(|scc| scc.len() == 2));
        assert_eq!(graph.cycles_through(&[RoutineId(1)]), vec![RoutineId(0), RoutineId(1)]);
        assert!(graph.cycles_through(&[RoutineId(2)]).is_empty());
    }

    #[test]
    fn test_self_recursion_is_a_cycle() {
        let graph = CallGraph::new();
        graph.add_call(site(4, 1), RoutineId(4));
        assert_eq!(graph.cycles_through(&[RoutineId(4)]), vec![RoutineId(4)]);
    }

    #[test]
    fn test_transitive_callers() {
        let graph = CallGraph::new();
        graph.add_call(site(0, 0), RoutineId(1));
        graph.add_call(site(1, 0), RoutineId(2));
        graph.add_call(site(3, 0), RoutineId(0));

        let callers = graph.transitive_callers(&[RoutineId(2)]);
        assert_eq!(callers.len(), 4);
        assert!(!graph.transitive_callers(&[RoutineId(3)]).contains(&RoutineId(0)));
    }

    #[test]
    fn test_reset_routine_drops_outgoing_calls() {
        let graph = CallGraph::new();
        graph.add_call(site(0, 1), RoutineId(1));
        graph.publish(RoutineId(0), TypeMask::LONG);
        graph.reset_routine(RoutineId(0));

        assert!(graph.edges().is_empty());
        assert!(graph.published(RoutineId(0)).is_none());
        assert!(graph.exit_node(RoutineId(1)).unwrap().subscribers.is_empty());
    }
}
