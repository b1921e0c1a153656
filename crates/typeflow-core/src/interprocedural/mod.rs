//! Interprocedural plumbing for return-type propagation
//!
//! Calls between analyzable routines are recorded as edges of a call graph.
//! Every routine owns an exit node holding the last return mask it
//! published and the caller blocks subscribed to it. Publishing a wider
//! mask hands the subscribers back to the scheduler, which re-queues or
//! parks them.
//!
//! Strongly connected components of the graph name the routines involved
//! when the dirty set stops shrinking.

pub mod call_graph;

pub use call_graph::{CallEdge, CallGraph, CallSite, ExitNode};
