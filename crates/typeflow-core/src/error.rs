//! Error taxonomy for the flow analysis
//!
//! Only invariant violations of the engine itself are errors. Anything a
//! source program can provoke (unbound calls, unknown classes, dynamic
//! variables) is absorbed by widening the affected mask to `Any`.

use crate::dataflow::BlockId;
use crate::program::RoutineId;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T, E = FlowError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// A slot handle minted by one routine's context was used against another
    #[error("variable slot {slot} belongs to routine {owner}, not to routine {context}")]
    ForeignSlot {
        slot: u32,
        owner: RoutineId,
        context: RoutineId,
    },

    /// A flow state outlived a structural rewrite of its routine
    #[error("flow state of version {found} used against context version {expected}")]
    StaleState { expected: u32, found: u32 },

    /// A non-entry block was dequeued before any predecessor handed it a state
    #[error("block {block} of routine {routine} has no incoming flow state")]
    MissingState { routine: RoutineId, block: BlockId },

    #[error("block {block} does not exist in routine {routine}")]
    UnknownBlock { routine: RoutineId, block: BlockId },

    #[error("routine {0} does not exist")]
    UnknownRoutine(RoutineId),

    /// Dirty flushes stopped making progress while work was still parked
    #[error("analysis did not converge; suspected cyclic routines: {}", format_routines(.routines))]
    NonConvergence { routines: Vec<RoutineId> },

    /// The drain loop was abandoned between batches
    #[error("analysis abandoned with {pending} blocks still pending")]
    Abandoned { pending: usize },

    #[error("invalid analysis configuration: {0}")]
    InvalidConfig(String),
}

fn format_routines(routines: &[RoutineId]) -> String {
    routines
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
