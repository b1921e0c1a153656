//! Per-routine flow context
//!
//! Holds the variable slot table and the aggregated results of a routine.
//! Blocks of the same routine may be processed concurrently, so every table
//! sits behind one mutex; the version counter is atomic so states can be
//! checked without taking the lock.

use super::cfg::BlockId;
use super::mask::TypeMask;
use crate::error::{FlowError, Result};
use crate::program::RoutineId;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Slots below this index get bitset tracking
pub const TRACKED_SLOTS: u32 = 64;

/// Handle to a variable slot, only obtainable from the context owning it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableHandle {
    index: u32,
    owner: RoutineId,
}

impl VariableHandle {
    pub fn index(self) -> u32 {
        self.index
    }

    pub fn owner(self) -> RoutineId {
        self.owner
    }

    pub fn is_tracked(self) -> bool {
        self.index < TRACKED_SLOTS
    }

    pub(crate) fn bit(self) -> u64 {
        if self.is_tracked() {
            1 << self.index
        } else {
            0
        }
    }
}

#[derive(Debug, Default)]
struct ContextTables {
    slots: IndexSet<String>,
    /// Union of every mask ever written per slot
    aggregated: Vec<TypeMask>,
    return_mask: TypeMask,
    used: u64,
    aliases: IndexSet<u32>,
    enumerees: FxHashMap<BlockId, TypeMask>,
}

#[derive(Debug)]
pub struct FlowContext {
    owner: RoutineId,
    version: AtomicU32,
    tables: Mutex<ContextTables>,
}

impl FlowContext {
    pub fn new(owner: RoutineId) -> Self {
        Self {
            owner,
            version: AtomicU32::new(0),
            tables: Mutex::new(ContextTables::default()),
        }
    }

    /// Context for an expression evaluated outside any routine
    pub fn standalone() -> Self {
        Self::new(RoutineId::STANDALONE)
    }

    pub fn owner(&self) -> RoutineId {
        self.owner
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    /// Invalidate every state and handle issued so far
    pub fn bump_version(&self) -> u32 {
        *self.tables.lock() = ContextTables::default();
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Get or create the slot for `name`
    pub fn slot(&self, name: &str) -> VariableHandle {
        let mut tables = self.tables.lock();
        let (index, inserted) = tables.slots.insert_full(name.to_string());
        if inserted {
            tables.aggregated.push(TypeMask::BOTTOM);
        }
        VariableHandle {
            index: index as u32,
            owner: self.owner,
        }
    }

    pub fn existing_slot(&self, name: &str) -> Option<VariableHandle> {
        self.tables.lock().slots.get_index_of(name).map(|index| VariableHandle {
            index: index as u32,
            owner: self.owner,
        })
    }

    pub fn slot_name(&self, slot: VariableHandle) -> Option<String> {
        self.tables.lock().slots.get_index(slot.index as usize).cloned()
    }

    /// Every slot created so far
    pub fn slots(&self) -> Vec<VariableHandle> {
        (0..self.slot_count() as u32)
            .map(|index| VariableHandle {
                index,
                owner: self.owner,
            })
            .collect()
    }

    pub fn slot_count(&self) -> usize {
        self.tables.lock().slots.len()
    }

    /// Reject handles minted by another context
    pub fn check(&self, slot: VariableHandle) -> Result<()> {
        if slot.owner != self.owner {
            return Err(FlowError::ForeignSlot {
                slot: slot.index,
                owner: slot.owner,
                context: self.owner,
            });
        }
        Ok(())
    }

    /// Fold a written mask into the aggregate
    pub(crate) fn record(&self, slot: VariableHandle, mask: TypeMask) {
        let mut tables = self.tables.lock();
        tables.used |= slot.bit();
        if let Some(aggregate) = tables.aggregated.get_mut(slot.index as usize) {
            *aggregate |= mask;
        }
    }

    pub fn mark_used(&self, slot: VariableHandle) {
        self.tables.lock().used |= slot.bit();
    }

    /// Untracked slots always count as used
    pub fn is_used(&self, slot: VariableHandle) -> bool {
        !slot.is_tracked() || self.tables.lock().used & slot.bit() != 0
    }

    /// The slot may share storage with something else
    pub fn mark_alias(&self, slot: VariableHandle) {
        self.tables.lock().aliases.insert(slot.index);
    }

    pub fn is_alias(&self, slot: VariableHandle) -> bool {
        self.tables.lock().aliases.contains(&slot.index)
    }

    pub fn alias_slots(&self) -> Vec<VariableHandle> {
        self.tables
            .lock()
            .aliases
            .iter()
            .map(|&index| VariableHandle {
                index,
                owner: self.owner,
            })
            .collect()
    }

    /// Fold into the aggregated return type, `true` if it grew
    pub fn fold_return(&self, mask: TypeMask) -> bool {
        let mut tables = self.tables.lock();
        let merged = tables.return_mask | mask;
        let changed = merged != tables.return_mask;
        tables.return_mask = merged;
        changed
    }

    pub fn return_mask(&self) -> TypeMask {
        self.tables.lock().return_mask
    }

    /// Fold the mask a foreach enumerates, `true` if it grew
    pub fn record_enumeree(&self, block: BlockId, mask: TypeMask) -> bool {
        let mut tables = self.tables.lock();
        let entry = tables.enumerees.entry(block).or_default();
        let merged = *entry | mask;
        let changed = merged != *entry;
        *entry = merged;
        changed
    }

    pub fn enumeree(&self, block: BlockId) -> Option<TypeMask> {
        self.tables.lock().enumerees.get(&block).copied()
    }

    /// Aggregated masks by name, in slot order
    pub fn variables(&self) -> IndexMap<String, TypeMask> {
        let tables = self.tables.lock();
        tables
            .slots
            .iter()
            .zip(&tables.aggregated)
            .map(|(name, mask)| (name.clone(), *mask))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_stable() {
        let ctx = FlowContext::new(RoutineId(0));
        let a = ctx.slot("a");
        let b = ctx.slot("b");
        assert_eq!(ctx.slot("a"), a);
        assert_ne!(a, b);
        assert_eq!(ctx.existing_slot("b"), Some(b));
        assert_eq!(ctx.slot_name(b).as_deref(), Some("b"));
        assert_eq!(ctx.slot_count(), 2);
    }

    #[test]
    fn test_foreign_handle_is_rejected() {
        let ours = FlowContext::new(RoutineId(0));
        let theirs = FlowContext::new(RoutineId(1));
        let slot = theirs.slot("x");
        let err = ours.check(slot).unwrap_err();
        assert!(matches!(err, FlowError::ForeignSlot { slot: 0, .. }));
        assert!(theirs.check(slot).is_ok());
    }

    #[test]
    fn test_aggregate_and_return_fold() {
        let ctx = FlowContext::new(RoutineId(2));
        let x = ctx.slot("x");
        ctx.record(x, TypeMask::LONG);
        ctx.record(x, TypeMask::STRING);
        assert_eq!(ctx.variables()["x"], TypeMask::LONG | TypeMask::STRING);
        assert!(ctx.is_used(x));

        assert!(ctx.fold_return(TypeMask::NULL));
        assert!(!ctx.fold_return(TypeMask::NULL));
        assert!(ctx.fold_return(TypeMask::LONG));
        assert_eq!(ctx.return_mask(), TypeMask::NULL | TypeMask::LONG);
    }

    #[test]
    fn test_bump_version_resets_tables() {
        let ctx = FlowContext::new(RoutineId(0));
        let x = ctx.slot("x");
        ctx.mark_alias(x);
        ctx.fold_return(TypeMask::LONG);
        assert_eq!(ctx.bump_version(), 1);
        assert_eq!(ctx.version(), 1);
        assert_eq!(ctx.slot_count(), 0);
        assert!(ctx.return_mask().is_bottom());
        assert!(ctx.alias_slots().is_empty());
    }

    #[test]
    fn test_untracked_slots_count_as_used() {
        let ctx = FlowContext::standalone();
        let slots: Vec<_> = (0..70).map(|i| ctx.slot(&format!("v{i}"))).collect();
        assert!(!ctx.is_used(slots[3]));
        assert!(ctx.is_used(slots[65]));
    }
}
