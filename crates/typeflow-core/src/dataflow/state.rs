//! Flow state: variable masks at one program point
//!
//! One state is attached to each block entry and a clone of it is threaded
//! through the walker while the block is visited. Merging is the pointwise
//! lattice join; a variable missing on one side contributes `null`.

use super::context::{FlowContext, VariableHandle};
use super::mask::TypeMask;
use crate::error::{FlowError, Result};
use crate::program::RoutineId;
use smallvec::SmallVec;

#[derive(Debug, Clone)]
pub struct FlowState {
    owner: RoutineId,
    version: u32,
    masks: SmallVec<[TypeMask; 8]>,
    /// Tracked slots assigned on some path reaching this point
    initialized: u64,
    /// Tracked slots whose integer value is provably below `PHP_INT_MAX`
    lt_long_max: u64,
    /// Some dynamic scope access may have created or changed any variable
    all_unknown: bool,
}

impl FlowState {
    pub fn new(ctx: &FlowContext) -> Self {
        Self {
            owner: ctx.owner(),
            version: ctx.version(),
            masks: SmallVec::new(),
            initialized: 0,
            lt_long_max: 0,
            all_unknown: false,
        }
    }

    pub fn owner(&self) -> RoutineId {
        self.owner
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Fail if the context was rewritten after this state was created
    pub fn check_version(&self, ctx: &FlowContext) -> Result<()> {
        if self.version != ctx.version() {
            return Err(FlowError::StaleState {
                expected: ctx.version(),
                found: self.version,
            });
        }
        Ok(())
    }

    fn check(&self, slot: VariableHandle) -> Result<usize> {
        if slot.owner() != self.owner {
            return Err(FlowError::ForeignSlot {
                slot: slot.index(),
                owner: slot.owner(),
                context: self.owner,
            });
        }
        Ok(slot.index() as usize)
    }

    fn raw(&self, index: usize) -> TypeMask {
        self.masks.get(index).copied().unwrap_or_default()
    }

    fn write(&mut self, index: usize, mask: TypeMask) {
        if self.masks.len() <= index {
            self.masks.resize(index + 1, TypeMask::BOTTOM);
        }
        self.masks[index] = mask;
    }

    /// Current mask, `Any|Ref` for never-set slots of an all-unknown state
    pub fn get(&self, slot: VariableHandle) -> Result<TypeMask> {
        let index = self.check(slot)?;
        let mask = self.raw(index);
        if !self.is_assigned(slot, mask) && self.all_unknown {
            return Ok(TypeMask::ANY.with_ref());
        }
        Ok(mask)
    }

    fn is_assigned(&self, slot: VariableHandle, mask: TypeMask) -> bool {
        if slot.is_tracked() {
            self.initialized & slot.bit() != 0
        } else {
            !mask.is_bottom()
        }
    }

    /// Untracked slots are always considered set
    pub fn is_initialized(&self, slot: VariableHandle) -> bool {
        !slot.is_tracked() || self.initialized & slot.bit() != 0
    }

    pub fn is_all_unknown(&self) -> bool {
        self.all_unknown
    }

    /// Assign `mask`, marking the slot initialized and folding the value
    /// into the context aggregate. Alias slots keep the ref flag and widen
    /// every other alias slot.
    pub fn set(&mut self, ctx: &FlowContext, slot: VariableHandle, mask: TypeMask) -> Result<()> {
        ctx.check(slot)?;
        let index = self.check(slot)?;
        let mut mask = mask;
        if ctx.is_alias(slot) {
            mask = mask.with_ref();
            for other in ctx.alias_slots() {
                if other == slot {
                    continue;
                }
                let other_index = self.check(other)?;
                let widened = self.raw(other_index) | mask;
                self.write(other_index, widened);
                self.initialized |= other.bit();
                ctx.record(other, widened);
            }
        }
        self.write(index, mask);
        self.initialized |= slot.bit();
        self.lt_long_max &= !slot.bit();
        ctx.record(slot, mask);
        Ok(())
    }

    /// Restrict a slot along one branch, the aggregate is left alone
    pub(crate) fn narrow(&mut self, slot: VariableHandle, mask: TypeMask) -> Result<()> {
        let index = self.check(slot)?;
        self.write(index, mask);
        self.initialized |= slot.bit();
        Ok(())
    }

    /// `unset($x)`: neither a type nor presence survives
    pub fn unset(&mut self, slot: VariableHandle) -> Result<()> {
        let index = self.check(slot)?;
        self.write(index, TypeMask::BOTTOM);
        self.initialized &= !slot.bit();
        self.lt_long_max &= !slot.bit();
        Ok(())
    }

    /// Every variable, known or not, may now hold anything
    pub fn set_all_unknown(&mut self, ctx: &FlowContext) {
        self.all_unknown = true;
        self.lt_long_max = 0;
        let unknown = TypeMask::ANY.with_ref();
        for slot in ctx.slots() {
            if slot.owner() != self.owner {
                continue;
            }
            self.write(slot.index() as usize, unknown);
            self.initialized |= slot.bit();
            ctx.record(slot, unknown);
        }
    }

    /// Alias slots may be changed by anything the routine calls
    pub fn widen_aliases(&mut self, ctx: &FlowContext) -> Result<()> {
        let unknown = TypeMask::ANY.with_ref();
        for slot in ctx.alias_slots() {
            let index = self.check(slot)?;
            self.write(index, unknown);
            self.initialized |= slot.bit();
            self.lt_long_max &= !slot.bit();
            ctx.record(slot, unknown);
        }
        Ok(())
    }

    pub fn note_lt_long_max(&mut self, slot: VariableHandle) {
        self.lt_long_max |= slot.bit();
    }

    pub fn has_lt_long_max(&self, slot: VariableHandle) -> bool {
        self.lt_long_max & slot.bit() != 0
    }

    /// Value contributed to a merge, `None` when the slot is absent
    fn incoming(&self, index: usize) -> Option<TypeMask> {
        let mask = self.raw(index);
        let present = if index < 64 {
            self.initialized & (1 << index) != 0
        } else {
            !mask.is_bottom()
        };
        if present {
            Some(mask)
        } else if self.all_unknown {
            Some(TypeMask::ANY.with_ref())
        } else {
            None
        }
    }

    /// Lattice join of two states of the same routine and version
    pub fn merge(&self, other: &FlowState) -> Result<FlowState> {
        if self.owner != other.owner || self.version != other.version {
            return Err(FlowError::StaleState {
                expected: self.version,
                found: other.version,
            });
        }
        let len = self.masks.len().max(other.masks.len());
        let mut masks = SmallVec::with_capacity(len);
        for index in 0..len {
            let merged = match (self.incoming(index), other.incoming(index)) {
                (Some(a), Some(b)) => a | b,
                (Some(m), None) | (None, Some(m)) => m.with_null(),
                (None, None) => TypeMask::BOTTOM,
            };
            masks.push(merged);
        }
        Ok(FlowState {
            owner: self.owner,
            version: self.version,
            masks,
            initialized: self.initialized | other.initialized,
            lt_long_max: self.lt_long_max & other.lt_long_max,
            all_unknown: self.all_unknown || other.all_unknown,
        })
    }

    /// Join `other` into `self`, `true` if anything changed
    pub fn merge_from(&mut self, other: &FlowState) -> Result<bool> {
        let merged = self.merge(other)?;
        let changed = merged != *self;
        *self = merged;
        Ok(changed)
    }
}

impl PartialEq for FlowState {
    fn eq(&self, other: &Self) -> bool {
        let len = self.masks.len().max(other.masks.len());
        self.owner == other.owner
            && self.version == other.version
            && self.initialized == other.initialized
            && self.lt_long_max == other.lt_long_max
            && self.all_unknown == other.all_unknown
            && (0..len).all(|i| self.raw(i) == other.raw(i))
    }
}

impl Eq for FlowState {}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn context() -> FlowContext {
        FlowContext::new(RoutineId(0))
    }

    #[test]
    fn test_set_marks_initialized_and_aggregates() {
        let ctx = context();
        let x = ctx.slot("x");
        let mut state = FlowState::new(&ctx);
        assert!(!state.is_initialized(x));
        assert_eq!(state.get(x).unwrap(), TypeMask::BOTTOM);

        state.set(&ctx, x, TypeMask::LONG).unwrap();
        assert!(state.is_initialized(x));
        assert_eq!(state.get(x).unwrap(), TypeMask::LONG);
        assert_eq!(ctx.variables()["x"], TypeMask::LONG);

        state.unset(x).unwrap();
        assert!(!state.is_initialized(x));
        assert!(state.get(x).unwrap().is_bottom());
    }

    #[test]
    fn test_all_unknown_reads_any_ref() {
        let ctx = context();
        let x = ctx.slot("x");
        let mut state = FlowState::new(&ctx);
        state.set(&ctx, x, TypeMask::STRING).unwrap();
        state.set_all_unknown(&ctx);
        let later = ctx.slot("later");
        assert_eq!(state.get(x).unwrap(), TypeMask::ANY.with_ref());
        assert_eq!(state.get(later).unwrap(), TypeMask::ANY.with_ref());
    }

    #[test]
    fn test_merge_missing_side_is_null() {
        let ctx = context();
        let x = ctx.slot("x");
        let y = ctx.slot("y");
        let mut left = FlowState::new(&ctx);
        let mut right = FlowState::new(&ctx);
        left.set(&ctx, x, TypeMask::LONG).unwrap();
        right.set(&ctx, x, TypeMask::DOUBLE).unwrap();
        right.set(&ctx, y, TypeMask::STRING).unwrap();

        let merged = left.merge(&right).unwrap();
        assert_eq!(merged.get(x).unwrap(), TypeMask::NUMBER);
        assert_eq!(merged.get(y).unwrap(), TypeMask::STRING | TypeMask::NULL);
    }

    #[test]
    fn test_notes_survive_only_when_on_both_paths() {
        let ctx = context();
        let i = ctx.slot("i");
        let mut left = FlowState::new(&ctx);
        left.set(&ctx, i, TypeMask::LONG).unwrap();
        let mut right = left.clone();
        left.note_lt_long_max(i);

        let mut merged = left.clone();
        assert!(merged.merge_from(&right).unwrap());
        assert!(!merged.has_lt_long_max(i));

        right.note_lt_long_max(i);
        let both = left.merge(&right).unwrap();
        assert!(both.has_lt_long_max(i));
        assert_eq!(both, left);
    }

    #[test]
    fn test_alias_write_widens_other_aliases() {
        let ctx = context();
        let a = ctx.slot("a");
        let b = ctx.slot("b");
        let mut state = FlowState::new(&ctx);
        state.set(&ctx, b, TypeMask::LONG).unwrap();
        ctx.mark_alias(a);
        ctx.mark_alias(b);

        state.set(&ctx, a, TypeMask::STRING).unwrap();
        assert_eq!(state.get(a).unwrap(), TypeMask::STRING.with_ref());
        assert_eq!(
            state.get(b).unwrap(),
            (TypeMask::LONG | TypeMask::STRING).with_ref()
        );

        state.widen_aliases(&ctx).unwrap();
        assert!(state.get(b).unwrap().is_any());
    }

    #[test]
    fn test_stale_and_foreign_are_rejected() {
        let ctx = context();
        let state = FlowState::new(&ctx);
        ctx.bump_version();
        assert!(matches!(
            state.check_version(&ctx),
            Err(FlowError::StaleState { expected: 1, found: 0 })
        ));

        let other = FlowContext::new(RoutineId(9));
        let foreign = other.slot("x");
        assert!(matches!(state.get(foreign), Err(FlowError::ForeignSlot { .. })));

        let fresh = FlowState::new(&ctx);
        assert!(state.merge(&fresh).is_err());
    }

    #[quickcheck]
    fn merge_is_commutative(left: Vec<(u8, u16)>, right: Vec<(u8, u16)>) -> bool {
        let ctx = context();
        let build = |writes: &[(u8, u16)]| {
            let mut state = FlowState::new(&ctx);
            for &(slot, bits) in writes {
                let handle = ctx.slot(&format!("v{}", slot % 80));
                state
                    .set(&ctx, handle, TypeMask::from_bits(u64::from(bits) & 0x1ff))
                    .unwrap();
            }
            state
        };
        let a = build(&left);
        let b = build(&right);
        a.merge(&b).unwrap() == b.merge(&a).unwrap()
    }
}
