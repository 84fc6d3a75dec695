use crate::SlotId;

/// Observer cursors over an arena of sessions.
///
/// An external walker (a dumper iterating live sessions across several
/// of its own invocations) registers a cursor pointing at the slot it
/// will visit next. When the engine frees a slot it calls `advance`
/// with the slot's successor so every cursor parked on the dead slot
/// moves on instead of dangling.
#[derive(Debug, Default)]
pub struct BackRefs {
    cursors: Vec<Option<SlotId>>,
}

/// Handle to one registered cursor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct CursorId(usize);

impl BackRefs {
    pub fn register(&mut self, at: Option<SlotId>) -> CursorId {
        self.cursors.push(at);
        CursorId(self.cursors.len() - 1)
    }

    pub fn get(&self, c: CursorId) -> Option<SlotId> {
        self.cursors.get(c.0).copied().flatten()
    }

    pub fn set(&mut self, c: CursorId, at: Option<SlotId>) {
        if let Some(slot) = self.cursors.get_mut(c.0) {
            *slot = at;
        }
    }

    /// Rewrite every cursor parked on `dead` to `next` (or unlink it
    /// when the freed slot was the last one).
    pub fn advance(&mut self, dead: SlotId, next: Option<SlotId>) {
        for cur in self.cursors.iter_mut() {
            if *cur == Some(dead) {
                *cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_moves_to_neighbour_on_free() {
        let mut refs = BackRefs::default();
        let c = refs.register(Some(SlotId(3)));
        refs.advance(SlotId(3), Some(SlotId(7)));
        assert_eq!(refs.get(c), Some(SlotId(7)));
        refs.advance(SlotId(7), None);
        assert_eq!(refs.get(c), None);
    }

    #[test]
    fn unrelated_cursors_untouched() {
        let mut refs = BackRefs::default();
        let a = refs.register(Some(SlotId(1)));
        let b = refs.register(Some(SlotId(2)));
        refs.advance(SlotId(1), None);
        assert_eq!(refs.get(a), None);
        assert_eq!(refs.get(b), Some(SlotId(2)));
    }
}
