mod arena;
mod assert;
mod backref;

pub use arena::{Arena, SlotId};
pub use backref::{BackRefs, CursorId};
