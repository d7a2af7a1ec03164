// ── Change recording & replay ──
//
// Every recordable mutation is captured as one self-contained
// `ChangeEntry`. A `ChangeLog` of them can be shipped to another controller
// instance and replayed onto its copy of the model, merging the two editing
// sessions field by field.

mod entry;
mod recorder;
mod replay;

pub use entry::{ChangeEntry, ChangeLog};
pub use recorder::ChangeRecorder;
pub use replay::{ChangeReplayer, ReplaySummary};
