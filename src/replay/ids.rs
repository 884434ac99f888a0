//! Handle aliases shared across the request/query/connection slabs.
//!
//! All three are the same underlying generational key (see `slab`); they're
//! aliased under distinct names purely for readability at call sites, not
//! for type-level separation — mixing them up is still possible but the
//! slab itself treats an id from the wrong table as "not found" rather than
//! as a memory-safety issue, so the lack of newtype wrappers costs
//! robustness, not soundness.

use crate::replay::slab::Key;

pub type RequestId = Key;
pub type QueryId = Key;
pub type ConnectionId = Key;
