//! Buffer pool replacement policies, selected at compile time.
//!
//! - **LRU** (`replacement_lru`, default): recency list over frame indices.
//! - **Clock** (`replacement_clock`): per-frame hot bit and a sweeping hand.
//!
//! Exactly one must be enabled. Both expose a `PolicyState` with
//! `record_hit`, `on_frame_assigned` and `evict_frame`. `evict_frame` returns
//! an unpinned victim with its metadata mutex held, so the caller can claim
//! the frame before anyone else can pin it.

#[cfg(all(feature = "replacement_lru", feature = "replacement_clock"))]
compile_error!("Enable only one buffer replacement policy feature (LRU or Clock)");

#[cfg(not(any(feature = "replacement_lru", feature = "replacement_clock")))]
compile_error!("At least one buffer replacement policy feature must be enabled");

#[cfg(feature = "replacement_lru")]
mod lru;
#[cfg(feature = "replacement_lru")]
pub(crate) use lru::PolicyState;

#[cfg(feature = "replacement_clock")]
mod clock;
#[cfg(feature = "replacement_clock")]
pub(crate) use clock::PolicyState;
