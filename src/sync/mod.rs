//! External sync adapters (spec §4.6): [`docs`] is the timer-driven bulk
//! pull for documentation-like sources, writing a stable local mirror the
//! same way `container::correlation` writes a stable run-log mirror.
//! [`tickets`] is a thin on-demand proxy shape for ticketing/code-hosting
//! reads — no local mirror, every call obeys repository policy. The spec's
//! Open Question on which backend protocol answers `tickets` is left
//! unresolved on purpose (spec §9): this module commits to the interface,
//! not a vendor.

pub mod docs;
pub mod tickets;

pub use docs::{SyncSummary, SyncedItem};
