//! Container lifecycle manager (spec §4.3): starts sandbox containers with
//! the correct mount topology and routing, correlates each run with its
//! originating event, and captures artifacts. [`lifecycle`] owns the
//! `bollard`-driven start/exec/cleanup operations; [`correlation`] is the
//! on-disk run-log index both the lifecycle manager and `jib-logs` read.

pub mod correlation;
pub mod lifecycle;

pub use correlation::{CorrelationIndex, RunRecord};
pub use lifecycle::{ContainerManager, ExecInput, ExecOutcome, RepoMount, StartSessionInput};
