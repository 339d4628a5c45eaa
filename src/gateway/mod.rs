//! Gateway sidecar: the sole trusted process with credentials (spec §4.1).
//! Everything the sandbox does that touches the network or git metadata goes
//! through this module's HTTP API.

pub mod allowlist;
pub mod chat_proxy;
pub mod code_proxy;
pub mod credentials;
pub mod git_proxy;
pub mod model_proxy;
pub mod ratelimit;
pub mod reqlog;
pub mod server;
pub mod state;
pub mod worktree;

pub use server::{build_router, serve, AppState};
pub use state::GatewayState;
