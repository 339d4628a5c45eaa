//! Chat bridge (spec §4.4): the one place a human and the agent meet.
//! [`inbound`] is the Socket Mode listener that turns trusted chat events
//! into task records and drop-zone files; [`outbound`] is the watcher that
//! turns drop-zone notification intents into paced, threaded chat sends.
//! [`thread_index`] is the persisted state both sides use to agree on which
//! `context_id` owns which thread root.

pub mod inbound;
pub mod outbound;
pub mod thread_index;

use serde::{Deserialize, Serialize};

/// The three inbound event shapes the bridge accepts (spec §4.4, §9 "the
/// source conflates two subtly different chat channels ... a reimplementation
/// should keep the distinction explicit"). Kept distinct all the way through
/// to context-record creation rather than collapsed into one "DM" shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A message from an allowed user to themselves, prefixed with the
    /// configured self-DM task prefix.
    SelfDmTask,
    /// A threaded reply under a notification the bot itself posted.
    BotDmReply,
    /// A direct message to the bot that is not a self-DM.
    BotDmDirect,
}

/// `{event_kind, user, channel, thread_ts?, text, ts}` (spec §3 "Inbound
/// chat event").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event_kind: EventKind,
    pub user: String,
    pub channel: String,
    pub thread_ts: Option<String>,
    pub text: String,
    pub ts: String,
}

/// One top-level notification is a `Summary` + `Detail` pair; anything after
/// that against the same thread is a `Reply`; `Ack` is the short
/// acknowledgement sent back to a self-DM (spec §8 Scenario A).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Summary,
    Detail,
    Reply,
    Ack,
}

/// A notification intent dropped into `sharing/notifications/` by the agent
/// or an analyzer (spec §3 "Outbound chat message"). `thread_key: None`
/// means "start a new thread or let the bridge resolve one from
/// `context_id`"; `Some(ts)` means "reply under this exact ts".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationIntent {
    pub kind: NotificationKind,
    pub channel: String,
    pub thread_key: Option<String>,
    pub body: String,
    pub context_id: Option<String>,
}
