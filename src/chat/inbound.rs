//! Inbound chat listener (spec §4.4 "Inbound path (socket listener)"):
//! accepts only the three trusted event shapes and turns each into a
//! drop-zone file plus a context-record update. Grounded directly on
//! `messaging::slack::SlackAdapter::start`'s Socket Mode bootstrap —
//! `auth.test` to resolve the bot's own user id, a
//! `SlackClientSocketModeListener` wired to a push-event callback that reads
//! shared state out of `SlackClientEventsUserState` — reduced from that
//! adapter's general per-channel routing to this bridge's DM-only,
//! three-shape trust model.

use crate::chat::thread_index::ThreadIndex;
use crate::chat::{EventKind, InboundEvent};
use crate::config::Config;
use crate::gateway::chat_proxy::{ChatProxy, PostMessageRequest};
use crate::tasks::store::UpsertContextInput;
use crate::{thread_context_id, ContainerId};
use anyhow::Context as _;
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::mpsc;

fn host_caller() -> ContainerId {
    ContainerId::from("host-chat-bridge")
}

/// State shared with the Socket Mode callback via `SlackClientEventsUserState`.
struct InboundState {
    tx: mpsc::Sender<InboundEvent>,
    bot_user_id: String,
    self_dm_prefix: String,
    allowed_users: Option<Vec<String>>,
    thread_index: Arc<ThreadIndex>,
}

pub struct InboundListener {
    bot_token: String,
    app_token: String,
    config: Arc<Config>,
    chat: Arc<ChatProxy>,
    thread_index: Arc<ThreadIndex>,
    deps: crate::HostDeps,
}

impl InboundListener {
    pub fn new(
        bot_token: String,
        app_token: String,
        config: Arc<Config>,
        chat: Arc<ChatProxy>,
        thread_index: Arc<ThreadIndex>,
        deps: crate::HostDeps,
    ) -> Self {
        Self { bot_token, app_token, config, chat, thread_index, deps }
    }

    /// Resolve the bot's own user id, start the Socket Mode connection, and
    /// spawn the task-semantics processor. Returns once the listener is
    /// connected; the listener itself keeps running in the background.
    pub async fn start(self: Arc<Self>) -> anyhow::Result<()> {
        let client = Arc::new(
            SlackClient::new(SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?),
        );
        let token = SlackApiToken::new(SlackApiTokenValue(self.bot_token.clone()));
        let auth_response = client
            .open_session(&token)
            .auth_test()
            .await
            .context("failed to call auth.test for bot user id")?;
        let bot_user_id = auth_response.user_id.0.clone();
        tracing::info!(bot_user_id = %bot_user_id, "chat bridge resolved bot user id");

        let (tx, mut rx) = mpsc::channel::<InboundEvent>(256);
        let state = Arc::new(InboundState {
            tx,
            bot_user_id,
            self_dm_prefix: self.config.chat.self_dm_prefix.clone(),
            allowed_users: self.config.chat.allowed_users.clone(),
            thread_index: self.thread_index.clone(),
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        // The socket mode listener owns a persistent WebSocket connection and
        // needs its own client instance for that, distinct from the shared
        // REST client above (spec §4.4, teacher's `start()` comment).
        let listener_client = Arc::new(
            SlackClient::new(SlackClientHyperConnector::new().context("failed to create slack socket mode connector")?),
        );
        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client)
                .with_error_handler(slack_error_handler)
                .with_user_state(state),
        );
        let listener =
            SlackClientSocketModeListener::new(&SlackClientSocketModeConfig::new(), listener_environment, callbacks);

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));
        listener.listen_for(&app_token).await.context("failed to start socket mode listener")?;
        tracing::info!("chat bridge socket mode connected");

        tokio::spawn(async move {
            let exit_code = listener.serve().await;
            tracing::info!(exit_code, "chat bridge socket mode listener stopped");
        });

        let processor = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                processor.clone().process(event).await;
            }
        });

        Ok(())
    }

    /// Task semantics (spec §4.4): load or create the context record keyed by
    /// the thread root, write the drop-zone file, and acknowledge self-DM and
    /// direct-message tasks (scenario A). A closed record is still updated,
    /// never rejected.
    async fn process(self: Arc<Self>, event: InboundEvent) {
        let root_ts = event.thread_ts.clone().unwrap_or_else(|| event.ts.clone());
        let context_id = thread_context_id(&root_ts);

        let (labels, dir, filename, body) = match event.event_kind {
            EventKind::SelfDmTask => (
                vec!["chat".to_string(), "dm".to_string(), "dm-self".to_string()],
                self.config.incoming_dir(),
                format!("task-{}.md", event.ts),
                event.text.clone(),
            ),
            EventKind::BotDmDirect => (
                vec!["chat".to_string(), "dm".to_string()],
                self.config.incoming_dir(),
                format!("task-{}.md", event.ts),
                event.text.clone(),
            ),
            EventKind::BotDmReply => (
                vec!["chat".to_string(), "dm".to_string(), "dm-reply".to_string()],
                self.config.responses_dir(),
                format!("RESPONSE-{root_ts}.md"),
                event.text.clone(),
            ),
        };

        let title = first_line(&event.text, 80);
        let record = match self
            .deps
            .tasks
            .get_or_create(UpsertContextInput { context_id: context_id.clone(), title, labels })
            .await
        {
            Ok(record) => record,
            Err(error) => {
                tracing::warn!(%error, context_id = %context_id, "failed to load or create context record");
                return;
            }
        };

        if matches!(event.event_kind, EventKind::BotDmReply) {
            if let Err(error) = self
                .deps
                .tasks
                .set_status(&context_id, crate::tasks::store::ContextStatus::InProgress)
                .await
            {
                tracing::warn!(%error, context_id = %context_id, "failed to reopen context record on reply");
            }
        }

        if let Err(error) = std::fs::create_dir_all(&dir) {
            tracing::warn!(%error, dir = %dir.display(), "failed to create chat bridge drop-zone directory");
            return;
        }
        if let Err(error) = std::fs::write(dir.join(&filename), &body) {
            tracing::warn!(%error, filename, "failed to write chat bridge drop-zone file");
            return;
        }
        if let Err(error) = self.deps.tasks.append_note(&context_id, &format!("{filename}: {}", first_line(&body, 200))).await {
            tracing::warn!(%error, context_id = %context_id, "failed to append note for inbound chat event");
        }

        let _ = record;

        if matches!(event.event_kind, EventKind::SelfDmTask | EventKind::BotDmDirect) {
            let ack = format!("\u{2705} Task received and queued for Claude\n\u{1f4c1} Saved to: {filename}");
            if let Err(error) = self
                .chat
                .post(&host_caller(), PostMessageRequest { channel: event.channel.clone(), text: ack, thread_ts: None })
                .await
            {
                tracing::warn!(%error, channel = %event.channel, "failed to send acknowledgement");
            }
        }
    }
}

fn first_line(text: &str, max_chars: usize) -> String {
    let first = text.lines().next().unwrap_or(text).trim();
    match first.char_indices().nth(max_chars) {
        Some((byte_index, _)) => format!("{}…", &first[..byte_index]),
        None => first.to_string(),
    }
}

/// Core classification (spec §4.4): only three event shapes are trusted, and
/// an optional user-id whitelist can further restrict senders.
async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let SlackEventCallbackBody::Message(msg_event) = event.event else {
        return Ok(());
    };
    if msg_event.subtype.is_some() {
        return Ok(()); // edits/deletes/bot_message subtypes are not task input
    }

    let state_guard = states.read().await;
    let state = state_guard
        .get_user_state::<Arc<InboundState>>()
        .expect("InboundState must be in user_state");

    let Some(user_id) = msg_event.sender.user.as_ref().map(|u| u.0.clone()) else {
        return Ok(()); // system message, no sender
    };
    if user_id == state.bot_user_id {
        return Ok(()); // ignore our own posts
    }
    if let Some(allowed) = &state.allowed_users {
        if !allowed.contains(&user_id) {
            return Ok(());
        }
    }

    let channel = msg_event.origin.channel.as_ref().map(|c| c.0.clone()).unwrap_or_default();
    if !channel.starts_with('D') {
        return Ok(()); // the bridge only trusts direct messages (spec §4.4)
    }

    let ts = msg_event.origin.ts.0.clone();
    let thread_ts = msg_event.origin.thread_ts.as_ref().map(|t| t.0.clone());
    let text = extract_text(&msg_event.content);

    let (event_kind, thread_ts, text) = if let Some(root_ts) = &thread_ts {
        // A reply only matches a trusted shape if its root is a thread this
        // bridge itself opened (spec §4.4); anything else is ignored.
        match state.thread_index.find_by_root_ts(&channel, root_ts) {
            Some(_) => (EventKind::BotDmReply, Some(root_ts.clone()), text),
            None => return Ok(()),
        }
    } else if starts_with_prefix(&text, &state.self_dm_prefix) {
        (EventKind::SelfDmTask, None, strip_prefix_ci(&text, &state.self_dm_prefix))
    } else {
        (EventKind::BotDmDirect, None, text)
    };

    let inbound = InboundEvent { event_kind, user: user_id, channel, thread_ts, text, ts };
    let _ = state.tx.send(inbound).await;
    Ok(())
}

fn extract_text(content: &SlackMessageContent) -> String {
    content.text.clone().unwrap_or_default()
}

fn starts_with_prefix(text: &str, prefix: &str) -> bool {
    text.trim().to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase())
}

fn strip_prefix_ci(text: &str, prefix: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() >= prefix.len() && trimmed[..prefix.len()].eq_ignore_ascii_case(prefix) {
        trimmed[prefix.len()..].trim().to_string()
    } else {
        trimmed.to_string()
    }
}

fn slack_error_handler(
    error: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(%error, "chat bridge socket mode error");
    HttpStatusCode::OK
}
