//! Chat proxy (spec §4.1 "Chat proxy", §6 `/chat/*`): send message (new or
//! reply), add reaction, fetch thread, list channels, get user profile.
//! Applies the gateway's per-channel pacing and retry before every call
//! reaches Slack, grounded on this codebase's `messaging::slack` adapter but
//! reduced to the gateway's fixed operation set.

use crate::error::{GatewayError, Result};
use crate::gateway::ratelimit::ChatPacer;
use crate::gateway::reqlog::RequestLog;
use crate::ContainerId;
use serde::{Deserialize, Serialize};
use slack_morphism::prelude::*;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct PostMessageRequest {
    pub channel: String,
    pub text: String,
    /// `None` starts a new thread; `Some(ts)` replies under it (spec §3
    /// "Outbound chat message": "thread_key null means start new thread").
    pub thread_ts: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PostMessageResponse {
    pub ts: String,
    pub channel: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactRequest {
    pub channel: String,
    pub ts: String,
    pub emoji: String,
}

#[derive(Debug, Serialize)]
pub struct ThreadMessage {
    pub ts: String,
    pub user: Option<String>,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct ChannelInfo {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct UserProfile {
    pub id: String,
    pub display_name: Option<String>,
    pub real_name: Option<String>,
}

/// Thin wrapper bundling the Slack client, the pacer, and the request log so
/// every gateway chat handler shares one pacing/logging path.
pub struct ChatProxy {
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
    pacer: Arc<ChatPacer>,
    reqlog: RequestLog,
}

impl ChatProxy {
    pub fn new(bot_token: String, pacer: Arc<ChatPacer>, reqlog: RequestLog) -> anyhow::Result<Self> {
        let client = Arc::new(SlackClient::new(SlackClientHyperConnector::new()?));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token));
        Ok(Self { client, token, pacer, reqlog })
    }

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    /// Post a new message or a thread reply. Ordering within one `thread_ts`
    /// is preserved by the pacer's per-channel FIFO lock (spec §4.4
    /// "Threading invariants").
    pub async fn post(&self, caller: &ContainerId, req: PostMessageRequest) -> Result<PostMessageResponse> {
        self.pacer.acquire(&req.channel).await;

        let mut content = SlackMessageContent::new().with_text(req.text.clone());
        let mut post_req = SlackApiChatPostMessageRequest::new(SlackChannelId(req.channel.clone()), content.take());
        post_req = post_req.opt_thread_ts(req.thread_ts.clone().map(SlackTs));

        let result = self.session().chat_post_message(&post_req).await;
        self.reqlog
            .record(caller, "chat.post", &format!("channel={}", req.channel), result_code(&result))
            .await;

        let response = result.map_err(|error| GatewayError::Upstream5xx {
            status: 502,
            body: error.to_string(),
        })?;

        Ok(PostMessageResponse {
            ts: response.ts.0,
            channel: req.channel,
        })
    }

    pub async fn react(&self, caller: &ContainerId, req: ReactRequest) -> Result<()> {
        self.pacer.acquire(&req.channel).await;

        let add_req = SlackApiReactionsAddRequest::new(
            SlackChannelId(req.channel.clone()),
            SlackReactionName(sanitize_reaction_name(&req.emoji)),
            SlackTs(req.ts.clone()),
        );
        let result = self.session().reactions_add(&add_req).await;
        self.reqlog
            .record(caller, "chat.react", &format!("channel={}", req.channel), result_code(&result))
            .await;
        result.map_err(|error| GatewayError::Upstream5xx {
            status: 502,
            body: error.to_string(),
        })?;
        Ok(())
    }

    pub async fn fetch_thread(&self, caller: &ContainerId, channel: &str, thread_ts: &str) -> Result<Vec<ThreadMessage>> {
        let req = SlackApiConversationsRepliesRequest::new(
            SlackChannelId(channel.to_string()),
            SlackTs(thread_ts.to_string()),
        );
        let result = self.session().conversations_replies(&req).await;
        self.reqlog
            .record(caller, "chat.thread", &format!("channel={channel}"), result_code(&result))
            .await;
        let response = result.map_err(|error| GatewayError::Upstream5xx {
            status: 502,
            body: error.to_string(),
        })?;

        Ok(response
            .messages
            .into_iter()
            .map(|m| ThreadMessage {
                ts: m.origin.ts.0,
                user: m.sender.user.map(|u| u.0),
                text: m.content.text.unwrap_or_default(),
            })
            .collect())
    }

    pub async fn list_channels(&self, caller: &ContainerId) -> Result<Vec<ChannelInfo>> {
        let req = SlackApiConversationsListRequest::new();
        let result = self.session().conversations_list(&req).await;
        self.reqlog.record(caller, "chat.channels", "", result_code(&result)).await;
        let response = result.map_err(|error| GatewayError::Upstream5xx {
            status: 502,
            body: error.to_string(),
        })?;
        Ok(response
            .channels
            .into_iter()
            .map(|c| ChannelInfo { id: c.id.0, name: c.name })
            .collect())
    }

    pub async fn get_user_profile(&self, caller: &ContainerId, user_id: &str) -> Result<UserProfile> {
        let req = SlackApiUsersInfoRequest::new(SlackUserId(user_id.to_string()));
        let result = self.session().users_info(&req).await;
        self.reqlog
            .record(caller, "chat.user_profile", &format!("user={user_id}"), result_code(&result))
            .await;
        let response = result.map_err(|error| GatewayError::Upstream5xx {
            status: 502,
            body: error.to_string(),
        })?;
        let profile = response.user.profile;
        Ok(UserProfile {
            id: user_id.to_string(),
            display_name: profile.as_ref().and_then(|p| p.display_name.clone()),
            real_name: profile.and_then(|p| p.real_name),
        })
    }
}

fn result_code<T, E>(result: &std::result::Result<T, E>) -> &'static str {
    if result.is_ok() { "ok" } else { "error" }
}

fn sanitize_reaction_name(emoji: &str) -> String {
    emoji.trim_matches(':').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_reaction_name_strips_colons() {
        assert_eq!(sanitize_reaction_name(":thumbsup:"), "thumbsup");
        assert_eq!(sanitize_reaction_name("thumbsup"), "thumbsup");
    }
}
