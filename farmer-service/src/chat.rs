// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    api::GameApi,
    cancel::CancelToken,
    channel::{
        ChannelHandler, ChannelKind, ChannelSender, DriveOutcome, EventPayload, HandlerOutcome,
        socket_url,
    },
    config::ConfigStore,
    notify::{Notification, NotificationKind, NotificationSink},
    state::KingdomState,
};

pub struct ChatChannel {
    api: Arc<dyn GameApi>,
    kingdom: Arc<RwLock<KingdomState>>,
    config: ConfigStore,
    notifier: Arc<dyn NotificationSink>,
}

impl ChatChannel {
    pub fn new(
        api: Arc<dyn GameApi>,
        kingdom: Arc<RwLock<KingdomState>>,
        config: ConfigStore,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            api,
            kingdom,
            config,
            notifier,
        }
    }
}

#[async_trait]
impl ChannelHandler for ChatChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Chat
    }

    async fn connect_url(&self) -> anyhow::Result<String> {
        let base = self
            .kingdom
            .read()
            .await
            .networks
            .chat
            .clone()
            .ok_or_else(|| anyhow::anyhow!("chat channel url unknown; world not entered"))?;
        let token = self
            .api
            .current_token()
            .await
            .ok_or_else(|| anyhow::anyhow!("no session token"))?;
        Ok(socket_url(&base, &token))
    }

    async fn drive(
        &self,
        sender: ChannelSender,
        _cancel: CancelToken,
    ) -> anyhow::Result<DriveOutcome> {
        let token = self.api.current_token().await.unwrap_or_default();
        sender.emit("/chat/enter", &json!({"token": token}))?;
        Ok(DriveOutcome::Hold)
    }

    async fn on_event(
        &self,
        name: &str,
        payload: EventPayload,
        _sender: &ChannelSender,
    ) -> HandlerOutcome {
        if name != "/chat/message" {
            debug!(event = name, "ignoring chat event");
            return HandlerOutcome::Continue;
        }
        if !self.config.current().chat.monitor {
            return HandlerOutcome::Continue;
        }
        let text = payload
            .data
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let channel = payload
            .data
            .get("chatChannel")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let from = payload
            .data
            .get("from")
            .and_then(|from| from.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        self.notifier
            .emit(
                Notification::new(NotificationKind::Chat, channel)
                    .with_message(format!("{from}: {text}")),
            )
            .await;
        HandlerOutcome::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::testing::ScriptedApi, config::FarmerConfig, notify::testing::RecordingSink};
    use tokio::sync::mpsc;

    fn handler(monitor: bool) -> (ChatChannel, Arc<RecordingSink>) {
        let mut config = FarmerConfig::default();
        config.chat.monitor = monitor;
        let sink = Arc::new(RecordingSink::default());
        let channel = ChatChannel::new(
            Arc::new(ScriptedApi::new()),
            Arc::new(RwLock::new(KingdomState::default())),
            ConfigStore::new(config),
            sink.clone(),
        );
        (channel, sink)
    }

    #[tokio::test]
    async fn chat_messages_reach_sink_only_when_monitored() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let sender = ChannelSender::new(tx);
        let message = json!({"chatChannel": "w20", "text": "hi", "from": {"name": "Ana"}});

        let (quiet, quiet_sink) = handler(false);
        quiet
            .on_event("/chat/message", EventPayload::json(message.clone()), &sender)
            .await;
        assert!(quiet_sink.kinds().is_empty());

        let (loud, loud_sink) = handler(true);
        loud.on_event("/chat/message", EventPayload::json(message), &sender)
            .await;
        let events = loud_sink.events.lock().unwrap();
        assert_eq!(events[0].message.as_deref(), Some("Ana: hi"));
        assert_eq!(events[0].status, "w20");
    }

    #[tokio::test]
    async fn connect_url_requires_world_entry() {
        let (channel, _) = handler(false);
        assert!(channel.connect_url().await.is_err());
    }
}
