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

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lok_common::Location;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ObjectFound,
    Gather,
    Attack,
    RallyJoin,
    RallyStart,
    RallyAvailable,
    QuotaExceeded,
    Recovery,
    Chat,
}

/// Structured event handed to whatever delivers operator notifications.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub code: Option<u32>,
    pub level: Option<u32>,
    pub location: Option<Location>,
    pub status: String,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, status: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            code: None,
            level: None,
            location: None,
            status: status.into(),
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_target(mut self, code: u32, level: u32, location: Location) -> Self {
        self.code = Some(code);
        self.level = Some(level);
        self.location = Some(location);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, notification: Notification);
}

pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn emit(&self, notification: Notification) {
        info!(
            kind = ?notification.kind,
            code = ?notification.code,
            level = ?notification.level,
            location = ?notification.location.map(|loc| loc.to_string()),
            status = %notification.status,
            message = ?notification.message,
            "notification"
        );
    }
}

/// Posts each notification as JSON; delivery failures are logged and dropped.
#[derive(Clone)]
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }

    async fn post_json(&self, payload: &Notification) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .json(payload)
            .send()
            .await
            .context("failed to call notification webhook")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("notification webhook returned {status}: {body}");
        }

        Ok(())
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn emit(&self, notification: Notification) {
        if let Err(error) = self.post_json(&notification).await {
            warn!(url = %self.url, error = %error, kind = ?notification.kind, "notification delivery failed");
        }
    }
}

pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl NotificationSink for FanoutSink {
    async fn emit(&self, notification: Notification) {
        for sink in &self.sinks {
            sink.emit(notification.clone()).await;
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub events: Mutex<Vec<Notification>>,
    }

    impl RecordingSink {
        pub fn kinds(&self) -> Vec<NotificationKind> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|event| event.kind)
                .collect()
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn emit(&self, notification: Notification) {
            self.events.lock().unwrap().push(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[tokio::test]
    async fn fanout_delivers_to_every_sink() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let fanout = FanoutSink::new(vec![first.clone(), second.clone(), Arc::new(TracingSink)]);

        fanout
            .emit(
                Notification::new(NotificationKind::Gather, "started")
                    .with_target(20100101, 3, Location::new(20, 5, 6)),
            )
            .await;

        assert_eq!(first.kinds(), vec![NotificationKind::Gather]);
        assert_eq!(second.kinds(), vec![NotificationKind::Gather]);
    }

    #[test]
    fn notification_serializes_with_snake_case_kind() {
        let event = Notification::new(NotificationKind::RallyAvailable, "available")
            .with_message("rally 42");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "rally_available");
        assert_eq!(json["message"], "rally 42");
    }
}
