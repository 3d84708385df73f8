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
use lok_common::{ActiveBuff, Building, Location, TASK_STATUS_ACTIVE};
use serde_json::{Value, json};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, error, info};

use crate::{
    api::GameApi,
    buffs::BuffBook,
    cancel::CancelToken,
    channel::{
        ChannelHandler, ChannelKind, ChannelSender, DriveOutcome, EventPayload, HandlerOutcome,
        socket_url,
    },
    notify::{Notification, NotificationKind, NotificationSink},
    session::SessionObserver,
    state::{HaltFlags, KingdomState},
};

/// Applies kingdom-channel pushes to shared state.
pub struct KingdomChannel {
    api: Arc<dyn GameApi>,
    kingdom: Arc<RwLock<KingdomState>>,
    buffs: Arc<BuffBook>,
    notifier: Arc<dyn NotificationSink>,
    rally_wake: Arc<Notify>,
    march_wake: Arc<Notify>,
}

impl KingdomChannel {
    pub fn new(
        api: Arc<dyn GameApi>,
        kingdom: Arc<RwLock<KingdomState>>,
        buffs: Arc<BuffBook>,
        notifier: Arc<dyn NotificationSink>,
        rally_wake: Arc<Notify>,
        march_wake: Arc<Notify>,
    ) -> Self {
        Self {
            api,
            kingdom,
            buffs,
            notifier,
            rally_wake,
            march_wake,
        }
    }

    async fn apply_building_update(&self, data: &Value) {
        let entries: Vec<&Value> = match data {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => match data.get("buildings").and_then(Value::as_array) {
                Some(items) => items.iter().collect(),
                None => vec![data],
            },
            _ => Vec::new(),
        };
        let mut kingdom = self.kingdom.write().await;
        for entry in entries {
            match serde_json::from_value::<Building>(entry.clone()) {
                Ok(building) => kingdom.upsert_building(building),
                Err(error) => debug!(error = %error, "ignoring malformed building update"),
            }
        }
    }

    async fn apply_resource_update(&self, data: &Value) {
        let index = data.get("resourceIdx").and_then(Value::as_u64);
        let value = data.get("value").and_then(Value::as_i64);
        if let (Some(index), Some(value)) = (index, value) {
            if !self.kingdom.write().await.set_resource(index as usize, value) {
                debug!(index, "resource update outside the four tracked resources");
            }
        }
    }

    async fn apply_buff_list(&self, data: &Value) {
        let items = data
            .as_array()
            .or_else(|| data.get("buffs").and_then(Value::as_array));
        let Some(items) = items else {
            return;
        };
        let buffs: Vec<ActiveBuff> = items.iter().filter_map(ActiveBuff::from_value).collect();
        debug!(count = buffs.len(), "active buff snapshot updated");
        self.buffs.set_snapshot(buffs).await;
    }

    async fn announce_rally(&self, data: &Value) {
        let code = data.get("code").and_then(Value::as_u64).unwrap_or_default() as u32;
        let level = data.get("level").and_then(Value::as_u64).unwrap_or_default() as u32;
        let rally_id = data.get("_id").and_then(Value::as_str).unwrap_or_default();
        info!(code, level, rally_id, "new rally available");

        let mut notification = Notification::new(NotificationKind::RallyAvailable, "available")
            .with_message(format!("rally {rally_id}"));
        notification.code = Some(code);
        notification.level = Some(level);
        notification.location = data.get("loc").and_then(Location::from_value);
        self.notifier.emit(notification).await;
        self.rally_wake.notify_one();
    }

    fn apply_task_update(&self, data: &Value) {
        let code = data.get("code").and_then(Value::as_i64).unwrap_or_default();
        let status = data.get("status").and_then(Value::as_i64).unwrap_or_default();
        if lok_common::MarchKind::from_task_code(code).is_some() && status != TASK_STATUS_ACTIVE {
            debug!(code, status, "march task finished; refreshing troop queue");
            self.march_wake.notify_one();
        }
    }
}

#[async_trait]
impl ChannelHandler for KingdomChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Kingdom
    }

    async fn connect_url(&self) -> anyhow::Result<String> {
        let base = self
            .kingdom
            .read()
            .await
            .networks
            .kingdom
            .clone()
            .ok_or_else(|| anyhow::anyhow!("kingdom channel url unknown; world not entered"))?;
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
        sender.emit("/kingdom/enter", &json!({"token": token}))?;
        Ok(DriveOutcome::Hold)
    }

    async fn on_event(
        &self,
        name: &str,
        payload: EventPayload,
        _sender: &ChannelSender,
    ) -> HandlerOutcome {
        match name {
            "/building/update" => self.apply_building_update(&payload.data).await,
            "/resource/upgrade" => self.apply_resource_update(&payload.data).await,
            "/buff/list" => self.apply_buff_list(&payload.data).await,
            "/alliance/rally/new" => self.announce_rally(&payload.data).await,
            "/task/update" => self.apply_task_update(&payload.data),
            other => debug!(event = other, "ignoring kingdom event"),
        }
        HandlerOutcome::Continue
    }
}

/// Mirrors backend call side effects into kingdom state and the halt flags.
pub struct StateObserver {
    kingdom: Arc<RwLock<KingdomState>>,
    halt: Arc<HaltFlags>,
    notifier: Arc<dyn NotificationSink>,
}

impl StateObserver {
    pub fn new(
        kingdom: Arc<RwLock<KingdomState>>,
        halt: Arc<HaltFlags>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            kingdom,
            halt,
            notifier,
        }
    }
}

#[async_trait]
impl SessionObserver for StateObserver {
    async fn on_resources(&self, resources: [i64; 4]) {
        self.kingdom.write().await.resources = resources;
    }

    async fn on_quota_exceeded(&self) {
        if self.halt.raise_quota() {
            error!("daily gather quota exceeded; scanning halted until restart");
            self.notifier
                .emit(Notification::new(NotificationKind::QuotaExceeded, "halted"))
                .await;
        }
    }
}
