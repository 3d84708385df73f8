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

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use lok_common::{FieldObject, WireCodec, ZoneId, codec::decode_flexible};
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::{
    api::GameApi,
    cancel::CancelToken,
    channel::{
        ChannelHandler, ChannelKind, ChannelSender, DriveOutcome, EventPayload, HandlerOutcome,
        socket_url,
    },
    config::ConfigStore,
    march::MarchCoordinator,
    recovery::RecoveryManager,
    scanner::{ZoneLink, ZoneScanner},
    state::{HaltFlags, KingdomState},
};

const KNOCK_ZONES: &str = "[0,64,1,65]";
const KNOCK_SETTLE: Duration = Duration::from_secs(1);
const IDLE_RECHECK: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub enum FieldSignal {
    Entered { world: i64 },
    Objects(Vec<FieldObject>),
}

/// Decodes a `/field/objects/v4` batch, keeping only available objects.
pub fn decode_field_objects(codec: &WireCodec, payload: &EventPayload) -> anyhow::Result<Vec<FieldObject>> {
    let decoded = decode_packs(codec, payload)?;
    let objects = decoded
        .get("objects")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| serde_json::from_value::<FieldObject>(entry.clone()).ok())
                .filter(FieldObject::is_available)
                .collect()
        })
        .unwrap_or_default();
    Ok(objects)
}

fn decode_packs(codec: &WireCodec, payload: &EventPayload) -> anyhow::Result<Value> {
    match payload.bytes_of("packs") {
        Some(bytes) => Ok(codec.decode_packed(&bytes)?),
        None if payload.data.get("objects").is_some() => Ok(payload.data.clone()),
        None => anyhow::bail!("payload carries no packs"),
    }
}

fn zones_text(zones: &[ZoneId]) -> String {
    let ids: Vec<String> = zones.iter().map(ZoneId::to_string).collect();
    format!("[{}]", ids.join(","))
}

/// Field channel: every connection runs one scan pass and then disconnects.
pub struct FieldChannel {
    api: Arc<dyn GameApi>,
    kingdom: Arc<RwLock<KingdomState>>,
    march: Arc<MarchCoordinator>,
    scanner: Arc<ZoneScanner>,
    recovery: Arc<RecoveryManager>,
    halt: Arc<HaltFlags>,
    config: ConfigStore,
    signals: mpsc::UnboundedSender<FieldSignal>,
    inbox: Mutex<mpsc::UnboundedReceiver<FieldSignal>>,
}

impl FieldChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn GameApi>,
        kingdom: Arc<RwLock<KingdomState>>,
        march: Arc<MarchCoordinator>,
        scanner: Arc<ZoneScanner>,
        recovery: Arc<RecoveryManager>,
        halt: Arc<HaltFlags>,
        config: ConfigStore,
    ) -> Self {
        let (signals, inbox) = mpsc::unbounded_channel();
        Self {
            api,
            kingdom,
            march,
            scanner,
            recovery,
            halt,
            config,
            signals,
            inbox: Mutex::new(inbox),
        }
    }

    fn forward(&self, signal: FieldSignal) {
        if self.signals.send(signal).is_err() {
            debug!("field inbox closed; dropping signal");
        }
    }
}

struct FieldLink<'a> {
    sender: ChannelSender,
    codec: WireCodec,
    world: i64,
    inbox: &'a mut mpsc::UnboundedReceiver<FieldSignal>,
}

impl FieldLink<'_> {
    fn drain(&mut self) {
        while self.inbox.try_recv().is_ok() {}
    }

    fn zone_message(&self, zones: &str) -> Value {
        json!({"world": self.world, "zones": zones})
    }
}

#[async_trait]
impl ZoneLink for FieldLink<'_> {
    async fn enter(&mut self, zones: &[ZoneId]) -> anyhow::Result<()> {
        self.drain();
        let message = self.zone_message(&zones_text(zones));
        let encoded = self.codec.encode_json(&message)?;
        self.sender.emit("/zone/enter/list/v4", &Value::String(encoded))
    }

    async fn next_objects(&mut self, timeout: Duration) -> anyhow::Result<Vec<FieldObject>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(FieldSignal::Objects(objects))) => return Ok(objects),
                Ok(Some(FieldSignal::Entered { .. })) => continue,
                Ok(None) => anyhow::bail!("field inbox closed"),
                Err(_) => anyhow::bail!("no field objects within {}s", timeout.as_secs()),
            }
        }
    }

    async fn leave(&mut self, zones: &[ZoneId]) -> anyhow::Result<()> {
        let message = self.zone_message(&zones_text(zones));
        self.sender.emit("/zone/leave/list/v2", &message)
    }
}

#[async_trait]
impl ChannelHandler for FieldChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Field
    }

    async fn connect_url(&self) -> anyhow::Result<String> {
        let base = self
            .kingdom
            .read()
            .await
            .networks
            .field
            .clone()
            .ok_or_else(|| anyhow::anyhow!("field channel url unknown; world not entered"))?;
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
        cancel: CancelToken,
    ) -> anyhow::Result<DriveOutcome> {
        let config = self.config.current();
        if self.recovery.take_zone_reset() {
            self.scanner.reset().await;
        }
        if !config.scan.enabled || self.halt.quota_exceeded() {
            return Ok(DriveOutcome::PassComplete {
                resume_after: IDLE_RECHECK,
            });
        }

        let mut inbox = self.inbox.lock().await;
        while inbox.try_recv().is_ok() {}

        let codec = self.api.codec().await;
        let token = self.api.current_token().await.unwrap_or_default();
        sender.emit(
            "/field/enter/v3",
            &Value::String(codec.encode_json(&json!({"token": token}))?),
        )?;
        let world = loop {
            match tokio::time::timeout(config.scan.batch_timeout(), inbox.recv()).await {
                Ok(Some(FieldSignal::Entered { world })) => break world,
                Ok(Some(FieldSignal::Objects(_))) => continue,
                Ok(None) => anyhow::bail!("field inbox closed"),
                Err(_) => anyhow::bail!("field enter was not acknowledged"),
            }
        };
        info!(world, "field entered");

        let mut link = FieldLink {
            sender,
            codec,
            world,
            inbox: &mut inbox,
        };
        link.sender
            .emit("/zone/leave/list/v2", &link.zone_message("[]"))?;
        let knock = link.codec.encode_json(&link.zone_message(KNOCK_ZONES))?;
        link.sender
            .emit("/zone/enter/list/v4", &Value::String(knock))?;
        link.sender
            .emit("/zone/leave/list/v2", &link.zone_message(KNOCK_ZONES))?;
        if !cancel.sleep(KNOCK_SETTLE).await {
            return Ok(DriveOutcome::Hold);
        }

        self.scanner.run_pass(&mut link, &config, &cancel).await?;
        Ok(DriveOutcome::PassComplete {
            resume_after: config.scan.pass_cooldown(),
        })
    }

    async fn on_event(
        &self,
        name: &str,
        payload: EventPayload,
        _sender: &ChannelSender,
    ) -> HandlerOutcome {
        match name {
            "/field/enter/v3" => {
                let codec = self.api.codec().await;
                match decode_flexible(&codec, &payload.data) {
                    Ok(decoded) => {
                        let world = decoded
                            .get("loc")
                            .and_then(|loc| loc.get(0))
                            .and_then(Value::as_i64)
                            .unwrap_or(self.kingdom.read().await.world_id);
                        self.forward(FieldSignal::Entered { world });
                    }
                    Err(error) => warn!(error = %error, "undecodable field enter ack"),
                }
            }
            "/field/objects/v4" => {
                let codec = self.api.codec().await;
                match decode_field_objects(&codec, &payload) {
                    Ok(objects) => self.forward(FieldSignal::Objects(objects)),
                    Err(error) => warn!(error = %format!("{error:#}"), "dropping field objects"),
                }
            }
            "/march/objects" => {
                let codec = self.api.codec().await;
                match decode_packs(&codec, &payload) {
                    Ok(decoded) => {
                        let zones = self.scanner.current_zones();
                        self.march.ingest_march_objects(&zones, &decoded).await;
                    }
                    Err(error) => debug!(error = %format!("{error:#}"), "dropping march objects"),
                }
            }
            other => debug!(event = other, "ignoring field event"),
        }
        HandlerOutcome::Continue
    }
}
