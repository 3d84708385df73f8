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

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use anyhow::Context;
use chrono::Utc;
use lok_common::{ActiveBuff, Building, Location};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Networks {
    pub kingdom: Option<String>,
    pub chat: Option<String>,
    pub field: Option<String>,
}

/// The player's kingdom as last reported by the backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KingdomState {
    pub kingdom_id: String,
    pub field_object_id: String,
    pub world_id: i64,
    pub loc: Option<Location>,
    pub level: u32,
    pub alliance_id: Option<String>,
    pub vip_level: u32,
    pub resources: [i64; 4],
    pub buildings: Vec<Building>,
    pub networks: Networks,
    pub drago_ids: Vec<String>,
    /// Buffs listed on world entry; the kingdom channel's snapshot supersedes it.
    pub entry_buffs: Vec<ActiveBuff>,
}

impl KingdomState {
    pub fn from_enter(value: &Value) -> anyhow::Result<Self> {
        let kingdom = value
            .get("kingdom")
            .context("kingdom/enter response has no kingdom")?;
        let str_field = |key: &str| {
            kingdom
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let mut resources = [0i64; 4];
        if let Some(items) = kingdom.get("resources").and_then(Value::as_array) {
            for (slot, item) in resources.iter_mut().zip(items.iter().take(4)) {
                *slot = item.as_i64().unwrap_or_default();
            }
        }

        let mut state = Self {
            kingdom_id: str_field("_id").unwrap_or_default(),
            field_object_id: str_field("fieldObjectId")
                .context("kingdom/enter response has no fieldObjectId")?,
            world_id: kingdom
                .get("worldId")
                .and_then(Value::as_i64)
                .unwrap_or_default(),
            loc: kingdom.get("loc").and_then(Location::from_value),
            level: kingdom
                .get("level")
                .and_then(Value::as_u64)
                .unwrap_or_default() as u32,
            alliance_id: str_field("allianceId").filter(|id| !id.is_empty()),
            vip_level: kingdom
                .get("vip")
                .and_then(|vip| vip.get("level"))
                .and_then(Value::as_u64)
                .unwrap_or_default() as u32,
            resources,
            buildings: Vec::new(),
            networks: Networks {
                kingdom: first_url(value, "kingdoms"),
                chat: first_url(value, "chats"),
                field: first_url(value, "fields"),
            },
            drago_ids: value
                .get("dragos")
                .and_then(Value::as_array)
                .map(|dragos| {
                    dragos
                        .iter()
                        .filter_map(|drago| drago.get("_id").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            entry_buffs: kingdom
                .get("buffs")
                .and_then(Value::as_array)
                .map(|buffs| buffs.iter().filter_map(ActiveBuff::from_value).collect())
                .unwrap_or_default(),
        };
        if let Some(buildings) = kingdom.get("buildings").and_then(Value::as_array) {
            for building in buildings {
                if let Ok(building) = serde_json::from_value::<Building>(building.clone()) {
                    state.upsert_building(building);
                }
            }
        }
        Ok(state)
    }

    /// Replaces whatever building sits at the same position.
    pub fn upsert_building(&mut self, building: Building) {
        self.buildings
            .retain(|existing| existing.position != building.position);
        self.buildings.push(building);
    }

    pub fn set_resource(&mut self, index: usize, value: i64) -> bool {
        match self.resources.get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

fn first_url(value: &Value, key: &str) -> Option<String> {
    value
        .get("networks")
        .and_then(|networks| networks.get(key))
        .and_then(Value::as_array)
        .and_then(|urls| urls.first())
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Process-wide stop flags checked by scanning and gathering.
#[derive(Debug, Default)]
pub struct HaltFlags {
    quota_exceeded: AtomicBool,
}

impl HaltFlags {
    pub fn quota_exceeded(&self) -> bool {
        self.quota_exceeded.load(Ordering::SeqCst)
    }

    /// Returns true the first time the flag is raised.
    pub fn raise_quota(&self) -> bool {
        !self.quota_exceeded.swap(true, Ordering::SeqCst)
    }
}

/// Last time the scanner demonstrably moved forward, in unix millis.
#[derive(Debug)]
pub struct ScanProgress {
    last_progress_ms: AtomicI64,
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self {
            last_progress_ms: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }
}

impl ScanProgress {
    pub fn touch(&self) {
        self.last_progress_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn last_progress_ms(&self) -> i64 {
        self.last_progress_ms.load(Ordering::SeqCst)
    }

    pub fn idle_for_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.last_progress_ms()
    }
}
