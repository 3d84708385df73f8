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

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use lok_common::{ActiveBuff, parse_timestamp};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    api::GameApi,
    cancel::CancelToken,
    config::{BuffConfig, BuffItemConfig, ConfigStore},
    error::{ApiError, CODE_NOT_ENOUGH_MP, CODE_YET_IN_COOLTIME},
    recovery::RecoveryManager,
    state::KingdomState,
};

#[derive(Debug, Default)]
struct BuffRecords {
    snapshot: Option<Vec<ActiveBuff>>,
    last_activation: HashMap<u32, DateTime<Utc>>,
}

/// Active-buff snapshot from the kingdom channel plus our own activation times.
#[derive(Debug, Default)]
pub struct BuffBook {
    records: Mutex<BuffRecords>,
}

impl BuffBook {
    pub async fn set_snapshot(&self, buffs: Vec<ActiveBuff>) {
        self.records.lock().await.snapshot = Some(buffs);
    }

    pub async fn snapshot(&self) -> Option<Vec<ActiveBuff>> {
        self.records.lock().await.snapshot.clone()
    }

    pub async fn last_activation(&self, item_code: u32) -> Option<DateTime<Utc>> {
        self.records
            .lock()
            .await
            .last_activation
            .get(&item_code)
            .copied()
    }

    pub async fn record_activation(&self, item_code: u32, at: DateTime<Utc>) {
        self.records
            .lock()
            .await
            .last_activation
            .insert(item_code, at);
    }

    pub async fn reset(&self) {
        *self.records.lock().await = BuffRecords::default();
    }
}

/// Whether a configured buff should be used now.
pub fn buff_due(
    item: &BuffItemConfig,
    active: Option<&ActiveBuff>,
    last_activation: Option<DateTime<Utc>>,
    settings: &BuffConfig,
    now: DateTime<Utc>,
) -> bool {
    if let Some(last) = last_activation {
        if (now - last).num_seconds() < settings.cooldown_secs as i64 {
            return false;
        }
    }
    let Some(active) = active else {
        return true;
    };
    match active.remaining_minutes(now) {
        Some(remaining) if remaining > settings.max_remaining_minutes => false,
        Some(remaining) => remaining < item.min_duration_minutes,
        None => false,
    }
}

pub struct BuffScheduler {
    api: Arc<dyn GameApi>,
    kingdom: Arc<RwLock<KingdomState>>,
    book: Arc<BuffBook>,
    recovery: Arc<RecoveryManager>,
    config: ConfigStore,
}

impl BuffScheduler {
    pub fn new(
        api: Arc<dyn GameApi>,
        kingdom: Arc<RwLock<KingdomState>>,
        book: Arc<BuffBook>,
        recovery: Arc<RecoveryManager>,
        config: ConfigStore,
    ) -> Self {
        Self {
            api,
            kingdom,
            book,
            recovery,
            config,
        }
    }

    pub async fn run(&self, cancel: CancelToken) -> anyhow::Result<()> {
        loop {
            let config = self.config.current();
            if config.buffs.enabled {
                let result = self
                    .recovery
                    .with_recovery("buff_management", || self.activate_due(Utc::now()))
                    .await;
                match result {
                    Ok(used) if !used.is_empty() => info!(items = ?used, "buffs activated"),
                    Ok(_) => {}
                    Err(error) if error.is_fatal() => return Err(error.into()),
                    Err(error) => warn!(error = %error, "buff pass failed"),
                }
            }
            if !cancel
                .sleep(Duration::from_secs(config.buffs.interval_secs))
                .await
            {
                return Ok(());
            }
        }
    }

    /// Uses every configured buff that is missing or about to run out.
    pub async fn activate_due(&self, now: DateTime<Utc>) -> Result<Vec<u32>, ApiError> {
        let config = self.config.current();
        let active = match self.book.snapshot().await {
            Some(snapshot) => snapshot,
            None => self.kingdom.read().await.entry_buffs.clone(),
        };

        let mut used = Vec::new();
        for item in &config.buffs.items {
            let current = active.iter().find(|buff| buff.item_code == item.item_code);
            let last = self.book.last_activation(item.item_code).await;
            if !buff_due(item, current, last, &config.buffs, now) {
                continue;
            }
            match self.api.item_use(item.item_code, 1).await {
                Ok(_) => {
                    self.book.record_activation(item.item_code, now).await;
                    used.push(item.item_code);
                }
                Err(error) if error.is_session_invalid() || error.is_fatal() => return Err(error),
                Err(error) => {
                    warn!(item_code = item.item_code, error = %error, "buff activation failed")
                }
            }
        }
        Ok(used)
    }
}

pub struct SkillScheduler {
    api: Arc<dyn GameApi>,
    recovery: Arc<RecoveryManager>,
    config: ConfigStore,
}

impl SkillScheduler {
    pub fn new(api: Arc<dyn GameApi>, recovery: Arc<RecoveryManager>, config: ConfigStore) -> Self {
        Self {
            api,
            recovery,
            config,
        }
    }

    pub async fn run(&self, cancel: CancelToken) -> anyhow::Result<()> {
        loop {
            let config = self.config.current();
            if config.skills.enabled {
                let result = self
                    .recovery
                    .with_recovery("skill_management", || self.use_ready(Utc::now()))
                    .await;
                match result {
                    Ok(used) if !used.is_empty() => info!(skills = ?used, "skills used"),
                    Ok(_) => {}
                    Err(error) if error.is_fatal() => return Err(error.into()),
                    Err(error) => warn!(error = %error, "skill pass failed"),
                }
            }
            if !cancel
                .sleep(Duration::from_secs(config.skills.interval_secs))
                .await
            {
                return Ok(());
            }
        }
    }

    /// Uses each configured skill whose cooldown has passed.
    pub async fn use_ready(&self, now: DateTime<Utc>) -> Result<Vec<u32>, ApiError> {
        let config = self.config.current();
        if config.skills.codes.is_empty() {
            return Ok(Vec::new());
        }
        let skills = self.api.skill_list().await?;

        let mut used = Vec::new();
        for code in &config.skills.codes {
            let Some(skill) = skills
                .iter()
                .find(|skill| skill.get("code").and_then(Value::as_u64) == Some(u64::from(*code)))
            else {
                continue;
            };
            let next = skill.get("nextSkillTime").and_then(parse_timestamp);
            if next.is_some_and(|next| next > now) {
                continue;
            }
            match self.api.skill_use(*code).await {
                Ok(_) => used.push(*code),
                Err(error)
                    if matches!(
                        error.business_code(),
                        Some(CODE_YET_IN_COOLTIME | CODE_NOT_ENOUGH_MP)
                    ) =>
                {
                    debug!(skill = code, error = %error, "skill not ready")
                }
                Err(error) if error.is_session_invalid() || error.is_fatal() => return Err(error),
                Err(error) => warn!(skill = code, error = %error, "skill use failed"),
            }
        }
        Ok(used)
    }
}
