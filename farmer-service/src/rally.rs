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

use std::{collections::HashSet, sync::Arc, time::Duration};

use lok_common::{FieldObject, Location};
use serde_json::Value;
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::{
    actions::{ActionOutcome, SkipReason},
    api::GameApi,
    cancel::CancelToken,
    config::ConfigStore,
    error::ApiError,
    march::{CapacityContext, MarchCoordinator, MarchOrder},
    notify::{Notification, NotificationKind, NotificationSink},
    recovery::RecoveryManager,
    state::KingdomState,
};

pub const DEFAULT_RALLY_TIME_MINUTES: u32 = 10;
const RALLY_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// The parts of an `alliance/battle/list/v2` entry the coordinator acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleSummary {
    pub id: String,
    pub monster_code: Option<u32>,
    pub monster_level: u32,
    pub destination: Option<Location>,
    pub joined: bool,
}

impl BattleSummary {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value.get("_id").and_then(Value::as_str)?.to_string();
        let monster = value
            .get("targetMonster")
            .filter(|monster| monster.get("code").is_some())
            .or_else(|| value.get("target").and_then(|target| target.get("monster")));
        let monster_code = monster
            .and_then(|monster| monster.get("code"))
            .and_then(Value::as_u64)
            .and_then(|code| u32::try_from(code).ok());
        let monster_level = monster
            .and_then(|monster| monster.get("level"))
            .and_then(Value::as_u64)
            .and_then(|level| u32::try_from(level).ok())
            .unwrap_or(0);
        let destination = monster
            .and_then(|monster| monster.get("loc"))
            .and_then(Location::from_value)
            .or_else(|| value.get("toLoc").and_then(Location::from_value));
        Some(Self {
            id,
            monster_code,
            monster_level,
            destination,
            joined: value
                .get("isJoined")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Joins alliance rallies and starts our own; every launch goes through the
/// march coordinator.
pub struct RallyCoordinator {
    api: Arc<dyn GameApi>,
    kingdom: Arc<RwLock<KingdomState>>,
    march: Arc<MarchCoordinator>,
    recovery: Arc<RecoveryManager>,
    notifier: Arc<dyn NotificationSink>,
    config: ConfigStore,
    joined: Mutex<HashSet<String>>,
    wake: Arc<Notify>,
}

impl RallyCoordinator {
    pub fn new(
        api: Arc<dyn GameApi>,
        kingdom: Arc<RwLock<KingdomState>>,
        march: Arc<MarchCoordinator>,
        recovery: Arc<RecoveryManager>,
        notifier: Arc<dyn NotificationSink>,
        config: ConfigStore,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            api,
            kingdom,
            march,
            recovery,
            notifier,
            config,
            joined: Mutex::new(HashSet::new()),
            wake,
        }
    }

    /// Poll loop for joinable rallies. Push notifications only wake it early.
    pub async fn run(&self, cancel: CancelToken) -> anyhow::Result<()> {
        loop {
            let config = self.config.current();
            let mut pause = Duration::from_secs(config.rally.join.poll_interval_secs);
            if config.rally.join.enabled {
                match self
                    .recovery
                    .with_recovery("rally_monitor", || self.scan_for_joinable_rallies())
                    .await
                {
                    Ok(joined) if !joined.is_empty() => info!(count = joined.len(), "rallies joined"),
                    Ok(_) => {}
                    Err(error) if error.is_fatal() => return Err(error.into()),
                    Err(error) => {
                        warn!(error = %error, "rally poll failed");
                        pause = RALLY_ERROR_BACKOFF;
                    }
                }
            } else {
                pause = RALLY_ERROR_BACKOFF;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(pause) => {}
                _ = self.wake.notified() => debug!("rally poll woken by push"),
            }
        }
    }

    /// Joins every listed rally that matches a configured band, until the
    /// join limit or march capacity runs out.
    pub async fn scan_for_joinable_rallies(&self) -> Result<Vec<String>, ApiError> {
        let config = self.config.current();
        let battles = self.api.battle_list().await?;
        let joined_count = battles
            .iter()
            .filter(|battle| battle.get("isJoined").and_then(Value::as_bool) == Some(true))
            .count();
        if joined_count >= config.rally.join.num_march {
            debug!(joined_count, "rally join limit reached");
            return Ok(Vec::new());
        }

        let mut joined = Vec::new();
        for battle in &battles {
            let Some(rally_id) = battle.get("_id").and_then(Value::as_str) else {
                continue;
            };
            match self.join_rally(rally_id, battle).await? {
                ActionOutcome::Launched(_) => joined.push(rally_id.to_string()),
                ActionOutcome::Skipped(SkipReason::NoCapacity) => break,
                ActionOutcome::Skipped(reason) => {
                    debug!(rally_id, ?reason, "rally not joined")
                }
                ActionOutcome::Halted => break,
            }
        }
        Ok(joined)
    }

    pub async fn join_rally(&self, rally_id: &str, battle: &Value) -> Result<ActionOutcome, ApiError> {
        let config = self.config.current();
        let feature = &config.rally.join;
        if !feature.enabled {
            return Ok(ActionOutcome::Skipped(SkipReason::Disabled));
        }
        let Some(summary) = BattleSummary::from_value(battle) else {
            return Ok(ActionOutcome::Skipped(SkipReason::NotTargeted));
        };
        if summary.joined || self.joined.lock().await.contains(rally_id) {
            return Ok(ActionOutcome::Skipped(SkipReason::AlreadyJoined));
        }
        let Some(band) = summary
            .monster_code
            .and_then(|code| feature.band_for(code, summary.monster_level))
        else {
            return Ok(ActionOutcome::Skipped(SkipReason::NotTargeted));
        };
        if band.troops.iter().all(|troop| troop.amount == 0) {
            return Ok(ActionOutcome::Skipped(SkipReason::NoTroops));
        }
        if !self
            .march
            .validate_capacity(CapacityContext::RallyJoin, None, false)
            .await?
        {
            return Ok(ActionOutcome::Skipped(SkipReason::NoCapacity));
        }

        let order = MarchOrder::RallyJoin {
            rally_id: rally_id.to_string(),
            destination: summary.destination,
            troops: band.troops.clone(),
        };
        let result = self
            .recovery
            .with_recovery("rally_join", || {
                self.march
                    .start_march(order.clone(), CapacityContext::RallyJoin)
            })
            .await;
        match result {
            Ok(task) => {
                self.joined.lock().await.insert(rally_id.to_string());
                info!(rally_id, code = ?summary.monster_code, level = summary.monster_level, "rally joined");
                let mut notification = Notification::new(NotificationKind::RallyJoin, "joined")
                    .with_message(rally_id.to_string());
                if let (Some(code), Some(location)) = (summary.monster_code, summary.destination) {
                    notification = notification.with_target(code, summary.monster_level, location);
                }
                self.notifier.emit(notification).await;
                Ok(ActionOutcome::Launched(task))
            }
            Err(error) => skip_on_business(error),
        }
    }

    /// Opens a rally on a monster found by the scanner.
    pub async fn start_rally(&self, object: &FieldObject) -> Result<ActionOutcome, ApiError> {
        let config = self.config.current();
        let feature = &config.rally.start;
        if !feature.enabled {
            return Ok(ActionOutcome::Skipped(SkipReason::Disabled));
        }
        let Some(band) = feature.band_for(object.code, object.level) else {
            return Ok(ActionOutcome::Skipped(SkipReason::NotTargeted));
        };
        if band.troops.iter().all(|troop| troop.amount == 0) {
            return Ok(ActionOutcome::Skipped(SkipReason::NoTroops));
        }

        let battles = self.api.battle_list().await?;
        let already_rallied = battles
            .iter()
            .filter_map(BattleSummary::from_value)
            .any(|battle| battle.destination == Some(object.loc));
        if already_rallied {
            return Ok(ActionOutcome::Skipped(SkipReason::RallyExists));
        }
        let (from_id, home) = {
            let kingdom = self.kingdom.read().await;
            (kingdom.field_object_id.clone(), kingdom.loc)
        };
        if self
            .api
            .march_info(&from_id, object.loc)
            .await?
            .destination_taken()
        {
            return Ok(ActionOutcome::Skipped(SkipReason::RallyExists));
        }
        if !self
            .march
            .validate_capacity(CapacityContext::RallyStart, Some(object.loc), false)
            .await?
        {
            return Ok(ActionOutcome::Skipped(SkipReason::NoCapacity));
        }

        let distance = home
            .map(|home| object.loc.tile_distance(home.x, home.y).round() as i64)
            .unwrap_or_default();
        let order = MarchOrder::RallyStart {
            destination: object.loc,
            target_id: Some(object.id.clone()),
            troops: band.troops.clone(),
            rally_time: band.rally_time.unwrap_or(DEFAULT_RALLY_TIME_MINUTES),
            message: band
                .message
                .clone()
                .unwrap_or_else(|| format!("Rally ({distance} tiles)")),
        };
        let result = self
            .recovery
            .with_recovery("rally_start", || {
                self.march
                    .start_march(order.clone(), CapacityContext::RallyStart)
            })
            .await;
        match result {
            Ok(task) => {
                info!(code = object.code, level = object.level, loc = %object.loc, "rally started");
                self.notifier
                    .emit(
                        Notification::new(NotificationKind::RallyStart, "started")
                            .with_target(object.code, object.level, object.loc),
                    )
                    .await;
                Ok(ActionOutcome::Launched(task))
            }
            Err(error) => skip_on_business(error),
        }
    }
}

fn skip_on_business(error: ApiError) -> Result<ActionOutcome, ApiError> {
    match error.business_code() {
        Some(code) => Ok(ActionOutcome::Skipped(SkipReason::Rejected(code.to_string()))),
        None => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{FarmerConfig, LevelRange, RallyTarget},
        recovery::testing::{Harness, harness},
    };
    use lok_common::TroopAmount;
    use serde_json::json;

    const MONSTER: u32 = 20700505;

    fn bands() -> Vec<RallyTarget> {
        vec![RallyTarget {
            code: MONSTER,
            level_ranges: vec![LevelRange {
                min_level: 1,
                max_level: 3,
                troops: vec![TroopAmount {
                    code: 50100306,
                    amount: 5000,
                }],
                rally_time: None,
                message: None,
            }],
        }]
    }

    async fn rally_harness(configure: impl FnOnce(&mut FarmerConfig)) -> (Harness, RallyCoordinator) {
        let mut config = FarmerConfig::default();
        configure(&mut config);
        let h = harness(config, None);
        assert!(h.recovery.reinitialize().await);
        let rally = RallyCoordinator::new(
            h.api.clone(),
            h.kingdom.clone(),
            h.march.clone(),
            h.recovery.clone(),
            h.sink.clone(),
            h.config.clone(),
            Arc::new(Notify::new()),
        );
        (h, rally)
    }

    fn battle(id: &str, level: u64, joined: bool) -> Value {
        json!({
            "_id": id,
            "isJoined": joined,
            "targetMonster": {"code": MONSTER, "level": level},
            "toLoc": [20, 900, 900]
        })
    }

    #[test]
    fn battle_summary_reads_either_monster_shape() {
        let nested = BattleSummary::from_value(&json!({
            "_id": "r1",
            "target": {"monster": {"code": MONSTER, "level": 2, "loc": [20, 5, 6]}}
        }))
        .unwrap();
        assert_eq!(nested.monster_code, Some(MONSTER));
        assert_eq!(nested.destination, Some(Location::new(20, 5, 6)));

        let flat = BattleSummary::from_value(&battle("r2", 3, true)).unwrap();
        assert_eq!(flat.monster_level, 3);
        assert!(flat.joined);
        assert!(BattleSummary::from_value(&json!({"targetMonster": {}})).is_none());
    }

    #[tokio::test]
    async fn joins_matching_unjoined_rallies_once() {
        let (h, rally) = rally_harness(|config| {
            config.rally.join.enabled = true;
            config.rally.join.targets = bands();
        })
        .await;
        h.api.set_default(
            "alliance/battle/list/v2",
            json!({"battles": [battle("r1", 2, false), battle("r2", 9, false), battle("r3", 1, true)]}),
        );

        let joined = rally.scan_for_joinable_rallies().await.unwrap();
        assert_eq!(joined, vec!["r1".to_string()]);
        let body = &h.api.bodies("field/rally/join")[0];
        assert_eq!(body["rallyId"], "r1");

        let again = rally.scan_for_joinable_rallies().await.unwrap();
        assert!(again.is_empty());
        assert_eq!(h.api.count("field/rally/join"), 1);
        assert_eq!(h.sink.kinds(), vec![NotificationKind::RallyJoin]);
    }

    #[tokio::test]
    async fn stops_when_join_limit_reached() {
        let (h, rally) = rally_harness(|config| {
            config.rally.join.enabled = true;
            config.rally.join.num_march = 1;
            config.rally.join.targets = bands();
        })
        .await;
        h.api.set_default(
            "alliance/battle/list/v2",
            json!({"battles": [battle("r1", 2, true), battle("r2", 2, false)]}),
        );
        assert!(rally.scan_for_joinable_rallies().await.unwrap().is_empty());
        assert_eq!(h.api.count("field/rally/join"), 0);
    }

    #[tokio::test]
    async fn start_skips_monsters_already_rallied() {
        let (h, rally) = rally_harness(|config| {
            config.rally.start.enabled = true;
            config.rally.start.targets = bands();
        })
        .await;
        h.api.set_default(
            "alliance/battle/list/v2",
            json!({"battles": [battle("r1", 2, false)]}),
        );
        let object: FieldObject = serde_json::from_value(json!({
            "_id": "fo-m", "code": MONSTER, "level": 2, "loc": [20, 900, 900], "state": 1
        }))
        .unwrap();

        let outcome = rally.start_rally(&object).await.unwrap();
        assert_eq!(outcome, ActionOutcome::Skipped(SkipReason::RallyExists));
        assert_eq!(h.api.count("field/rally/start"), 0);
    }

    #[tokio::test]
    async fn start_launches_with_band_defaults() {
        let (h, rally) = rally_harness(|config| {
            config.rally.start.enabled = true;
            config.rally.start.targets = bands();
        })
        .await;
        let object: FieldObject = serde_json::from_value(json!({
            "_id": "fo-m", "code": MONSTER, "level": 2, "loc": [20, 1003, 1004], "state": 1
        }))
        .unwrap();

        let outcome = rally.start_rally(&object).await.unwrap();
        assert!(matches!(outcome, ActionOutcome::Launched(_)));
        let body = &h.api.bodies("field/rally/start")[0];
        assert_eq!(body["rallyTime"], 10);
        assert_eq!(body["message"], "Rally (5 tiles)");
        assert_eq!(body["marchType"], 5);
        assert_eq!(body["toLoc"], json!([20, 1003, 1004]));
    }
}
