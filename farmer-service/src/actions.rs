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

use lok_common::{
    ACTION_POINT_ITEMS, CRYSTAL_MINE_CODE, CRYSTAL_MINE_MIN_KINGDOM_LEVEL,
    DRAGON_SOUL_CAVERN_CODE, FieldObject, MarchKind, MarchTask, ObjectClass,
    geometry::point_allowed,
};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    api::GameApi,
    config::{FarmerConfig, TargetConfig},
    error::{ApiError, CODE_INSUFFICIENT_ACTION_POINT},
    march::{CapacityContext, MarchCoordinator, MarchOrder},
    notify::{Notification, NotificationKind, NotificationSink},
    rally::RallyCoordinator,
    recovery::RecoveryManager,
    state::{HaltFlags, KingdomState},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    Disabled,
    NotTargeted,
    Unavailable,
    LevelTooLow,
    NoDrago,
    OutsideArea,
    TooFar,
    Conflict,
    NoCapacity,
    NoTroops,
    NoActionPoints,
    AlreadyJoined,
    RallyExists,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Launched(MarchTask),
    Skipped(SkipReason),
    /// The quota halt flag is up; nothing was sent.
    Halted,
}

/// Turns scanned field objects into gather, attack or rally launches.
pub struct ActionCoordinator {
    api: Arc<dyn GameApi>,
    kingdom: Arc<RwLock<KingdomState>>,
    march: Arc<MarchCoordinator>,
    rally: Arc<RallyCoordinator>,
    recovery: Arc<RecoveryManager>,
    halt: Arc<HaltFlags>,
    notifier: Arc<dyn NotificationSink>,
}

impl ActionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn GameApi>,
        kingdom: Arc<RwLock<KingdomState>>,
        march: Arc<MarchCoordinator>,
        rally: Arc<RallyCoordinator>,
        recovery: Arc<RecoveryManager>,
        halt: Arc<HaltFlags>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            api,
            kingdom,
            march,
            rally,
            recovery,
            halt,
            notifier,
        }
    }

    /// Routes one object by class. `config` is the snapshot taken at pass start.
    pub async fn evaluate(
        &self,
        object: &FieldObject,
        config: &FarmerConfig,
    ) -> Result<ActionOutcome, ApiError> {
        if self.halt.quota_exceeded() {
            return Ok(ActionOutcome::Halted);
        }
        if !object.is_available() {
            return Ok(ActionOutcome::Skipped(SkipReason::Unavailable));
        }
        match object.class() {
            ObjectClass::Mine => self.gather(object, config).await,
            ObjectClass::Monster
                if config.rally.start.enabled
                    && config.rally.start.band_for(object.code, object.level).is_some() =>
            {
                self.rally.start_rally(object).await
            }
            ObjectClass::Monster => self.attack(object, config).await,
            ObjectClass::Other => Ok(ActionOutcome::Skipped(SkipReason::NotTargeted)),
        }
    }

    pub async fn gather(
        &self,
        object: &FieldObject,
        config: &FarmerConfig,
    ) -> Result<ActionOutcome, ApiError> {
        if self.halt.quota_exceeded() {
            return Ok(ActionOutcome::Halted);
        }
        if !config.gather.enabled {
            return Ok(ActionOutcome::Skipped(SkipReason::Disabled));
        }
        let Some(target) = config.gather.target_for(object.code, object.level) else {
            return Ok(ActionOutcome::Skipped(SkipReason::NotTargeted));
        };

        let drago_id = {
            let kingdom = self.kingdom.read().await;
            if object.code == CRYSTAL_MINE_CODE && kingdom.level < CRYSTAL_MINE_MIN_KINGDOM_LEVEL {
                return Ok(ActionOutcome::Skipped(SkipReason::LevelTooLow));
            }
            if object.code == DRAGON_SOUL_CAVERN_CODE {
                match kingdom.drago_ids.first() {
                    Some(id) => Some(id.clone()),
                    None => return Ok(ActionOutcome::Skipped(SkipReason::NoDrago)),
                }
            } else {
                None
            }
        };
        if let Some(reason) = self.placement_problem(object, target, config).await {
            return Ok(ActionOutcome::Skipped(reason));
        }
        if !self
            .march
            .validate_capacity(CapacityContext::Gather, Some(object.loc), false)
            .await?
        {
            return Ok(ActionOutcome::Skipped(SkipReason::NoCapacity));
        }

        let order = MarchOrder::Field {
            destination: object.loc,
            target_id: Some(object.id.clone()),
            kind: MarchKind::Gather,
            troops: target.troops.clone(),
            drago_id,
        };
        self.launch(object, order, NotificationKind::Gather).await
    }

    pub async fn attack(
        &self,
        object: &FieldObject,
        config: &FarmerConfig,
    ) -> Result<ActionOutcome, ApiError> {
        if self.halt.quota_exceeded() {
            return Ok(ActionOutcome::Halted);
        }
        if !config.attack.enabled {
            return Ok(ActionOutcome::Skipped(SkipReason::Disabled));
        }
        let Some(target) = config.attack.target_for(object.code, object.level) else {
            return Ok(ActionOutcome::Skipped(SkipReason::NotTargeted));
        };
        if let Some(reason) = self.placement_problem(object, target, config).await {
            return Ok(ActionOutcome::Skipped(reason));
        }
        if !self
            .march
            .validate_capacity(CapacityContext::General, Some(object.loc), false)
            .await?
        {
            return Ok(ActionOutcome::Skipped(SkipReason::NoCapacity));
        }

        let order = MarchOrder::Field {
            destination: object.loc,
            target_id: Some(object.id.clone()),
            kind: MarchKind::Attack,
            troops: target.troops.clone(),
            drago_id: None,
        };
        match self.launch(object, order.clone(), NotificationKind::Attack).await? {
            ActionOutcome::Skipped(SkipReason::Rejected(code))
                if code == CODE_INSUFFICIENT_ACTION_POINT =>
            {
                if !self.refill_action_points().await? {
                    return Ok(ActionOutcome::Skipped(SkipReason::NoActionPoints));
                }
                self.launch(object, order, NotificationKind::Attack).await
            }
            outcome => Ok(outcome),
        }
    }

    /// Area, distance and conflict checks shared by gather and attack.
    async fn placement_problem(
        &self,
        object: &FieldObject,
        target: &TargetConfig,
        config: &FarmerConfig,
    ) -> Option<SkipReason> {
        if !point_allowed(&config.scan.allowed_areas, object.loc.x, object.loc.y) {
            return Some(SkipReason::OutsideArea);
        }
        if let Some(max_distance) = target.max_distance {
            let home = self.kingdom.read().await.loc;
            if let Some(home) = home {
                if object.loc.tile_distance(home.x, home.y) > max_distance {
                    return Some(SkipReason::TooFar);
                }
            }
        }
        if self
            .march
            .is_target_being_marched(Some(object.loc), Some(&object.id))
            .await
        {
            return Some(SkipReason::Conflict);
        }
        None
    }

    async fn launch(
        &self,
        object: &FieldObject,
        order: MarchOrder,
        kind: NotificationKind,
    ) -> Result<ActionOutcome, ApiError> {
        let context = match kind {
            NotificationKind::Gather => CapacityContext::Gather,
            _ => CapacityContext::General,
        };
        let result = self
            .recovery
            .with_recovery(&format!("{:?}", order.kind()), || {
                self.march.start_march(order.clone(), context)
            })
            .await;
        match result {
            Ok(task) => {
                self.notifier
                    .emit(
                        Notification::new(kind, "launched")
                            .with_target(object.code, object.level, object.loc),
                    )
                    .await;
                Ok(ActionOutcome::Launched(task))
            }
            Err(ApiError::QuotaExceeded) => {
                self.raise_quota_halt(object).await;
                Ok(ActionOutcome::Halted)
            }
            Err(error) => match error.business_code() {
                Some(code) => {
                    debug!(code = object.code, loc = %object.loc, error = %error, "march rejected");
                    Ok(ActionOutcome::Skipped(SkipReason::Rejected(code.to_string())))
                }
                None => Err(error),
            },
        }
    }

    async fn raise_quota_halt(&self, object: &FieldObject) {
        if self.halt.raise_quota() {
            warn!(code = object.code, "daily quota exceeded; gathering halted");
            self.notifier
                .emit(
                    Notification::new(NotificationKind::QuotaExceeded, "halted")
                        .with_target(object.code, object.level, object.loc),
                )
                .await;
        }
    }

    /// Uses the first owned action-point item; false when none is left.
    async fn refill_action_points(&self) -> Result<bool, ApiError> {
        let items = self.api.item_list().await?;
        let owned = |code: u32| {
            items.iter().any(|item| {
                item.get("code").and_then(Value::as_u64) == Some(u64::from(code))
                    && item.get("amount").and_then(Value::as_u64).unwrap_or(0) > 0
            })
        };
        for (code, amount) in ACTION_POINT_ITEMS {
            if !owned(code) {
                continue;
            }
            match self.api.item_use(code, amount).await {
                Ok(_) => {
                    info!(item_code = code, amount, "action points refilled");
                    return Ok(true);
                }
                Err(error) if error.business_code().is_some() => {
                    warn!(item_code = code, error = %error, "action point item rejected")
                }
                Err(error) => return Err(error),
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::FeatureTargets,
        recovery::testing::{Harness, harness},
    };
    use lok_common::{Location, TroopAmount};
    use serde_json::json;
    use tokio::sync::Notify;

    const GOLD_MINE: u32 = 20100104;
    const ORC: u32 = 20200101;

    fn target(code: u32) -> TargetConfig {
        TargetConfig {
            code,
            level: vec![1, 2, 3],
            troops: vec![TroopAmount {
                code: 50100305,
                amount: 1000,
            }],
            max_distance: None,
        }
    }

    fn config() -> FarmerConfig {
        let mut config = FarmerConfig::default();
        config.scan.max_marches = Some(3);
        config.gather = FeatureTargets {
            enabled: true,
            targets: vec![target(GOLD_MINE), target(CRYSTAL_MINE_CODE), target(DRAGON_SOUL_CAVERN_CODE)],
        };
        config.attack = FeatureTargets {
            enabled: true,
            targets: vec![target(ORC)],
        };
        config
    }

    fn object(id: &str, code: u32, x: i64) -> FieldObject {
        serde_json::from_value(json!({
            "_id": id, "code": code, "level": 2, "loc": [20, x, 1010], "state": 1
        }))
        .unwrap()
    }

    async fn coordinator(config: FarmerConfig) -> (Harness, ActionCoordinator, Arc<HaltFlags>) {
        let h = harness(config, None);
        assert!(h.recovery.reinitialize().await);
        let rally = Arc::new(RallyCoordinator::new(
            h.api.clone(),
            h.kingdom.clone(),
            h.march.clone(),
            h.recovery.clone(),
            h.sink.clone(),
            h.config.clone(),
            Arc::new(Notify::new()),
        ));
        let halt = Arc::new(HaltFlags::default());
        let actions = ActionCoordinator::new(
            h.api.clone(),
            h.kingdom.clone(),
            h.march.clone(),
            rally,
            h.recovery.clone(),
            halt.clone(),
            h.sink.clone(),
        );
        (h, actions, halt)
    }

    #[tokio::test]
    async fn gather_launches_field_march() {
        let (h, actions, _) = coordinator(config()).await;
        let outcome = actions
            .evaluate(&object("fo-1", GOLD_MINE, 1010), &config())
            .await
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::Launched(_)));
        let body = &h.api.bodies("field/march/start")[0];
        assert_eq!(body["marchType"], 1);
        assert_eq!(body["toLoc"], json!([20, 1010, 1010]));
        assert_eq!(h.sink.kinds(), vec![NotificationKind::Gather]);
    }

    #[tokio::test]
    async fn quota_error_halts_later_gathers_without_backend_calls() {
        let (h, actions, halt) = coordinator(config()).await;
        h.api.push("field/march/start", Err(ApiError::QuotaExceeded));

        let first = actions
            .evaluate(&object("fo-1", GOLD_MINE, 1010), &config())
            .await
            .unwrap();
        assert_eq!(first, ActionOutcome::Halted);
        assert!(halt.quota_exceeded());
        assert_eq!(h.sink.kinds(), vec![NotificationKind::QuotaExceeded]);

        let calls_before = h.api.calls.lock().unwrap().len();
        let second = actions
            .evaluate(&object("fo-2", GOLD_MINE, 1020), &config())
            .await
            .unwrap();
        assert_eq!(second, ActionOutcome::Halted);
        assert_eq!(h.api.calls.lock().unwrap().len(), calls_before);
    }

    #[tokio::test]
    async fn session_loss_mid_gather_recovers_once_and_retries_once() {
        let (h, actions, _) = coordinator(config()).await;
        let generation = h.recovery.generation();
        h.api.push(
            "field/march/start",
            Err(ApiError::NotAuthenticated("not_online".to_string())),
        );

        let outcome = actions
            .evaluate(&object("fo-1", GOLD_MINE, 1010), &config())
            .await
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::Launched(_)));
        assert_eq!(h.recovery.generation(), generation + 1);
        assert_eq!(h.api.count("field/march/start"), 2);
    }

    #[tokio::test]
    async fn repeated_session_loss_is_propagated_after_one_retry() {
        let (h, actions, _) = coordinator(config()).await;
        for _ in 0..2 {
            h.api.push(
                "field/march/start",
                Err(ApiError::NotAuthenticated("no_auth".to_string())),
            );
        }
        let error = actions
            .evaluate(&object("fo-1", GOLD_MINE, 1010), &config())
            .await
            .unwrap_err();
        assert!(error.is_session_invalid());
        assert_eq!(h.api.count("field/march/start"), 2);
    }

    #[tokio::test]
    async fn crystal_mine_needs_kingdom_level() {
        let (h, actions, _) = coordinator(config()).await;
        h.kingdom.write().await.level = 10;
        let outcome = actions
            .evaluate(&object("fo-c", CRYSTAL_MINE_CODE, 1010), &config())
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Skipped(SkipReason::LevelTooLow));
    }

    #[tokio::test]
    async fn dragon_cavern_sends_drago() {
        let (h, actions, _) = coordinator(config()).await;
        actions
            .evaluate(&object("fo-d", DRAGON_SOUL_CAVERN_CODE, 1010), &config())
            .await
            .unwrap();
        assert_eq!(h.api.bodies("field/march/start")[0]["dragoId"], "drago-1");

        h.kingdom.write().await.drago_ids.clear();
        let outcome = actions
            .evaluate(&object("fo-e", DRAGON_SOUL_CAVERN_CODE, 1030), &config())
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Skipped(SkipReason::NoDrago));
    }

    #[tokio::test]
    async fn cached_march_on_target_skips_gather() {
        let (h, actions, _) = coordinator(config()).await;
        let loc = Location::new(20, 1010, 1010);
        h.march
            .ingest_march_objects(
                &[loc.zone_id().unwrap()],
                &json!({"objects": [{"toLoc": [20, 1010, 1010], "toId": "fo-1"}]}),
            )
            .await;
        let outcome = actions
            .evaluate(&object("fo-1", GOLD_MINE, 1010), &config())
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Skipped(SkipReason::Conflict));
        assert_eq!(h.api.count("field/march/start"), 0);
    }

    #[tokio::test]
    async fn attack_refills_action_points_and_retries_once() {
        let (h, actions, _) = coordinator(config()).await;
        h.api.push(
            "field/march/start",
            Err(ApiError::business(CODE_INSUFFICIENT_ACTION_POINT)),
        );
        h.api.set_default(
            "item/list",
            json!({"items": [{"code": 10101050, "amount": 3}, {"code": 10101049, "amount": 1}]}),
        );

        let outcome = actions
            .evaluate(&object("fo-o", ORC, 1010), &config())
            .await
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::Launched(_)));
        assert_eq!(h.api.bodies("item/use"), vec![json!({"code": 10101050, "amount": 10})]);
        assert_eq!(h.api.bodies("field/march/start")[1]["marchType"], 5);
    }

    #[tokio::test]
    async fn attack_without_action_point_items_is_skipped() {
        let (h, actions, _) = coordinator(config()).await;
        h.api.push(
            "field/march/start",
            Err(ApiError::business(CODE_INSUFFICIENT_ACTION_POINT)),
        );
        let outcome = actions
            .evaluate(&object("fo-o", ORC, 1010), &config())
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Skipped(SkipReason::NoActionPoints));
        assert_eq!(h.api.count("field/march/start"), 1);
    }

    #[tokio::test]
    async fn attack_honours_max_distance() {
        let mut config = config();
        config.attack.targets[0].max_distance = Some(5.0);
        let (_, actions, _) = coordinator(config.clone()).await;
        let outcome = actions
            .evaluate(&object("fo-o", ORC, 1100), &config)
            .await
            .unwrap();
        assert_eq!(outcome, ActionOutcome::Skipped(SkipReason::TooFar));
    }
}
