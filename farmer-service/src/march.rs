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

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use lok_common::{
    Location, MarchKind, MarchTask, TroopAmount, ZoneId, march_troops_payload,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    api::GameApi,
    config::{CacheConfig, ConfigStore, FarmerConfig},
    error::{ApiError, CODE_CAPACITY, CODE_SAME_TARGET},
    state::KingdomState,
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapacityContext {
    Gather,
    RallyJoin,
    RallyStart,
    General,
}

/// One in-flight march seen on the field channel, normalised at ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarchObservation {
    pub destination: Option<Location>,
    pub field_object_id: Option<String>,
}

impl MarchObservation {
    fn matches(&self, location: Location, field_object_id: Option<&str>) -> bool {
        same_target(
            self.destination,
            self.field_object_id.as_deref(),
            location,
            field_object_id,
        )
    }
}

/// The object id decides when both sides carry one; coordinates otherwise.
fn same_target(
    destination: Option<Location>,
    target_id: Option<&str>,
    location: Location,
    wanted_id: Option<&str>,
) -> bool {
    match (wanted_id, target_id) {
        (Some(wanted), Some(seen)) => wanted == seen,
        _ => destination == Some(location),
    }
}

fn task_targets(task: &MarchTask, location: Location, wanted_id: Option<&str>) -> bool {
    same_target(task.destination, task.target_id.as_deref(), location, wanted_id)
}

const DESTINATION_KEYS: [&str; 4] = ["toLoc", "loc", "targetLoc", "destination"];
const OBJECT_ID_KEYS: [&str; 4] = ["toId", "targetId", "fieldObjectId", "foId"];

/// Reads march entries from a decoded `/march/objects` payload.
pub fn observations_from_payload(value: &Value) -> Vec<MarchObservation> {
    let entries = ["objects", "marches"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_array))
        .or_else(|| value.as_array());
    let Some(entries) = entries else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let destination = DESTINATION_KEYS
                .iter()
                .find_map(|key| entry.get(*key).and_then(Location::from_value));
            let field_object_id = OBJECT_ID_KEYS
                .iter()
                .find_map(|key| entry.get(*key).and_then(Value::as_str))
                .or_else(|| {
                    entry
                        .get("target")
                        .and_then(|target| target.get("_id"))
                        .and_then(Value::as_str)
                })
                .map(str::to_string);
            (destination.is_some() || field_object_id.is_some()).then_some(MarchObservation {
                destination,
                field_object_id,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
struct CacheEntry {
    observations: Vec<MarchObservation>,
    at: Instant,
}

impl CacheEntry {
    fn fresh(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.at) <= max_age
    }

    fn contains(&self, location: Location, field_object_id: Option<&str>) -> bool {
        self.observations
            .iter()
            .any(|observation| observation.matches(location, field_object_id))
    }
}

/// Recent march positions keyed by the zones being scanned when they arrived.
#[derive(Debug, Default)]
pub struct MarchObjectCache {
    zones: HashMap<ZoneId, CacheEntry>,
    order: VecDeque<ZoneId>,
    global: Option<CacheEntry>,
}

impl MarchObjectCache {
    pub fn ingest(
        &mut self,
        zones: &[ZoneId],
        observations: Vec<MarchObservation>,
        now: Instant,
        settings: &CacheConfig,
    ) {
        let entry = CacheEntry {
            observations,
            at: now,
        };
        for zone in zones {
            if self.zones.insert(*zone, entry.clone()).is_none() {
                self.order.push_back(*zone);
            }
        }
        while self.order.len() > settings.max_zone_entries {
            if let Some(oldest) = self.order.pop_front() {
                self.zones.remove(&oldest);
            }
        }
        self.global = Some(entry);
    }

    pub fn contains(
        &mut self,
        location: Location,
        field_object_id: Option<&str>,
        now: Instant,
        settings: &CacheConfig,
    ) -> bool {
        let zone_hit = location
            .zone_id()
            .and_then(|zone| self.zones.get(&zone))
            .filter(|entry| entry.fresh(now, Duration::from_secs(settings.zone_fresh_secs)))
            .is_some_and(|entry| entry.contains(location, field_object_id));
        if zone_hit {
            return true;
        }

        let global_max_age = Duration::from_secs(settings.global_fresh_secs);
        match &self.global {
            Some(entry) if entry.fresh(now, global_max_age) => {
                entry.contains(location, field_object_id)
            }
            Some(_) => {
                self.global = None;
                false
            }
            None => false,
        }
    }

    pub fn zone_entries(&self) -> usize {
        self.zones.len()
    }

    pub fn clear(&mut self) {
        self.zones.clear();
        self.order.clear();
        self.global = None;
    }
}

/// What to launch; every variant goes through [`MarchCoordinator::start_march`].
#[derive(Debug, Clone, PartialEq)]
pub enum MarchOrder {
    Field {
        destination: Location,
        target_id: Option<String>,
        kind: MarchKind,
        troops: Vec<TroopAmount>,
        drago_id: Option<String>,
    },
    RallyJoin {
        rally_id: String,
        destination: Option<Location>,
        troops: Vec<TroopAmount>,
    },
    RallyStart {
        destination: Location,
        target_id: Option<String>,
        troops: Vec<TroopAmount>,
        rally_time: u32,
        message: String,
    },
}

impl MarchOrder {
    pub fn destination(&self) -> Option<Location> {
        match self {
            MarchOrder::Field { destination, .. } | MarchOrder::RallyStart { destination, .. } => {
                Some(*destination)
            }
            MarchOrder::RallyJoin { destination, .. } => *destination,
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            MarchOrder::Field { target_id, .. } | MarchOrder::RallyStart { target_id, .. } => {
                target_id.as_deref()
            }
            MarchOrder::RallyJoin { .. } => None,
        }
    }

    pub fn kind(&self) -> MarchKind {
        match self {
            MarchOrder::Field { kind, .. } => *kind,
            MarchOrder::RallyJoin { .. } | MarchOrder::RallyStart { .. } => MarchKind::Rally,
        }
    }

    pub fn troops(&self) -> &[TroopAmount] {
        match self {
            MarchOrder::Field { troops, .. }
            | MarchOrder::RallyJoin { troops, .. }
            | MarchOrder::RallyStart { troops, .. } => troops,
        }
    }
}

#[derive(Debug, Default)]
struct MarchBook {
    queue: Vec<MarchTask>,
    march_limit: usize,
    march_size: u64,
    cache: MarchObjectCache,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MarchStatus {
    pub queue_len: usize,
    pub march_limit: usize,
    pub march_size: u64,
    pub cached_zones: usize,
}

/// Owns the troop queue and the march-object cache behind one mutex.
pub struct MarchCoordinator {
    api: Arc<dyn GameApi>,
    kingdom: Arc<RwLock<KingdomState>>,
    config: ConfigStore,
    book: Mutex<MarchBook>,
}

impl MarchCoordinator {
    pub fn new(
        api: Arc<dyn GameApi>,
        kingdom: Arc<RwLock<KingdomState>>,
        config: ConfigStore,
    ) -> Self {
        Self {
            api,
            kingdom,
            config,
            book: Mutex::new(MarchBook::default()),
        }
    }

    pub async fn status(&self) -> MarchStatus {
        let book = self.book.lock().await;
        MarchStatus {
            queue_len: book.queue.len(),
            march_limit: book.march_limit,
            march_size: book.march_size,
            cached_zones: book.cache.zone_entries(),
        }
    }

    #[cfg(test)]
    pub async fn queue(&self) -> Vec<MarchTask> {
        self.book.lock().await.queue.clone()
    }

    /// Replaces the troop queue and limits from `kingdom/profile/troops`.
    pub async fn refresh_status(&self) -> Result<MarchStatus, ApiError> {
        let response = self.api.profile_troops().await?;
        let queue: Vec<MarchTask> = response
            .get("troops")
            .and_then(|troops| troops.get("field"))
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| MarchTask::from_value(entry, MarchKind::Gather))
                    .collect()
            })
            .unwrap_or_default();
        let info = response.get("info");
        let march_limit = info
            .and_then(|info| info.get("marchLimit"))
            .and_then(Value::as_u64);
        let march_size = info
            .and_then(|info| info.get("marchSize"))
            .and_then(Value::as_u64);

        let mut book = self.book.lock().await;
        book.queue = queue;
        if let Some(limit) = march_limit {
            book.march_limit = limit as usize;
        }
        if let Some(size) = march_size {
            book.march_size = size;
        }
        debug!(
            queue_len = book.queue.len(),
            march_limit = book.march_limit,
            "troop queue refreshed"
        );
        Ok(MarchStatus {
            queue_len: book.queue.len(),
            march_limit: book.march_limit,
            march_size: book.march_size,
            cached_zones: book.cache.zone_entries(),
        })
    }

    pub async fn ingest_march_objects(&self, zones: &[ZoneId], payload: &Value) {
        let observations = observations_from_payload(payload);
        let settings = self.config.current().cache.clone();
        let mut book = self.book.lock().await;
        debug!(
            zones = zones.len(),
            marches = observations.len(),
            "march objects cached"
        );
        book.cache
            .ingest(zones, observations, Instant::now(), &settings);
    }

    pub async fn reset_cache(&self) {
        self.book.lock().await.cache.clear();
    }

    /// True when capacity remains for `context`. The effective in-flight count
    /// is the max of the local queue, the backend's march count for the
    /// destination and, on a final check, the active task list.
    pub async fn validate_capacity(
        &self,
        context: CapacityContext,
        destination: Option<Location>,
        final_check: bool,
    ) -> Result<bool, ApiError> {
        let book = self.book.lock().await;
        self.capacity_available(&book, context, destination, final_check)
            .await
    }

    async fn capacity_available(
        &self,
        book: &MarchBook,
        context: CapacityContext,
        destination: Option<Location>,
        final_check: bool,
    ) -> Result<bool, ApiError> {
        let config = self.config.current();
        let limit = context_limit(&config, book.march_limit, context);

        let queue_count = book.queue.len();
        let api_count = match destination {
            Some(destination) => {
                let from_id = self.kingdom.read().await.field_object_id.clone();
                self.api.march_info(&from_id, destination).await?.num_march
            }
            None => 0,
        };
        let task_count = if final_check {
            self.api
                .task_all()
                .await?
                .iter()
                .filter(|task| task.is_active_march())
                .count()
        } else {
            0
        };

        let effective = queue_count.max(api_count).max(task_count);
        let available = effective < limit;
        debug!(
            ?context,
            queue_count,
            api_count,
            task_count,
            limit,
            available,
            "march capacity check"
        );
        Ok(available)
    }

    /// Waits for fresh march positions, then reports whether anyone is
    /// already marching on the destination.
    pub async fn is_target_being_marched(
        &self,
        location: Option<Location>,
        field_object_id: Option<&str>,
    ) -> bool {
        let Some(location) = location else {
            return true;
        };
        let config = self.config.current();
        tokio::time::sleep(config.scan.conflict_wait()).await;

        let mut book = self.book.lock().await;
        if book
            .queue
            .iter()
            .any(|task| task_targets(task, location, field_object_id))
        {
            return true;
        }
        book.cache
            .contains(location, field_object_id, Instant::now(), &config.cache)
    }

    /// The only way a march is launched. Re-checks capacity from every source
    /// and refuses a second march to a destination already in the queue.
    pub async fn start_march(
        &self,
        order: MarchOrder,
        context: CapacityContext,
    ) -> Result<MarchTask, ApiError> {
        let mut book = self.book.lock().await;
        let destination = order.destination();
        let target_id = order.target_id().map(str::to_string);
        if let Some(destination) = destination {
            if book
                .queue
                .iter()
                .any(|task| task_targets(task, destination, target_id.as_deref()))
            {
                return Err(ApiError::business(CODE_SAME_TARGET));
            }
        }
        if !self
            .capacity_available(&book, context, destination, true)
            .await?
        {
            return Err(ApiError::business(CODE_CAPACITY));
        }

        let from_id = self.kingdom.read().await.field_object_id.clone();
        let response = match &order {
            MarchOrder::Field {
                destination,
                kind,
                troops,
                drago_id,
                ..
            } => {
                let mut body = json!({
                    "fromId": from_id,
                    "marchType": kind.wire_type(),
                    "toLoc": destination,
                    "marchTroops": march_troops_payload(troops),
                });
                if let Some(drago_id) = drago_id {
                    body["dragoId"] = json!(drago_id);
                }
                self.api.march_start(body).await?
            }
            MarchOrder::RallyJoin {
                rally_id, troops, ..
            } => self.api.rally_join(rally_id, troops).await?,
            MarchOrder::RallyStart {
                destination,
                troops,
                rally_time,
                message,
                ..
            } => {
                self.api
                    .rally_start(json!({
                        "fromId": from_id,
                        "marchType": MarchKind::Attack.wire_type(),
                        "toLoc": destination,
                        "marchTroops": march_troops_payload(troops),
                        "rallyTime": rally_time,
                        "message": message,
                    }))
                    .await?
            }
        };

        let task = response
            .get("newTask")
            .and_then(|task| MarchTask::from_value(task, order.kind()))
            .map(|mut task| {
                task.destination = task.destination.or(destination);
                task.target_id = task.target_id.take().or_else(|| target_id.clone());
                task
            })
            .unwrap_or_else(|| MarchTask {
                id: Uuid::new_v4().to_string(),
                kind: order.kind(),
                destination,
                target_id,
                troops: order.troops().to_vec(),
                started_at: None,
                expected_end_at: None,
            });
        book.queue.push(task.clone());
        info!(
            task_id = %task.id,
            kind = ?task.kind,
            destination = ?destination.map(|loc| loc.to_string()),
            queue_len = book.queue.len(),
            "march launched"
        );
        Ok(task)
    }
}

/// Limit for a context; `General` takes the most restrictive of the others.
pub fn context_limit(config: &FarmerConfig, march_limit: usize, context: CapacityContext) -> usize {
    let gather = config.scan.max_marches.unwrap_or(march_limit);
    let rally_join = config.rally.join.num_march;
    let rally_start = config.rally.start.num_march;
    match context {
        CapacityContext::Gather => gather,
        CapacityContext::RallyJoin => rally_join,
        CapacityContext::RallyStart => rally_start,
        CapacityContext::General => gather.min(rally_join).min(rally_start),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{ScriptedApi, sample_kingdom_enter};

    fn coordinator(config: FarmerConfig) -> (Arc<MarchCoordinator>, Arc<ScriptedApi>) {
        let api = Arc::new(ScriptedApi::new());
        let kingdom = KingdomState::from_enter(&sample_kingdom_enter()).unwrap();
        let coordinator = MarchCoordinator::new(
            api.clone(),
            Arc::new(RwLock::new(kingdom)),
            ConfigStore::new(config),
        );
        (Arc::new(coordinator), api)
    }

    fn quick_config() -> FarmerConfig {
        let mut config = FarmerConfig::default();
        config.scan.conflict_wait_ms = 0;
        config
    }

    fn field_entries(count: usize) -> Value {
        let field: Vec<Value> = (0..count)
            .map(|index| {
                json!({"_id": format!("t{index}"), "code": 4, "toLoc": [20, 500 + index, 500]})
            })
            .collect();
        json!({"troops": {"field": field}, "info": {"marchLimit": 5, "marchSize": 9000}})
    }

    fn gather_order(x: i64) -> MarchOrder {
        stacked_order(x, None)
    }

    fn stacked_order(x: i64, target_id: Option<&str>) -> MarchOrder {
        MarchOrder::Field {
            destination: Location::new(20, x, 300),
            target_id: target_id.map(str::to_string),
            kind: MarchKind::Gather,
            troops: vec![TroopAmount {
                code: 50100305,
                amount: 100,
            }],
            drago_id: None,
        }
    }

    #[tokio::test]
    async fn capacity_uses_max_of_queue_and_backend_count() {
        let mut config = quick_config();
        config.scan.max_marches = Some(3);
        let (coordinator, api) = coordinator(config);
        api.set_default("kingdom/profile/troops", field_entries(2));
        coordinator.refresh_status().await.unwrap();
        api.set_default("field/march/info", json!({"numMarch": 3}));

        let available = coordinator
            .validate_capacity(
                CapacityContext::Gather,
                Some(Location::new(20, 10, 10)),
                false,
            )
            .await
            .unwrap();
        assert!(!available);
    }

    #[tokio::test]
    async fn capacity_never_granted_at_or_above_limit() {
        for (queue, api_count, tasks) in [(0, 0, 3), (3, 0, 0), (0, 3, 0), (1, 2, 4), (2, 1, 0)] {
            let mut config = quick_config();
            config.scan.max_marches = Some(3);
            let (coordinator, api) = coordinator(config);
            api.set_default("kingdom/profile/troops", field_entries(queue));
            coordinator.refresh_status().await.unwrap();
            api.set_default("field/march/info", json!({"numMarch": api_count}));
            let task_list: Vec<Value> = (0..tasks).map(|_| json!({"code": 5, "status": 1})).collect();
            api.set_default("kingdom/task/all", json!({"kingdomTasks": task_list}));

            let available = coordinator
                .validate_capacity(CapacityContext::Gather, Some(Location::new(20, 1, 1)), true)
                .await
                .unwrap();
            let effective = queue.max(api_count).max(tasks);
            assert_eq!(available, effective < 3, "queue={queue} api={api_count} tasks={tasks}");
        }
    }

    #[test]
    fn general_context_takes_most_restrictive_limit() {
        let mut config = FarmerConfig::default();
        config.scan.max_marches = Some(6);
        config.rally.join.num_march = 4;
        config.rally.start.num_march = 5;
        assert_eq!(context_limit(&config, 9, CapacityContext::General), 4);
        assert_eq!(context_limit(&config, 9, CapacityContext::Gather), 6);
        config.scan.max_marches = None;
        assert_eq!(context_limit(&config, 2, CapacityContext::Gather), 2);
        assert_eq!(context_limit(&config, 2, CapacityContext::General), 2);
    }

    #[tokio::test]
    async fn cached_march_blocks_same_target() {
        let (coordinator, _) = coordinator(quick_config());
        let target = Location::new(20, 640, 640);
        let zone = target.zone_id().unwrap();
        coordinator
            .ingest_march_objects(
                &[zone],
                &json!({"objects": [{"toLoc": [20, 640, 640], "toId": "fo-1"}]}),
            )
            .await;

        assert!(coordinator.is_target_being_marched(Some(target), Some("fo-1")).await);
        assert!(coordinator.is_target_being_marched(Some(target), None).await);
        assert!(!coordinator
            .is_target_being_marched(Some(Location::new(20, 641, 640)), None)
            .await);
    }

    #[tokio::test]
    async fn stacked_objects_are_told_apart_by_id() {
        let (coordinator, _) = coordinator(quick_config());
        let target = Location::new(20, 100, 100);
        coordinator
            .ingest_march_objects(
                &[target.zone_id().unwrap()],
                &json!({"objects": [{"toLoc": [20, 100, 100], "toId": "fo-a"}]}),
            )
            .await;

        assert!(coordinator.is_target_being_marched(Some(target), Some("fo-a")).await);
        assert!(!coordinator.is_target_being_marched(Some(target), Some("fo-b")).await);
    }

    #[tokio::test]
    async fn invalid_location_fails_safe() {
        let (coordinator, _) = coordinator(quick_config());
        assert!(coordinator.is_target_being_marched(None, Some("fo")).await);
    }

    #[test]
    fn stale_entries_are_treated_as_absent() {
        let settings = CacheConfig::default();
        let mut cache = MarchObjectCache::default();
        let target = Location::new(20, 70, 70);
        let start = Instant::now();
        cache.ingest(
            &[target.zone_id().unwrap()],
            vec![MarchObservation {
                destination: Some(target),
                field_object_id: None,
            }],
            start,
            &settings,
        );

        assert!(cache.contains(target, None, start + Duration::from_secs(30), &settings));
        // Zone bucket expired, global still fresh.
        assert!(cache.contains(target, None, start + Duration::from_secs(120), &settings));
        assert!(!cache.contains(target, None, start + Duration::from_secs(301), &settings));
        assert!(cache.global.is_none());
    }

    #[test]
    fn zone_buckets_are_bounded_oldest_first() {
        let settings = CacheConfig::default();
        let mut cache = MarchObjectCache::default();
        let now = Instant::now();
        for zone in 0..15u32 {
            cache.ingest(&[zone], Vec::new(), now, &settings);
        }
        assert_eq!(cache.zone_entries(), settings.max_zone_entries);
        assert!(!cache.zones.contains_key(&0));
        assert!(cache.zones.contains_key(&14));
    }

    #[test]
    fn observations_accept_alternate_field_names() {
        let observations = observations_from_payload(&json!({"marches": [
            {"loc": [20, 1, 2], "fieldObjectId": "a"},
            {"targetLoc": "20,3,4", "target": {"_id": "b"}},
            {"unrelated": true}
        ]}));
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].destination, Some(Location::new(20, 1, 2)));
        assert_eq!(observations[1].field_object_id.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn start_march_appends_task_and_refuses_duplicates() {
        let mut config = quick_config();
        config.scan.max_marches = Some(5);
        let (coordinator, api) = coordinator(config);
        api.push(
            "field/march/start",
            Ok(json!({"result": true, "newTask": {"_id": "task-9", "code": 4, "expectedEnded": "2030-01-01T00:00:00Z"}})),
        );

        let task = coordinator
            .start_march(gather_order(300), CapacityContext::Gather)
            .await
            .unwrap();
        assert_eq!(task.id, "task-9");
        assert_eq!(task.destination, Some(Location::new(20, 300, 300)));
        assert_eq!(coordinator.queue().await.len(), 1);
        let body = &api.bodies("field/march/start")[0];
        assert_eq!(body["marchType"], 1);
        assert_eq!(body["fromId"], "fo-home");

        let error = coordinator
            .start_march(gather_order(300), CapacityContext::Gather)
            .await
            .unwrap_err();
        assert_eq!(error.business_code(), Some(CODE_SAME_TARGET));
        assert_eq!(api.count("field/march/start"), 1);
        assert!(coordinator
            .is_target_being_marched(Some(Location::new(20, 300, 300)), None)
            .await);
    }

    #[tokio::test]
    async fn own_march_to_stacked_object_leaves_its_neighbour_free() {
        let mut config = quick_config();
        config.scan.max_marches = Some(5);
        let (coordinator, api) = coordinator(config);
        let target = Location::new(20, 300, 300);
        coordinator
            .ingest_march_objects(
                &[target.zone_id().unwrap()],
                &json!({"objects": [{"toLoc": [20, 300, 300], "toId": "fo-a"}]}),
            )
            .await;

        let first = coordinator
            .start_march(stacked_order(300, Some("fo-a")), CapacityContext::Gather)
            .await
            .unwrap();
        assert_eq!(first.target_id.as_deref(), Some("fo-a"));
        assert!(coordinator.is_target_being_marched(Some(target), Some("fo-a")).await);
        assert!(!coordinator.is_target_being_marched(Some(target), Some("fo-b")).await);

        coordinator
            .start_march(stacked_order(300, Some("fo-b")), CapacityContext::Gather)
            .await
            .unwrap();
        let error = coordinator
            .start_march(stacked_order(300, Some("fo-a")), CapacityContext::Gather)
            .await
            .unwrap_err();
        assert_eq!(error.business_code(), Some(CODE_SAME_TARGET));
        assert_eq!(api.count("field/march/start"), 2);
        assert_eq!(coordinator.queue().await.len(), 2);
    }

    #[tokio::test]
    async fn start_march_refuses_when_task_list_is_full() {
        let mut config = quick_config();
        config.scan.max_marches = Some(1);
        let (coordinator, api) = coordinator(config);
        api.set_default(
            "kingdom/task/all",
            json!({"kingdomTasks": [{"code": 7, "status": 1}]}),
        );
        let error = coordinator
            .start_march(gather_order(10), CapacityContext::Gather)
            .await
            .unwrap_err();
        assert_eq!(error.business_code(), Some(CODE_CAPACITY));
        assert_eq!(api.count("field/march/start"), 0);
    }

    #[tokio::test]
    async fn concurrent_launches_to_one_destination_yield_one_march() {
        let mut config = quick_config();
        config.scan.max_marches = Some(5);
        let (coordinator, api) = coordinator(config);
        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .start_march(gather_order(42), CapacityContext::Gather)
                    .await
            }
        });
        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move {
                coordinator
                    .start_march(gather_order(42), CapacityContext::Gather)
                    .await
            }
        });
        let results = [first.await.unwrap(), second.await.unwrap()];
        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert_eq!(api.count("field/march/start"), 1);
    }
}
