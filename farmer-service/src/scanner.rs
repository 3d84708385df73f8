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

//! The zone-scan state machine.
//!
//! One pass walks the ranked zone queue in batches: enter a batch, wait for
//! its objects, evaluate them, leave, and stop after the grace limit so the
//! backend's enter/leave tolerance is never exceeded. The queue survives
//! between passes and is rebuilt once exhausted or after recovery.

use std::{
    collections::VecDeque,
    sync::{Arc, RwLock as StdRwLock},
    time::Duration,
};

use async_trait::async_trait;
use lok_common::{FieldObject, ZoneId, ZoneTable};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};

use crate::{
    actions::{ActionCoordinator, ActionOutcome, SkipReason},
    cancel::CancelToken,
    config::FarmerConfig,
    error::ApiError,
    notify::{Notification, NotificationKind, NotificationSink},
    state::{HaltFlags, KingdomState, ScanProgress},
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    Idle,
    Entering,
    AwaitingBatch,
    Processing,
    Draining,
}

#[derive(Debug, Default)]
pub struct ZoneScanCursor {
    queue: VecDeque<ZoneId>,
    batch: Vec<ZoneId>,
    iterations: usize,
}

impl ZoneScanCursor {
    pub fn is_exhausted(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn rebuild(&mut self, zones: Vec<ZoneId>) {
        self.queue = zones.into();
        self.batch.clear();
        self.iterations = 0;
    }

    pub fn start_pass(&mut self) {
        self.batch.clear();
        self.iterations = 0;
    }

    /// Pops the next batch, or `None` once the grace limit is reached or
    /// the queue is empty. A short tail is still handed out.
    pub fn next_batch(&mut self, batch_size: usize, grace_limit: usize) -> Option<Vec<ZoneId>> {
        if self.iterations >= grace_limit || self.queue.is_empty() {
            return None;
        }
        let take = batch_size.max(1).min(self.queue.len());
        self.batch = self.queue.drain(..take).collect();
        self.iterations += 1;
        Some(self.batch.clone())
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.batch.clear();
        self.iterations = 0;
    }
}

/// Field-channel operations a scan pass needs.
#[async_trait]
pub trait ZoneLink: Send {
    async fn enter(&mut self, zones: &[ZoneId]) -> anyhow::Result<()>;

    /// Waits for the object batch answering the last `enter`.
    async fn next_objects(&mut self, timeout: Duration) -> anyhow::Result<Vec<FieldObject>>;

    async fn leave(&mut self, zones: &[ZoneId]) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ObjectEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        object: &FieldObject,
        config: &FarmerConfig,
    ) -> Result<ActionOutcome, ApiError>;
}

#[async_trait]
impl ObjectEvaluator for ActionCoordinator {
    async fn evaluate(
        &self,
        object: &FieldObject,
        config: &FarmerConfig,
    ) -> Result<ActionOutcome, ApiError> {
        ActionCoordinator::evaluate(self, object, config).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub batches: u32,
    pub objects: usize,
    pub launched: usize,
    pub halted: bool,
}

pub struct ZoneScanner {
    zones: Arc<ZoneTable>,
    kingdom: Arc<RwLock<KingdomState>>,
    evaluator: Arc<dyn ObjectEvaluator>,
    halt: Arc<HaltFlags>,
    progress: Arc<ScanProgress>,
    notifier: Arc<dyn NotificationSink>,
    cursor: Mutex<ZoneScanCursor>,
    state: watch::Sender<ScanState>,
    current_zones: StdRwLock<Vec<ZoneId>>,
}

impl ZoneScanner {
    pub fn new(
        zones: Arc<ZoneTable>,
        kingdom: Arc<RwLock<KingdomState>>,
        evaluator: Arc<dyn ObjectEvaluator>,
        halt: Arc<HaltFlags>,
        progress: Arc<ScanProgress>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let (state, _rx) = watch::channel(ScanState::Idle);
        Self {
            zones,
            kingdom,
            evaluator,
            halt,
            progress,
            notifier,
            cursor: Mutex::new(ZoneScanCursor::default()),
            state,
            current_zones: StdRwLock::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ScanState {
        *self.state.borrow()
    }

    /// Zones entered by the batch in flight; march objects are cached under them.
    pub fn current_zones(&self) -> Vec<ZoneId> {
        self.current_zones
            .read()
            .map(|zones| zones.clone())
            .unwrap_or_default()
    }

    fn set_current_zones(&self, zones: Vec<ZoneId>) {
        if let Ok(mut slot) = self.current_zones.write() {
            *slot = zones;
        }
    }

    fn set_state(&self, state: ScanState) {
        self.state.send_replace(state);
    }

    /// Drops the zone queue so the next pass ranks zones afresh.
    pub async fn reset(&self) {
        self.cursor.lock().await.clear();
        self.set_current_zones(Vec::new());
        self.set_state(ScanState::Idle);
    }

    pub async fn remaining_zones(&self) -> usize {
        self.cursor.lock().await.remaining()
    }

    async fn ranked_zones(&self, config: &FarmerConfig) -> Vec<ZoneId> {
        let Some(home) = self.kingdom.read().await.loc else {
            return Vec::new();
        };
        self.zones
            .rank_zones(home.x, home.y, config.scan.radius, &config.scan.allowed_areas)
    }

    /// Runs one pass of at most `grace_batches` enter/leave cycles.
    pub async fn run_pass<L: ZoneLink>(
        &self,
        link: &mut L,
        config: &FarmerConfig,
        cancel: &CancelToken,
    ) -> anyhow::Result<PassReport> {
        let mut report = PassReport::default();
        let mut cursor = self.cursor.lock().await;
        if cursor.is_exhausted() {
            let ranked = self.ranked_zones(config).await;
            info!(zones = ranked.len(), radius = config.scan.radius, "zone queue rebuilt");
            cursor.rebuild(ranked);
        }
        cursor.start_pass();

        let result = self
            .walk(&mut cursor, link, config, cancel, &mut report)
            .await;
        self.set_current_zones(Vec::new());
        self.set_state(ScanState::Draining);
        info!(
            batches = report.batches,
            objects = report.objects,
            launched = report.launched,
            halted = report.halted,
            remaining = cursor.remaining(),
            "scan pass finished"
        );
        self.set_state(ScanState::Idle);
        result.map(|()| report)
    }

    async fn walk<L: ZoneLink>(
        &self,
        cursor: &mut ZoneScanCursor,
        link: &mut L,
        config: &FarmerConfig,
        cancel: &CancelToken,
        report: &mut PassReport,
    ) -> anyhow::Result<()> {
        let timeout = config.scan.batch_timeout();
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if self.halt.quota_exceeded() {
                report.halted = true;
                return Ok(());
            }
            let Some(batch) = cursor.next_batch(config.scan.batch_size, config.scan.grace_batches)
            else {
                return Ok(());
            };

            self.set_current_zones(batch.clone());
            self.set_state(ScanState::Entering);
            link.enter(&batch).await?;
            self.set_state(ScanState::AwaitingBatch);
            let objects = link.next_objects(timeout).await?;
            self.progress.touch();
            report.batches += 1;
            report.objects += objects.len();

            self.set_state(ScanState::Processing);
            debug!(zones = ?batch, objects = objects.len(), "zone batch received");
            for object in &objects {
                if cancel.is_cancelled() || self.halt.quota_exceeded() {
                    break;
                }
                match self.evaluator.evaluate(object, config).await {
                    Ok(ActionOutcome::Launched(_)) => report.launched += 1,
                    Ok(ActionOutcome::Halted) => {
                        report.halted = true;
                        break;
                    }
                    Ok(ActionOutcome::Skipped(reason)) => self.report_skip(object, reason).await,
                    Err(error) if error.is_fatal() || error.is_session_invalid() => {
                        if let Err(leave_error) = link.leave(&batch).await {
                            warn!(error = %leave_error, "zone leave failed after session error");
                        }
                        return Err(error.into());
                    }
                    Err(error) => {
                        warn!(code = object.code, loc = %object.loc, error = %error, "object evaluation failed")
                    }
                }
            }
            link.leave(&batch).await?;
            self.set_current_zones(Vec::new());
        }
    }

    async fn report_skip(&self, object: &FieldObject, reason: SkipReason) {
        match reason {
            SkipReason::Disabled | SkipReason::NotTargeted | SkipReason::Unavailable => {}
            reason => {
                debug!(code = object.code, level = object.level, ?reason, "target skipped");
                self.notifier
                    .emit(
                        Notification::new(NotificationKind::ObjectFound, format!("{reason:?}"))
                            .with_target(object.code, object.level, object.loc),
                    )
                    .await;
            }
        }
    }
}
