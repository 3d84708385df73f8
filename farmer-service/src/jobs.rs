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

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use futures_util::future::{BoxFuture, FutureExt};
use rand::Rng;
use serde_json::{Value, json};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    api::GameApi,
    cancel::CancelToken,
    channel::ChannelControl,
    config::{ConfigStore, JobConfig},
    error::ApiError,
    march::MarchCoordinator,
    recovery::RecoveryManager,
    state::ScanProgress,
};

const KEEPALIVE_ENDPOINTS: [&str; 2] = ["kingdom/wall/info", "quest/main"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobId {
    KingdomChannel,
    ChatChannel,
    FieldScan,
    MarchStatus,
    BuffManagement,
    SkillManagement,
    RallyMonitor,
    Watchdog,
    Keepalive,
}

impl JobId {
    pub const ALL: [JobId; 9] = [
        JobId::KingdomChannel,
        JobId::ChatChannel,
        JobId::FieldScan,
        JobId::MarchStatus,
        JobId::BuffManagement,
        JobId::SkillManagement,
        JobId::RallyMonitor,
        JobId::Watchdog,
        JobId::Keepalive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobId::KingdomChannel => "kingdom_channel",
            JobId::ChatChannel => "chat_channel",
            JobId::FieldScan => "field_scan",
            JobId::MarchStatus => "march_status",
            JobId::BuffManagement => "buff_management",
            JobId::SkillManagement => "skill_management",
            JobId::RallyMonitor => "rally_monitor",
            JobId::Watchdog => "watchdog",
            JobId::Keepalive => "keepalive",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.as_str() == name.trim())
    }
}

pub type JobRunner = Arc<dyn Fn(CancelToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Maps job ids to their workers. Built once at startup.
#[derive(Default)]
pub struct JobRegistry {
    runners: HashMap<JobId, JobRunner>,
}

impl JobRegistry {
    pub fn register<F, Fut>(&mut self, id: JobId, run: F)
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.runners
            .insert(id, Arc::new(move |cancel| run(cancel).boxed()));
    }

    /// Resolves the configured job list. An empty list runs every registered
    /// job; unknown or unregistered names fail startup.
    pub fn select(&self, jobs: &[JobConfig]) -> anyhow::Result<Vec<JobId>> {
        if jobs.is_empty() {
            return Ok(JobId::ALL
                .into_iter()
                .filter(|id| self.runners.contains_key(id))
                .collect());
        }
        let mut selected = Vec::new();
        for job in jobs {
            let id = JobId::parse(&job.name)
                .ok_or_else(|| anyhow::anyhow!("unknown job `{}` in configuration", job.name))?;
            anyhow::ensure!(
                self.runners.contains_key(&id),
                "job `{}` has no registered worker",
                job.name
            );
            if job.enabled && !selected.contains(&id) {
                selected.push(id);
            } else if !job.enabled {
                info!(job = id.as_str(), "job disabled by configuration");
            }
        }
        Ok(selected)
    }

    pub fn spawn(
        &self,
        selected: &[JobId],
        recovery: Arc<RecoveryManager>,
        cancel: &CancelToken,
    ) -> Vec<(JobId, JoinHandle<()>)> {
        selected
            .iter()
            .filter_map(|id| self.runners.get(id).map(|runner| (*id, runner.clone())))
            .map(|(id, runner)| {
                let recovery = recovery.clone();
                let cancel = cancel.clone();
                info!(job = id.as_str(), "starting job");
                let handle = tokio::spawn(async move {
                    if let Err(error) = supervise(id, runner, recovery, cancel).await {
                        error!(job = id.as_str(), error = %format!("{error:#}"), "job stopped");
                    }
                });
                (id, handle)
            })
            .collect()
    }
}

/// Runs a job; after a failure reinitializes the session and restarts it once.
pub async fn supervise(
    id: JobId,
    runner: JobRunner,
    recovery: Arc<RecoveryManager>,
    cancel: CancelToken,
) -> anyhow::Result<()> {
    let error = match runner(cancel.clone()).await {
        Ok(()) => return Ok(()),
        Err(error) => error,
    };
    if cancel.is_cancelled() {
        return Ok(());
    }
    warn!(job = id.as_str(), error = %format!("{error:#}"), "job failed; reinitializing before restart");
    if !recovery.reinitialize().await {
        warn!(job = id.as_str(), "reinitialize failed; restarting anyway");
    }
    runner(cancel)
        .await
        .with_context(|| format!("job {} failed after restart", id.as_str()))
}

/// Restarts the field channel when the scanner stops making progress.
pub struct Watchdog {
    progress: Arc<ScanProgress>,
    field: ChannelControl,
    config: ConfigStore,
}

impl Watchdog {
    pub fn new(progress: Arc<ScanProgress>, field: ChannelControl, config: ConfigStore) -> Self {
        Self {
            progress,
            field,
            config,
        }
    }

    pub async fn run(&self, cancel: CancelToken) -> anyhow::Result<()> {
        loop {
            let check = Duration::from_secs(self.config.current().watchdog.check_secs.max(1));
            if !cancel.sleep(check).await {
                return Ok(());
            }
            self.check();
        }
    }

    /// Returns true when a restart was forced.
    pub fn check(&self) -> bool {
        let timeout_ms = self.config.current().watchdog.timeout_secs.saturating_mul(1_000);
        let idle_ms = self.progress.idle_for_ms();
        if idle_ms <= i64::try_from(timeout_ms).unwrap_or(i64::MAX) {
            return false;
        }
        warn!(idle_ms, "no scan progress; forcing field channel restart");
        self.progress.touch();
        self.field.force_restart();
        true
    }
}

/// Keeps the session warm with one cheap read per interval.
pub struct Keepalive {
    api: Arc<dyn GameApi>,
    recovery: Arc<RecoveryManager>,
    config: ConfigStore,
}

impl Keepalive {
    pub fn new(api: Arc<dyn GameApi>, recovery: Arc<RecoveryManager>, config: ConfigStore) -> Self {
        Self {
            api,
            recovery,
            config,
        }
    }

    pub async fn run(&self, cancel: CancelToken) -> anyhow::Result<()> {
        loop {
            let interval = Duration::from_secs(self.config.current().keepalive.interval_secs);
            if !cancel.sleep(interval).await {
                return Ok(());
            }
            match self.ping().await {
                Ok(endpoint) => debug!(endpoint, "keepalive ok"),
                Err(error) if error.is_fatal() => return Err(error.into()),
                Err(error) => warn!(error = %error, "keepalive failed"),
            }
        }
    }

    pub async fn ping(&self) -> Result<&'static str, ApiError> {
        let endpoint = KEEPALIVE_ENDPOINTS[rand::rng().random_range(0..KEEPALIVE_ENDPOINTS.len())];
        self.recovery
            .with_recovery("keepalive", || self.api.call(endpoint, json!({})))
            .await
            .map(|_: Value| endpoint)
    }
}

/// Refreshes the march limit and troop queue on a timer or when woken.
pub async fn run_march_status(
    march: Arc<MarchCoordinator>,
    recovery: Arc<RecoveryManager>,
    wake: Arc<Notify>,
    config: ConfigStore,
    cancel: CancelToken,
) -> anyhow::Result<()> {
    loop {
        let interval = Duration::from_secs(config.current().march_status.interval_secs.max(1));
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(interval) => {}
            _ = wake.notified() => debug!("march status refresh requested"),
        }
        match recovery
            .with_recovery("march_status", || march.refresh_status())
            .await
        {
            Ok(status) => debug!(
                queue = status.queue_len,
                limit = status.march_limit,
                "march status refreshed"
            ),
            Err(error) if error.is_fatal() => return Err(error.into()),
            Err(error) => warn!(error = %error, "march status refresh failed"),
        }
    }
}
