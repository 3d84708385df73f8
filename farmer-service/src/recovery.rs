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
    future::Future,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use lok_common::account_id_from_token;
use rand::Rng;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::{
    api::{Credentials, GameApi},
    buffs::BuffBook,
    config::ConfigStore,
    error::ApiError,
    march::MarchCoordinator,
    notify::{Notification, NotificationKind, NotificationSink},
    state::KingdomState,
    token_store::TokenStore,
};

/// Re-runs the session bootstrap and restores everything that hangs off it.
pub struct RecoveryManager {
    api: Arc<dyn GameApi>,
    token_store: Arc<dyn TokenStore>,
    credentials: Option<Credentials>,
    bootstrap_token: Option<String>,
    kingdom: Arc<RwLock<KingdomState>>,
    march: Arc<MarchCoordinator>,
    buffs: Arc<BuffBook>,
    notifier: Arc<dyn NotificationSink>,
    config: ConfigStore,
    account_id: StdMutex<Option<String>>,
    zone_reset: AtomicBool,
    generation: AtomicU64,
    lock: Mutex<()>,
}

impl RecoveryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn GameApi>,
        token_store: Arc<dyn TokenStore>,
        credentials: Option<Credentials>,
        bootstrap_token: Option<String>,
        kingdom: Arc<RwLock<KingdomState>>,
        march: Arc<MarchCoordinator>,
        buffs: Arc<BuffBook>,
        notifier: Arc<dyn NotificationSink>,
        config: ConfigStore,
    ) -> Self {
        let account_id = bootstrap_token.as_deref().and_then(account_id_from_token);
        Self {
            api,
            token_store,
            credentials,
            bootstrap_token,
            kingdom,
            march,
            buffs,
            notifier,
            config,
            account_id: StdMutex::new(account_id),
            zone_reset: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            lock: Mutex::new(()),
        }
    }

    /// Number of completed bootstraps.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Returns true once after each bootstrap; the scanner rebuilds its cursor.
    pub fn take_zone_reset(&self) -> bool {
        self.zone_reset.swap(false, Ordering::SeqCst)
    }

    /// Full bootstrap. Callers queued behind a bootstrap that succeeded while
    /// they waited reuse its result instead of running another.
    pub async fn reinitialize(&self) -> bool {
        let seen = self.generation();
        let _guard = self.lock.lock().await;
        if self.generation() != seen {
            return true;
        }

        match self.bootstrap().await {
            Ok(()) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                info!(generation, "session reinitialized");
                if generation > 1 {
                    self.notifier
                        .emit(Notification::new(NotificationKind::Recovery, "reinitialized"))
                        .await;
                }
                true
            }
            Err(error) => {
                warn!(error = %format!("{error:#}"), "session reinitialize failed");
                self.notifier
                    .emit(
                        Notification::new(NotificationKind::Recovery, "failed")
                            .with_message(format!("{error:#}")),
                    )
                    .await;
                false
            }
        }
    }

    /// Runs `op`; on a session-invalid failure reinitializes and retries it
    /// exactly once.
    pub async fn with_recovery<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        match op().await {
            Err(error) if error.is_session_invalid() => {
                warn!(operation = label, error = %error, "session lost; recovering");
                if !self.reinitialize().await {
                    return Err(error);
                }
                tokio::time::sleep(self.retry_delay()).await;
                info!(operation = label, "retrying after recovery");
                op().await
            }
            other => other,
        }
    }

    fn retry_delay(&self) -> Duration {
        let config = self.config.current();
        let min = config.recovery.retry_delay_min_ms;
        let max = config.recovery.retry_delay_max_ms;
        if max <= min {
            return Duration::from_millis(min);
        }
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    async fn stored_token(&self) -> Option<String> {
        let account_id = self.account_id.lock().ok().and_then(|id| id.clone())?;
        match self.token_store.load(&account_id).await {
            Ok(token) => token,
            Err(error) => {
                warn!(account_id = %account_id, error = %format!("{error:#}"), "token store read failed");
                None
            }
        }
    }

    async fn login(&self) -> anyhow::Result<()> {
        let credentials = self
            .credentials
            .as_ref()
            .context("no usable token and no credentials configured")?;
        self.api.login(credentials).await.context("login failed")?;
        Ok(())
    }

    async fn bootstrap(&self) -> anyhow::Result<()> {
        let token = match self.stored_token().await {
            Some(token) => Some(token),
            None => match self.api.current_token().await {
                Some(token) => Some(token),
                None => self.bootstrap_token.clone(),
            },
        };
        match token {
            Some(token) => self.api.install_token(token).await,
            None => self.login().await?,
        }

        if let Err(error) = self.api.connect().await {
            if !(error.is_session_invalid() && self.credentials.is_some()) {
                return Err(error).context("auth/connect failed");
            }
            warn!(error = %error, "stored token rejected; logging in");
            self.login().await?;
            self.api.connect().await.context("auth/connect failed")?;
        }
        if let Some(token) = self.api.current_token().await {
            if let (Some(id), Ok(mut slot)) = (account_id_from_token(&token), self.account_id.lock()) {
                *slot = Some(id);
            }
        }

        let enter = self
            .api
            .kingdom_enter()
            .await
            .context("kingdom/enter failed")?;
        let state = KingdomState::from_enter(&enter)?;
        self.api
            .set_device_info()
            .await
            .context("auth/setDeviceInfo failed")?;

        let mut channels = vec![format!("w{}", state.world_id)];
        if let Some(alliance_id) = &state.alliance_id {
            channels.push(format!("a{alliance_id}"));
        }
        for channel in channels {
            if let Err(error) = self.api.chat_logs(&channel).await {
                warn!(channel = %channel, error = %error, "chat log restore failed");
            }
        }

        self.march
            .refresh_status()
            .await
            .context("march status refresh failed")?;
        self.march.reset_cache().await;

        info!(
            kingdom_id = %state.kingdom_id,
            world_id = state.world_id,
            level = state.level,
            "world entered"
        );
        *self.kingdom.write().await = state;
        self.buffs.reset().await;
        self.zone_reset.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::{
        api::testing::ScriptedApi, config::FarmerConfig, notify::testing::RecordingSink,
        token_store::testing::MemoryTokenStore,
    };

    pub struct Harness {
        pub api: Arc<ScriptedApi>,
        pub kingdom: Arc<RwLock<KingdomState>>,
        pub march: Arc<MarchCoordinator>,
        pub buffs: Arc<BuffBook>,
        pub sink: Arc<RecordingSink>,
        pub config: ConfigStore,
        pub recovery: Arc<RecoveryManager>,
    }

    /// Wires a recovery manager over a scripted backend with instant retries.
    pub fn harness(mut config: FarmerConfig, credentials: Option<Credentials>) -> Harness {
        config.recovery.retry_delay_min_ms = 0;
        config.recovery.retry_delay_max_ms = 0;
        config.scan.conflict_wait_ms = 0;
        let config = ConfigStore::new(config);
        let api = Arc::new(ScriptedApi::new());
        let kingdom = Arc::new(RwLock::new(KingdomState::default()));
        let march = Arc::new(MarchCoordinator::new(
            api.clone(),
            kingdom.clone(),
            config.clone(),
        ));
        let buffs = Arc::new(BuffBook::default());
        let sink = Arc::new(RecordingSink::default());
        let recovery = Arc::new(RecoveryManager::new(
            api.clone(),
            Arc::new(MemoryTokenStore::default()),
            credentials,
            Some("header.payload.sig".to_string()),
            kingdom.clone(),
            march.clone(),
            buffs.clone(),
            sink.clone(),
            config.clone(),
        ));
        Harness {
            api,
            kingdom,
            march,
            buffs,
            sink,
            config,
            recovery,
        }
    }
}
