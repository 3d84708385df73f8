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

mod actions;
mod api;
mod buffs;
mod cancel;
mod channel;
mod chat;
mod config;
mod error;
mod field;
mod jobs;
mod kingdom;
mod march;
mod notify;
mod rally;
mod recovery;
mod retry;
mod scanner;
mod session;
mod state;
mod token_store;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use lok_common::ZoneTable;
use serde_json::{Value, json};
use tokio::sync::{Notify, RwLock};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    actions::ActionCoordinator,
    api::{Credentials, GameApi},
    buffs::{BuffBook, BuffScheduler, SkillScheduler},
    cancel::CancelSource,
    channel::{ChannelControl, ChannelKind, ChannelManager},
    chat::ChatChannel,
    config::{ConfigStore, ServiceSettings, farmer_config_path, load_farmer_config},
    field::FieldChannel,
    jobs::{JobId, JobRegistry, Keepalive, Watchdog, run_march_status},
    kingdom::{KingdomChannel, StateObserver},
    march::MarchCoordinator,
    notify::{FanoutSink, NotificationSink, TracingSink, WebhookSink},
    rally::RallyCoordinator,
    recovery::RecoveryManager,
    scanner::ZoneScanner,
    session::SessionClient,
    state::{HaltFlags, KingdomState, ScanProgress},
    token_store::{FileTokenStore, TokenStore},
};

#[derive(Clone)]
struct AppState {
    march: Arc<MarchCoordinator>,
    scanner: Arc<ZoneScanner>,
    recovery: Arc<RecoveryManager>,
    halt: Arc<HaltFlags>,
    progress: Arc<ScanProgress>,
    session: Arc<SessionClient>,
    config: ConfigStore,
    channels: Vec<(ChannelKind, ChannelControl)>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "farmer_service=debug,lok_common=info,tower_http=info".to_string()
        }))
        .init();

    let settings = ServiceSettings::from_env();
    let config = ConfigStore::new(load_farmer_config());
    let snapshot = config.current();
    let http = reqwest::Client::new();

    let token_store: Arc<dyn TokenStore> = Arc::new(FileTokenStore::new(&settings.token_dir));
    let session = Arc::new(SessionClient::new(
        http.clone(),
        settings.api_base_url.clone(),
        settings.auth_base_url.clone(),
        snapshot.retry.transport.clone(),
        token_store.clone(),
    ));
    let api: Arc<dyn GameApi> = session.clone();

    let mut sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(TracingSink)];
    if let Some(url) = settings.notify_webhook_url.clone() {
        info!(url = %url, "webhook notifications enabled");
        sinks.push(Arc::new(WebhookSink::new(http.clone(), url)));
    }
    let notifier: Arc<dyn NotificationSink> = Arc::new(FanoutSink::new(sinks));

    let kingdom = Arc::new(RwLock::new(KingdomState::default()));
    let halt = Arc::new(HaltFlags::default());
    let progress = Arc::new(ScanProgress::default());
    let buff_book = Arc::new(BuffBook::default());
    let rally_wake = Arc::new(Notify::new());
    let march_wake = Arc::new(Notify::new());
    session.set_observer(Arc::new(StateObserver::new(
        kingdom.clone(),
        halt.clone(),
        notifier.clone(),
    )));

    let credentials = match (settings.email.clone(), settings.password.clone()) {
        (Some(email), Some(password)) => Some(Credentials { email, password }),
        _ => None,
    };
    if credentials.is_none() && settings.token.is_none() {
        warn!("neither LOK_TOKEN nor LOK_EMAIL/LOK_PASSWORD set; relying on a stored token");
    }

    let march = Arc::new(MarchCoordinator::new(
        api.clone(),
        kingdom.clone(),
        config.clone(),
    ));
    let recovery = Arc::new(RecoveryManager::new(
        api.clone(),
        token_store,
        credentials,
        settings.token.clone(),
        kingdom.clone(),
        march.clone(),
        buff_book.clone(),
        notifier.clone(),
        config.clone(),
    ));
    anyhow::ensure!(
        recovery.reinitialize().await,
        "initial session bootstrap failed"
    );

    let rally = Arc::new(RallyCoordinator::new(
        api.clone(),
        kingdom.clone(),
        march.clone(),
        recovery.clone(),
        notifier.clone(),
        config.clone(),
        rally_wake.clone(),
    ));
    let actions = Arc::new(ActionCoordinator::new(
        api.clone(),
        kingdom.clone(),
        march.clone(),
        rally.clone(),
        recovery.clone(),
        halt.clone(),
        notifier.clone(),
    ));
    let scanner = Arc::new(ZoneScanner::new(
        Arc::new(ZoneTable::build()),
        kingdom.clone(),
        actions,
        halt.clone(),
        progress.clone(),
        notifier.clone(),
    ));

    let channel_policy = snapshot.retry.channel.clone();
    let kingdom_control = ChannelControl::default();
    let chat_control = ChannelControl::default();
    let field_control = ChannelControl::default();
    let kingdom_channel = Arc::new(ChannelManager::new(
        Arc::new(KingdomChannel::new(
            api.clone(),
            kingdom.clone(),
            buff_book.clone(),
            notifier.clone(),
            rally_wake,
            march_wake.clone(),
        )),
        channel_policy.clone(),
        kingdom_control.clone(),
    ));
    let chat_channel = Arc::new(ChannelManager::new(
        Arc::new(ChatChannel::new(
            api.clone(),
            kingdom.clone(),
            config.clone(),
            notifier.clone(),
        )),
        channel_policy.clone(),
        chat_control.clone(),
    ));
    let field_channel = Arc::new(ChannelManager::new(
        Arc::new(FieldChannel::new(
            api.clone(),
            kingdom.clone(),
            march.clone(),
            scanner.clone(),
            recovery.clone(),
            halt.clone(),
            config.clone(),
        )),
        channel_policy,
        field_control.clone(),
    ));

    let buff_scheduler = Arc::new(BuffScheduler::new(
        api.clone(),
        kingdom.clone(),
        buff_book,
        recovery.clone(),
        config.clone(),
    ));
    let skill_scheduler = Arc::new(SkillScheduler::new(
        api.clone(),
        recovery.clone(),
        config.clone(),
    ));
    let watchdog = Arc::new(Watchdog::new(
        progress.clone(),
        field_control.clone(),
        config.clone(),
    ));
    let keepalive = Arc::new(Keepalive::new(api.clone(), recovery.clone(), config.clone()));

    let mut registry = JobRegistry::default();
    registry.register(JobId::KingdomChannel, move |cancel| {
        let manager = kingdom_channel.clone();
        async move { manager.run(cancel).await }
    });
    registry.register(JobId::ChatChannel, move |cancel| {
        let manager = chat_channel.clone();
        async move { manager.run(cancel).await }
    });
    registry.register(JobId::FieldScan, move |cancel| {
        let manager = field_channel.clone();
        async move { manager.run(cancel).await }
    });
    {
        let march = march.clone();
        let recovery = recovery.clone();
        let config = config.clone();
        registry.register(JobId::MarchStatus, move |cancel| {
            run_march_status(
                march.clone(),
                recovery.clone(),
                march_wake.clone(),
                config.clone(),
                cancel,
            )
        });
    }
    registry.register(JobId::BuffManagement, move |cancel| {
        let scheduler = buff_scheduler.clone();
        async move { scheduler.run(cancel).await }
    });
    registry.register(JobId::SkillManagement, move |cancel| {
        let scheduler = skill_scheduler.clone();
        async move { scheduler.run(cancel).await }
    });
    registry.register(JobId::RallyMonitor, move |cancel| {
        let rally = rally.clone();
        async move { rally.run(cancel).await }
    });
    registry.register(JobId::Watchdog, move |cancel| {
        let watchdog = watchdog.clone();
        async move { watchdog.run(cancel).await }
    });
    registry.register(JobId::Keepalive, move |cancel| {
        let keepalive = keepalive.clone();
        async move { keepalive.run(cancel).await }
    });

    let selected = registry
        .select(&snapshot.jobs)
        .context("invalid job configuration")?;
    let cancel = CancelSource::new();
    let handles = registry.spawn(&selected, recovery.clone(), &cancel.token());
    info!(jobs = handles.len(), "farmer jobs started");

    let state = AppState {
        march,
        scanner,
        recovery,
        halt,
        progress,
        session,
        config: config.clone(),
        channels: vec![
            (ChannelKind::Kingdom, kingdom_control),
            (ChannelKind::Chat, chat_control),
            (ChannelKind::Field, field_control),
        ],
    };
    let app = build_router(state);
    let bind_addr = parse_bind_addr(&settings.bind_addr)?;
    info!(%bind_addr, "farmer-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(error = %error, "failed to listen for ctrl-c");
            }
        })
        .await?;

    info!("farmer-service shutting down");
    cancel.cancel();
    for (id, handle) in handles {
        if let Err(error) = handle.await {
            warn!(job = id.as_str(), error = %error, "job task ended abnormally");
        }
    }
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/config/reload", post(reload_config))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn reload_config(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let path = farmer_config_path();
    match state.config.reload_from(&path) {
        Ok(snapshot) => {
            info!(path = %path.display(), "farmer config reloaded");
            (
                StatusCode::OK,
                Json(json!({"ok": true, "jobs": snapshot.jobs.len()})),
            )
        }
        Err(error) => {
            warn!(error = %format!("{error:#}"), "farmer config reload rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"ok": false, "error": format!("{error:#}")})),
            )
        }
    }
}

fn parse_bind_addr(value: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .context(format!("invalid FARMER_SERVICE_BIND `{value}`"))
}

async fn health() -> Json<Value> {
    Json(json!({"ok": true, "service": "farmer-service"}))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let channels: serde_json::Map<String, Value> = state
        .channels
        .iter()
        .map(|(kind, control)| (kind.as_str().to_string(), json!(control.state())))
        .collect();
    let since_last_request_ms = state
        .session
        .last_request_at()
        .await
        .map(|at| at.elapsed().as_millis() as u64);
    Json(json!({
        "march": state.march.status().await,
        "scan_state": state.scanner.state(),
        "remaining_zones": state.scanner.remaining_zones().await,
        "last_progress_ms": state.progress.last_progress_ms(),
        "quota_exceeded": state.halt.quota_exceeded(),
        "session_generation": state.recovery.generation(),
        "since_last_request_ms": since_last_request_ms,
        "channels": channels,
    }))
}
