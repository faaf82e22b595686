use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use client_core::{
    AuthFlow, AuthOptions, Dispatcher, HttpTransport, HttpTransportConfig, LiveContext,
    RecoveryEvent, SessionLoop, SessionOptions, SignUpPolicy, UpdatesConfig,
};
use shared::protocol::{EventKind, UpdateEnvelope, UpdatePayload};
use storage::{SessionStore, Storage};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod terminal;
mod watch;

use config::{load_settings, PartialSettings, Settings};
use terminal::TerminalCredentials;
use watch::{MembershipWatcher, Roster};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "bot.toml")]
    config: PathBuf,
    /// Phone number to log in with; prompted for when omitted.
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    target_chat: Option<String>,
    #[arg(long)]
    announce: Option<String>,
    #[arg(long)]
    watch_username: Option<String>,
    /// Drop stored update positions and start from the server's current state.
    #[arg(long)]
    forget_state: bool,
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn overrides(&self) -> PartialSettings {
        PartialSettings {
            server_url: self.server_url.clone(),
            database_url: self.database_url.clone(),
            target_chat: self.target_chat.clone(),
            announce_text: self.announce.clone(),
            watch_username: self.watch_username.clone(),
            forget_state: self.forget_state.then_some(true),
            log_level: self.log_level.clone(),
            ..PartialSettings::default()
        }
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args.config, args.overrides())?;
    init_tracing(&settings.log_level);
    info!(server_url = %settings.server_url, database_url = %settings.database_url, "starting bot");

    let storage = Arc::new(Storage::new(&settings.database_url).await?);
    storage.health_check().await?;
    let transport = HttpTransport::connect(
        HttpTransportConfig::new(&settings.server_url, settings.app_id, &settings.app_hash),
        Arc::clone(&storage) as Arc<dyn SessionStore>,
    )
    .await?;

    let auth = Arc::new(AuthFlow::new(
        transport.clone(),
        Arc::new(TerminalCredentials::new(args.phone.clone())),
        SignUpPolicy::Reject,
        AuthOptions::default(),
    ));
    let dispatcher = Arc::new(Dispatcher::new());
    dispatcher.register_handler(EventKind::NewMessage, log_new_message);

    let session = SessionLoop::new(
        auth,
        transport.clone(),
        transport,
        storage,
        Arc::clone(&dispatcher),
        UpdatesConfig::default(),
        SessionOptions {
            forget_state: settings.forget_state,
            ..SessionOptions::default()
        },
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("interrupt received; shutting down"),
                Err(err) => error!(error = %err, "failed to listen for interrupt"),
            }
            cancel.cancel();
        }
    });

    let bot = Bot {
        settings,
        dispatcher,
    };
    session.run(&cancel, |ctx| bot.go_live(ctx)).await?;
    Ok(())
}

async fn log_new_message(update: UpdateEnvelope) -> Result<()> {
    if let UpdatePayload::NewMessage { message } = &update.payload {
        info!(
            chat_id = message.chat_id.0,
            sender_id = message.sender_id.map(|id| id.0),
            message_id = message.message_id.0,
            text = %message.text,
            "new message"
        );
    }
    Ok(())
}

struct Bot {
    settings: Settings,
    dispatcher: Arc<Dispatcher>,
}

impl Bot {
    async fn go_live(self, ctx: LiveContext) -> Result<()> {
        info!(
            user_id = ctx.session.user_id.0,
            username = ctx.session.username.as_deref().unwrap_or(""),
            "bot is live"
        );
        tokio::spawn(report_recovery(
            ctx.coordinator.subscribe_events(),
            ctx.cancel.clone(),
        ));

        let Some(title) = self.settings.target_chat.as_deref() else {
            info!("no target chat configured; only logging updates");
            return Ok(());
        };
        let chat = ctx.messenger.find_chat_by_title(title).await?;
        info!(chat_id = chat.chat_id.0, title = %chat.title, "target chat resolved");

        if let Some(text) = self.settings.announce_text.as_deref() {
            let message_id = ctx.messenger.send_text(chat.chat_id, text).await?;
            info!(message_id = message_id.0, "announcement sent");
        }

        if let Some(username) = self.settings.watch_username.clone() {
            let watcher = Arc::new(MembershipWatcher::new(
                Arc::clone(&ctx.messenger) as Arc<dyn Roster>,
                chat.chat_id,
                username,
                self.settings.watch_min,
                self.settings.watch_max,
            ));
            let removal_watcher = Arc::clone(&watcher);
            self.dispatcher.register_handler(
                EventKind::ParticipantRemoved,
                move |update: UpdateEnvelope| {
                    let watcher = Arc::clone(&removal_watcher);
                    async move {
                        if let UpdatePayload::ParticipantRemoved { chat_id, .. } = update.payload {
                            if chat_id == watcher.chat_id() {
                                watcher.wake();
                            }
                        }
                        Ok::<(), anyhow::Error>(())
                    }
                },
            );
            tokio::spawn(watcher.run(ctx.cancel.clone()));
        }
        Ok(())
    }
}

async fn report_recovery(
    mut events: broadcast::Receiver<RecoveryEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Ok(RecoveryEvent::Unrecoverable(failure)) => {
                error!(channel_id = failure.channel_id.0, reason = %failure.reason, "channel abandoned")
            }
            Ok(RecoveryEvent::PendingOverflow {
                channel_id,
                dropped_pts,
            }) => warn!(channel_id = channel_id.0, dropped_pts, "updates dropped while recovering"),
            Ok(RecoveryEvent::Recovered { channel_id, pts, fetched }) => {
                info!(channel_id = channel_id.0, pts, fetched, "channel caught up")
            }
            Ok(RecoveryEvent::Resynced { channel_id, pts }) => {
                info!(channel_id = channel_id.0, pts, "channel resynced")
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "recovery event reporter lagged")
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}
