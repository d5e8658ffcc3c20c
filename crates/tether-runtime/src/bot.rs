//! Connection controller.
//!
//! A [`Bot`] owns the connection of a single account. It drives the
//! transport through connect, log-on, reconnect and stop, keeps the web
//! session in step with the network session and republishes everything of
//! interest on a broadcast feed of [`BotEvent`]s.
//!
//! ```text
//! Disconnected ─start─▶ Connecting ─connected─▶ ConnectedUnauthenticated
//!      ▲                    ▲                           │ log-on result
//!      │                    └──────── reconnect ────────┤
//!      └──── Disconnecting ◀──── stop / permanent ──────┴─▶ LoggedOn
//! ```
//!
//! Inbound transport events are drained by a message pump that runs while
//! the bot is running or still connected. Two timers watch the connection:
//! a heartbeat that forces a reconnect once keepalives keep failing, and a
//! connection-failure timer that restarts the bot when a connect attempt
//! never reaches a log-on result.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, trace, warn};

use tether_core::{
    AccountFlags, AccountId, ArtifactStore, CodeKind, ConnectionState, Credentials, InboundMessage,
    LOGIN_ID, LogOnDetails, LoggedOn, LoginResult, MAX_TRIES, MachineAuthResponse,
    MachineAuthUpdate, PersonaState, ProtocolEvent, ProtocolMessageHandler, Transport,
    TransportError, TransportEvent,
};

use crate::config::BotConfig;
use crate::context::RuntimeContext;
use crate::error::RuntimeResult;
use crate::limiter::LOGIN_COOLDOWN;
use crate::logging::bot_span;
use crate::session::{SessionOwner, WebSession, build_browser};

/// Tick of the message pump.
const CALLBACK_SLEEP: Duration = Duration::from_millis(500);

/// Pause before reconnecting after a transient login failure.
const TRANSIENT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

const HEARTBEAT_PERIOD: Duration = Duration::from_secs(60);

/// Marks the heartbeat as tripped until a keepalive succeeds again.
const HEARTBEAT_TRIPPED: u8 = u8::MAX;

const EVENT_CAPACITY: usize = 64;

/// Something a bot owner may want to react to.
#[derive(Debug, Clone)]
pub enum BotEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    /// The service asked for a one-time code. The bot waits for
    /// [`Bot::submit_code`].
    CredentialNeeded(CodeKind),
    LoggedOn {
        account_id: AccountId,
        vanity_url: Option<String>,
    },
    Protocol(ProtocolEvent),
    /// The bot gave up. `result` is `None` when the connection never produced
    /// a log-on result.
    PermanentFailure { result: Option<LoginResult> },
    Stopped,
}

#[derive(Debug, Default)]
struct BotState {
    connection: ConnectionState,
    credentials: Credentials,
    account_id: AccountId,
    account_flags: AccountFlags,
    last_login_result: LoginResult,
    reconnect_on_user_initiated: bool,
    pending_challenge: Option<CodeKind>,
    playing_blocked: bool,
    library_locked: bool,
}

/// Connection controller of one account.
pub struct Bot {
    name: String,
    config: BotConfig,
    context: Arc<RuntimeContext>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn ArtifactStore>,
    web: Arc<WebSession>,
    protocol: ProtocolMessageHandler,
    events: broadcast::Sender<BotEvent>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    state: Mutex<BotState>,
    keep_running: AtomicBool,
    heartbeat_failures: AtomicU8,
    failure_timer: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<CancellationToken>>,
    this: Weak<Bot>,
}

impl Bot {
    /// Creates a stopped bot. Takes the transport's inbound event feed.
    pub fn new(
        config: BotConfig,
        context: Arc<RuntimeContext>,
        transport: Arc<dyn Transport>,
        store: Arc<dyn ArtifactStore>,
    ) -> RuntimeResult<Arc<Self>> {
        let browser = build_browser(&context)?;
        let inbound = transport
            .take_event_receiver()
            .ok_or(TransportError::EventFeedTaken)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Arc::new_cyclic(|this: &Weak<Self>| {
            let owner: Weak<dyn SessionOwner> = this.clone();
            let web = WebSession::new(config.name.clone(), context.clone(), browser, owner);

            Self {
                name: config.name.clone(),
                state: Mutex::new(BotState {
                    credentials: config.credentials(),
                    ..Default::default()
                }),
                config,
                context,
                transport,
                store,
                web,
                protocol: ProtocolMessageHandler::new(),
                events,
                inbound: tokio::sync::Mutex::new(inbound),
                keep_running: AtomicBool::new(false),
                heartbeat_failures: AtomicU8::new(0),
                failure_timer: Mutex::new(None),
                heartbeat: Mutex::new(None),
                this: this.clone(),
            }
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BotConfig {
        &self.config
    }

    pub fn web(&self) -> &Arc<WebSession> {
        &self.web
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().connection
    }

    pub fn is_running(&self) -> bool {
        self.keep_running.load(Ordering::SeqCst)
    }

    /// Server-assigned identity, once logged on.
    pub fn account_id(&self) -> Option<AccountId> {
        let state = self.state.lock();
        (state.connection == ConnectionState::LoggedOn).then_some(state.account_id)
    }

    pub fn account_flags(&self) -> AccountFlags {
        self.state.lock().account_flags
    }

    pub fn is_playing_blocked(&self) -> bool {
        self.state.lock().playing_blocked
    }

    /// Whether another account is currently using this account's library.
    pub fn is_library_locked(&self) -> bool {
        self.state.lock().library_locked
    }

    /// The code the bot is waiting for, if any.
    pub fn pending_challenge(&self) -> Option<CodeKind> {
        self.state.lock().pending_challenge
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.events.subscribe()
    }

    fn span(&self) -> Span {
        bot_span(&self.name)
    }

    fn emit(&self, event: BotEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = std::mem::replace(&mut self.state.lock().connection, new_state);
        if old_state == new_state {
            return;
        }
        debug!(
            bot = %self.name,
            old_state = %old_state,
            new_state = %new_state,
            "Bot state changed"
        );
        self.emit(BotEvent::StateChanged {
            old: old_state,
            new: new_state,
        });
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the message pump and the heartbeat and connects.
    pub async fn start(self: &Arc<Self>) {
        if self.keep_running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(bot = %self.name, "Starting");

        let token = CancellationToken::new();
        if let Some(previous) = self.heartbeat.lock().replace(token.clone()) {
            previous.cancel();
        }

        tokio::spawn(self.clone().handle_events().instrument(self.span()));
        tokio::spawn(self.clone().heartbeat_loop(token).instrument(self.span()));

        self.connect(false).await;
    }

    /// Stops the bot and disconnects. Timers are disarmed.
    pub async fn stop(&self) {
        if !self.keep_running.swap(false, Ordering::SeqCst) {
            return;
        }

        info!(bot = %self.name, "Stopping");

        if let Some(token) = self.heartbeat.lock().take() {
            token.cancel();
        }
        self.stop_failure_timer();

        if self.transport.is_connected() {
            self.disconnect().await;
        } else {
            self.set_state(ConnectionState::Disconnected);
        }

        self.emit(BotEvent::Stopped);
    }

    /// Tears the bot down and starts it again from scratch.
    pub async fn restart(self: &Arc<Self>) {
        self.stop().await;

        // The previous pump exits once the transport reports the disconnect.
        let _ = timeout(self.context.global().connection_timeout(), self.inbound.lock()).await;

        {
            let mut state = self.state.lock();
            state.credentials.clear_codes();
            state.pending_challenge = None;
            state.last_login_result = LoginResult::Invalid;
        }

        self.start().await;
    }

    /// Supplies (or with `None`, declines) the code the bot asked for.
    ///
    /// Returns `false` when the bot is not waiting for a code of `kind`.
    pub async fn submit_code(self: &Arc<Self>, kind: CodeKind, code: Option<String>) -> bool {
        let accepted = {
            let mut state = self.state.lock();
            if state.pending_challenge == Some(kind) {
                state.pending_challenge = None;
                if let Some(code) = &code {
                    state.credentials.set_code(kind, code.clone());
                }
                true
            } else {
                false
            }
        };

        if !accepted {
            warn!(bot = %self.name, kind = %kind, "Not waiting for this code");
            return false;
        }

        if code.is_none() {
            info!(bot = %self.name, kind = %kind, "Code declined");
            self.stop().await;
            return true;
        }

        info!(bot = %self.name, kind = %kind, "Code received, reconnecting");
        let bot = self.clone();
        tokio::spawn(async move { bot.connect(false).await }.instrument(self.span()));
        true
    }

    async fn connect(&self, force: bool) {
        if !force && (!self.is_running() || self.transport.is_connected()) {
            return;
        }

        self.context.login_limiter().limit_login().await;

        if !force && (!self.is_running() || self.transport.is_connected()) {
            return;
        }

        info!(bot = %self.name, "Connecting");
        self.set_state(ConnectionState::Connecting);
        self.arm_failure_timer();

        if let Err(e) = self.transport.connect().await {
            warn!(bot = %self.name, error = %e, "Failed to connect");
        }
    }

    async fn disconnect(&self) {
        info!(bot = %self.name, "Disconnecting");
        self.set_state(ConnectionState::Disconnecting);
        self.transport.disconnect().await;
    }

    /// Drops the current connection and lets the disconnect handler connect
    /// again, or connects right away when nothing is up.
    async fn reconnect(&self) {
        if !self.is_running() {
            return;
        }

        if self.transport.is_connected() {
            self.state.lock().reconnect_on_user_initiated = true;
            self.disconnect().await;
        } else {
            self.connect(true).await;
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    fn arm_failure_timer(&self) {
        let mut timer = self.failure_timer.lock();
        if timer.is_some() {
            return;
        }

        let minutes = self.context.global().connection_timeout_secs.div_ceil(30);
        let delay = Duration::from_secs(60 * minutes);
        let this = self.this.clone();

        *timer = Some(tokio::spawn(
            async move {
                sleep(delay).await;
                if let Some(bot) = this.upgrade() {
                    bot.on_connection_failure().await;
                }
            }
            .instrument(self.span()),
        ));
    }

    fn stop_failure_timer(&self) {
        if let Some(timer) = self.failure_timer.lock().take() {
            timer.abort();
        }
    }

    async fn on_connection_failure(self: Arc<Self>) {
        // Detach our own handle so stopping does not abort this task.
        drop(self.failure_timer.lock().take());

        if !self.is_running() {
            return;
        }

        error!(bot = %self.name, "Connection failed permanently, restarting");
        self.emit(BotEvent::PermanentFailure { result: None });
        self.restart().await;
    }

    fn heartbeat_threshold(&self) -> u8 {
        let failures = self.context.global().connection_timeout_secs.div_ceil(10);
        u8::try_from(failures)
            .unwrap_or(HEARTBEAT_TRIPPED - 1)
            .clamp(1, HEARTBEAT_TRIPPED - 1)
    }

    async fn heartbeat_loop(self: Arc<Self>, token: CancellationToken) {
        let first = Instant::now() + HEARTBEAT_PERIOD + self.context.login_limiter().delay();
        let mut ticker = interval_at(first, HEARTBEAT_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.heartbeat().await,
            }
        }
    }

    async fn heartbeat(self: &Arc<Self>) {
        let tripped = || {
            !self.is_running()
                || !self.is_connected_and_logged_on()
                || self.heartbeat_failures.load(Ordering::SeqCst) == HEARTBEAT_TRIPPED
        };
        if tripped() {
            return;
        }

        let connection_timeout = self.context.global().connection_timeout();
        let result = if self.protocol.last_packet_received().elapsed() > connection_timeout {
            let account_id = self.state.lock().account_id;
            timeout(
                connection_timeout,
                self.transport.request_profile_info(account_id),
            )
            .await
            .unwrap_or(Err(TransportError::Timeout))
        } else {
            Ok(())
        };

        match result {
            Ok(()) => self.heartbeat_failures.store(0, Ordering::SeqCst),
            Err(e) => {
                debug!(bot = %self.name, error = %e, "Keepalive failed");
                if tripped() {
                    return;
                }

                let failures = self.heartbeat_failures.load(Ordering::SeqCst) + 1;
                if failures < self.heartbeat_threshold() {
                    self.heartbeat_failures.store(failures, Ordering::SeqCst);
                    return;
                }

                self.heartbeat_failures.store(HEARTBEAT_TRIPPED, Ordering::SeqCst);
                warn!(bot = %self.name, failures, "Connection lost, reconnecting");

                let bot = self.clone();
                tokio::spawn(async move { bot.reconnect().await }.in_current_span());
            }
        }
    }

    // =========================================================================
    // Message Pump
    // =========================================================================

    async fn handle_events(self: Arc<Self>) {
        let Ok(mut inbound) = self.inbound.try_lock() else {
            debug!(bot = %self.name, "Event pump already running");
            return;
        };

        trace!(bot = %self.name, "Event pump started");

        while self.is_running() || self.transport.is_connected() {
            match timeout(CALLBACK_SLEEP, inbound.recv()).await {
                Ok(Some(event)) => self.dispatch(event).await,
                Ok(None) => {
                    warn!(bot = %self.name, "Transport event feed closed");
                    break;
                }
                Err(_) => {}
            }
        }

        while let Ok(event) = inbound.try_recv() {
            self.dispatch(event).await;
        }

        trace!(bot = %self.name, "Event pump stopped");
    }

    async fn dispatch(self: &Arc<Self>, event: TransportEvent) {
        self.protocol.record_traffic();

        match event {
            TransportEvent::Connected => {
                tokio::spawn(self.clone().on_connected().in_current_span());
            }
            TransportEvent::Disconnected { user_initiated } => {
                tokio::spawn(self.clone().on_disconnected(user_initiated).in_current_span());
            }
            TransportEvent::LoggedOn(logged_on) => {
                tokio::spawn(self.clone().on_logged_on(logged_on).in_current_span());
            }
            TransportEvent::LoginKey { key } => self.on_login_key(key).await,
            TransportEvent::MachineAuth(update) => self.on_machine_auth(update).await,
            TransportEvent::Message(message) => self.on_message(&message),
        }
    }

    // =========================================================================
    // Connection Events
    // =========================================================================

    async fn on_connected(self: Arc<Self>) {
        self.heartbeat_failures.store(0, Ordering::SeqCst);
        self.state.lock().reconnect_on_user_initiated = false;
        self.stop_failure_timer();

        info!(bot = %self.name, "Connected");

        if !self.is_running() {
            self.disconnect().await;
            return;
        }

        self.set_state(ConnectionState::ConnectedUnauthenticated);

        let sentry_file_hash = match self.store.read_sentry().await {
            Ok(sentry) => sentry.map(|bytes| Sha1::digest(&bytes).to_vec()),
            Err(e) => {
                warn!(bot = %self.name, error = %e, "Unreadable sentry file, deleting it");
                if let Err(e) = self.store.delete_sentry().await {
                    warn!(bot = %self.name, error = %e, "Failed to delete sentry file");
                }
                None
            }
        };

        let (credentials, has_pending_code, auth_code, two_factor_code) = {
            let mut state = self.state.lock();
            let has_pending_code = state.credentials.has_pending_code();
            let (auth_code, two_factor_code) = state.credentials.take_codes();
            (
                state.credentials.clone(),
                has_pending_code,
                auth_code,
                two_factor_code,
            )
        };

        let password = self
            .config
            .password_format
            .decode(&credentials.password)
            .unwrap_or_else(|| {
                warn!(bot = %self.name, "Password cannot be decoded, ignoring it");
                String::new()
            });

        let login_key = if !self.config.use_login_keys {
            if self.store.login_key().await.is_some()
                && let Err(e) = self.store.set_login_key(None).await
            {
                warn!(bot = %self.name, error = %e, "Failed to remove login key");
            }
            None
        } else if password.is_empty() || !has_pending_code {
            self.store.login_key().await
        } else {
            None
        };

        let details = LogOnDetails {
            username: strip_non_ascii(&credentials.login),
            password: if login_key.is_some() {
                String::new()
            } else {
                strip_non_ascii(&password)
            },
            login_key,
            auth_code,
            two_factor_code,
            sentry_file_hash,
            cell_id: self.store.cell_id().await,
            login_id: LOGIN_ID,
            should_remember_password: self.config.use_login_keys,
        };

        info!(bot = %self.name, "Logging in");
        self.arm_failure_timer();

        if let Err(e) = self.transport.log_on(details).await {
            warn!(bot = %self.name, error = %e, "Failed to submit log-on");
        }
    }

    async fn on_disconnected(self: Arc<Self>, user_initiated: bool) {
        let (last_result, reconnect_on_user_initiated, pending_challenge) = {
            let mut state = self.state.lock();
            state.playing_blocked = false;
            state.library_locked = false;
            (
                std::mem::take(&mut state.last_login_result),
                state.reconnect_on_user_initiated,
                state.pending_challenge,
            )
        };
        self.heartbeat_failures.store(0, Ordering::SeqCst);
        self.stop_failure_timer();
        self.set_state(ConnectionState::Disconnected);

        info!(bot = %self.name, user_initiated, last_result = %last_result, "Disconnected");

        self.web.on_disconnected().await;

        if user_initiated && !reconnect_on_user_initiated {
            return;
        }

        if let Some(kind) = pending_challenge {
            info!(bot = %self.name, kind = %kind, "Waiting for code before reconnecting");
            return;
        }

        let has_login_key = self.store.login_key().await.is_some();
        match last_result {
            result if result.is_permanent(has_login_key) => return,
            LoginResult::Invalid => self.state.lock().credentials.clear_codes(),
            LoginResult::InvalidPassword => {
                if let Err(e) = self.store.set_login_key(None).await {
                    warn!(bot = %self.name, error = %e, "Failed to remove login key");
                }
                info!(bot = %self.name, "Removed expired login key");
            }
            result if result.is_transient() => sleep(TRANSIENT_RECONNECT_DELAY).await,
            LoginResult::RateLimitExceeded => {
                info!(
                    bot = %self.name,
                    minutes = LOGIN_COOLDOWN.as_secs() / 60,
                    "Rate limited, holding login cooldown"
                );
                self.context
                    .login_limiter()
                    .hold_cooldown(
                        LOGIN_COOLDOWN,
                        Duration::from_millis(1000 * u64::from(MAX_TRIES)),
                    )
                    .await;
            }
            _ => {}
        }

        if !self.is_running() || self.transport.is_connected() {
            return;
        }

        info!(bot = %self.name, "Reconnecting");
        self.connect(false).await;
    }

    async fn on_logged_on(self: Arc<Self>, logged_on: LoggedOn) {
        let result = logged_on.result;
        {
            let mut state = self.state.lock();
            state.credentials.clear_codes();
            state.last_login_result = result;
        }
        self.heartbeat_failures.store(0, Ordering::SeqCst);
        self.stop_failure_timer();

        let has_login_key = self.store.login_key().await.is_some();

        match result {
            result if result.is_permanent(has_login_key) => {
                warn!(
                    bot = %self.name,
                    result = %result,
                    extended_result = logged_on.extended_result,
                    "Unable to log in, giving up"
                );
                self.emit(BotEvent::PermanentFailure {
                    result: Some(result),
                });
                self.stop().await;
            }
            LoginResult::AccountLogonDenied => self.request_code(CodeKind::AuthCode).await,
            LoginResult::AccountLoginDeniedNeedTwoFactor => {
                self.request_code(CodeKind::TwoFactor).await
            }
            LoginResult::Ok => self.on_login_success(logged_on).await,
            LoginResult::InvalidPassword
            | LoginResult::NoConnection
            | LoginResult::PasswordRequiredToKickSession
            | LoginResult::RateLimitExceeded
            | LoginResult::ServiceUnavailable
            | LoginResult::Timeout
            | LoginResult::TryAnotherCm
            | LoginResult::TwoFactorCodeMismatch => {
                warn!(
                    bot = %self.name,
                    result = %result,
                    extended_result = logged_on.extended_result,
                    "Unable to log in"
                );
            }
            _ => {
                error!(
                    bot = %self.name,
                    result = %result,
                    extended_result = logged_on.extended_result,
                    "Unexpected log-on result, stopping"
                );
                self.emit(BotEvent::PermanentFailure {
                    result: Some(result),
                });
                self.stop().await;
            }
        }
    }

    async fn request_code(&self, kind: CodeKind) {
        self.state.lock().pending_challenge = Some(kind);
        info!(bot = %self.name, kind = %kind, "Waiting for one-time code");

        if self.events.send(BotEvent::CredentialNeeded(kind)).is_err() {
            warn!(bot = %self.name, kind = %kind, "Nobody can supply the code, stopping");
            self.state.lock().pending_challenge = None;
            self.stop().await;
        }
    }

    async fn on_login_success(self: &Arc<Self>, logged_on: LoggedOn) {
        {
            let mut state = self.state.lock();
            state.account_id = logged_on.account_id;
            state.account_flags = logged_on.account_flags;
        }
        self.set_state(ConnectionState::LoggedOn);

        info!(
            bot = %self.name,
            account = %logged_on.account_id,
            vanity_url = logged_on.vanity_url.as_deref().unwrap_or_default(),
            "Logged on"
        );

        if logged_on.account_flags.is_limited() {
            warn!(bot = %self.name, "Account is limited");
        }
        if logged_on.account_flags.is_locked() {
            warn!(bot = %self.name, "Account is locked");
        }

        if logged_on.cell_id != 0
            && logged_on.cell_id != self.store.cell_id().await
            && let Err(e) = self.store.set_cell_id(logged_on.cell_id).await
        {
            warn!(bot = %self.name, error = %e, "Failed to persist cell id");
        }

        self.web.on_vanity_url_changed(logged_on.vanity_url.clone());

        let nonce = logged_on.web_api_nonce.unwrap_or_default();
        let parental_code = self.state.lock().credentials.parental_code.clone();
        let initialized = self
            .web
            .init(
                logged_on.account_id,
                self.transport.universe(),
                &nonce,
                parental_code.as_deref(),
            )
            .await;
        if !initialized && !self.refresh_web_session().await {
            return;
        }

        let web = self.web.clone();
        tokio::spawn(async move { web.has_valid_api_key().await }.in_current_span());

        if let Err(e) = self
            .transport
            .request_persona_update(logged_on.account_id)
            .await
        {
            warn!(bot = %self.name, error = %e, "Failed to request persona update");
        }
        if self.config.online_status != PersonaState::Offline
            && let Err(e) = self
                .transport
                .set_persona_state(self.config.online_status)
                .await
        {
            warn!(bot = %self.name, error = %e, "Failed to set persona state");
        }

        self.emit(BotEvent::LoggedOn {
            account_id: logged_on.account_id,
            vanity_url: logged_on.vanity_url,
        });
    }

    async fn on_login_key(&self, key: String) {
        if !self.config.use_login_keys {
            return;
        }

        if let Err(e) = self.store.set_login_key(Some(key.clone())).await {
            warn!(bot = %self.name, error = %e, "Failed to persist login key");
            return;
        }
        if let Err(e) = self.transport.accept_login_key(&key).await {
            warn!(bot = %self.name, error = %e, "Failed to accept login key");
        }
    }

    async fn on_machine_auth(&self, update: MachineAuthUpdate) {
        let file = match self.store.write_sentry(update.offset, &update.data).await {
            Ok(file) => file,
            Err(e) => {
                error!(bot = %self.name, error = %e, "Failed to write sentry file");
                if let Err(e) = self.store.delete_sentry().await {
                    warn!(bot = %self.name, error = %e, "Failed to delete sentry file");
                }
                return;
            }
        };

        let response = MachineAuthResponse {
            job_id: update.job_id,
            file_name: update.file_name,
            offset: update.offset,
            bytes_written: update.data.len(),
            file_size: file.len(),
            one_time_password: update.one_time_password,
            sentry_file_hash: Sha1::digest(&file).to_vec(),
        };

        debug!(bot = %self.name, file_size = response.file_size, "Sentry file updated");

        if let Err(e) = self.transport.send_machine_auth_response(response).await {
            warn!(bot = %self.name, error = %e, "Failed to acknowledge sentry file");
        }
    }

    fn on_message(&self, message: &InboundMessage) {
        let Some(event) = self.protocol.handle(message) else {
            return;
        };

        match &event {
            ProtocolEvent::VanityUrlChanged { vanity_url } => {
                self.web.on_vanity_url_changed(vanity_url.clone());
            }
            ProtocolEvent::PlayingSessionState { playing_blocked } => {
                self.state.lock().playing_blocked = *playing_blocked;
            }
            ProtocolEvent::SharedLibraryLockStatus { locked_by } => {
                let mut state = self.state.lock();
                let own = state.account_id;
                state.library_locked = locked_by.is_some_and(|id| id != own);
            }
            _ => {}
        }

        self.emit(BotEvent::Protocol(event));
    }

    /// Re-derives the web session from a fresh nonce. Forces a reconnect when
    /// that is not possible.
    async fn refresh_web_session(&self) -> bool {
        if !self.is_connected_and_logged_on() {
            return false;
        }

        let nonce = match self.transport.request_web_api_nonce().await {
            Ok(nonce) if !nonce.is_empty() => nonce,
            Ok(_) => {
                warn!(bot = %self.name, "Received an empty web nonce");
                self.reconnect().await;
                return false;
            }
            Err(e) => {
                warn!(bot = %self.name, error = %e, "Failed to request web nonce");
                self.reconnect().await;
                return false;
            }
        };

        let (account_id, parental_code) = {
            let state = self.state.lock();
            (state.account_id, state.credentials.parental_code.clone())
        };

        if self
            .web
            .init(
                account_id,
                self.transport.universe(),
                &nonce,
                parental_code.as_deref(),
            )
            .await
        {
            return true;
        }

        self.reconnect().await;
        false
    }
}

#[async_trait]
impl SessionOwner for Bot {
    fn is_connected_and_logged_on(&self) -> bool {
        self.state() == ConnectionState::LoggedOn && self.transport.is_connected()
    }

    fn is_account_limited(&self) -> bool {
        self.account_flags().is_limited()
    }

    async fn refresh_session(&self) -> bool {
        self.refresh_web_session().await
    }
}

impl std::fmt::Debug for Bot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bot")
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .field("keep_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn strip_non_ascii(value: &str) -> String {
    value.chars().filter(char::is_ascii).collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use tether_core::{MemoryStore, TransportResult, Universe};

    use super::*;
    use crate::config::{GlobalConfig, WebConfig};
    use crate::crypto::{EncryptedLogin, SessionCipher};

    const ACCOUNT: AccountId = AccountId(76561198000000000);

    struct StubCipher;

    impl SessionCipher for StubCipher {
        fn encrypt_nonce(&self, _universe: Universe, nonce: &[u8]) -> Option<EncryptedLogin> {
            Some(EncryptedLogin {
                session_key: vec![1, 2, 3],
                encrypted_login_key: nonce.to_vec(),
            })
        }
    }

    /// How the transport answers keepalives.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Keepalive {
        Answer,
        Fail,
        Hang,
    }

    struct MockTransport {
        sender: mpsc::UnboundedSender<TransportEvent>,
        receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
        connected: AtomicBool,
        connects: AtomicUsize,
        keepalive: Mutex<Keepalive>,
        keepalives: AtomicUsize,
        log_ons: Mutex<Vec<(Instant, LogOnDetails)>>,
        personas: Mutex<Vec<PersonaState>>,
        accepted_keys: Mutex<Vec<String>>,
        machine_auth: Mutex<Vec<MachineAuthResponse>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            let (sender, receiver) = mpsc::unbounded_channel();
            Arc::new(Self {
                sender,
                receiver: Mutex::new(Some(receiver)),
                connected: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                keepalive: Mutex::new(Keepalive::Answer),
                keepalives: AtomicUsize::new(0),
                log_ons: Mutex::new(Vec::new()),
                personas: Mutex::new(Vec::new()),
                accepted_keys: Mutex::new(Vec::new()),
                machine_auth: Mutex::new(Vec::new()),
            })
        }

        fn push(&self, event: TransportEvent) {
            self.sender.send(event).unwrap();
        }

        fn drop_connection(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.push(TransportEvent::Disconnected {
                user_initiated: false,
            });
        }

        fn log_on_count(&self) -> usize {
            self.log_ons.lock().len()
        }

        fn last_log_on(&self) -> LogOnDetails {
            self.log_ons.lock().last().unwrap().1.clone()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            self.receiver.lock().take()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn universe(&self) -> Universe {
            Universe::Public
        }

        async fn connect(&self) -> TransportResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            self.push(TransportEvent::Connected);
            Ok(())
        }

        async fn disconnect(&self) {
            if self.connected.swap(false, Ordering::SeqCst) {
                self.push(TransportEvent::Disconnected {
                    user_initiated: true,
                });
            }
        }

        async fn log_on(&self, details: LogOnDetails) -> TransportResult<()> {
            self.log_ons.lock().push((Instant::now(), details));
            Ok(())
        }

        async fn request_web_api_nonce(&self) -> TransportResult<String> {
            Ok("fresh-nonce".into())
        }

        async fn request_profile_info(&self, _account: AccountId) -> TransportResult<()> {
            self.keepalives.fetch_add(1, Ordering::SeqCst);
            let keepalive = *self.keepalive.lock();
            match keepalive {
                Keepalive::Answer => Ok(()),
                Keepalive::Fail => Err(TransportError::NotConnected),
                Keepalive::Hang => std::future::pending().await,
            }
        }

        async fn set_persona_state(&self, state: PersonaState) -> TransportResult<()> {
            self.personas.lock().push(state);
            Ok(())
        }

        async fn request_persona_update(&self, _account: AccountId) -> TransportResult<()> {
            Ok(())
        }

        async fn accept_login_key(&self, key: &str) -> TransportResult<()> {
            self.accepted_keys.lock().push(key.to_string());
            Ok(())
        }

        async fn send_machine_auth_response(
            &self,
            response: MachineAuthResponse,
        ) -> TransportResult<()> {
            self.machine_auth.lock().push(response);
            Ok(())
        }
    }

    fn context(web_base: &str, login_limiter_delay_secs: u64) -> Arc<RuntimeContext> {
        let global = GlobalConfig {
            login_limiter_delay_secs,
            ..Default::default()
        };
        context_with(web_base, global)
    }

    fn context_with(web_base: &str, global: GlobalConfig) -> Arc<RuntimeContext> {
        let global = GlobalConfig {
            web_limiter_delay_ms: 0,
            ..global
        };
        let web = WebConfig {
            community: web_base.into(),
            store: web_base.into(),
            help: web_base.into(),
            api: web_base.into(),
            ..Default::default()
        };
        Arc::new(RuntimeContext::new(&global, &web, Arc::new(StubCipher)).unwrap())
    }

    fn bot_config() -> BotConfig {
        BotConfig {
            login: "bötuser".into(),
            password: "hunter2".into(),
            ..BotConfig::new("main")
        }
    }

    fn bot(
        config: BotConfig,
        context: Arc<RuntimeContext>,
        transport: &Arc<MockTransport>,
        store: &Arc<MemoryStore>,
    ) -> Arc<Bot> {
        let transport: Arc<dyn Transport> = transport.clone();
        let store: Arc<dyn ArtifactStore> = store.clone();
        Bot::new(config, context, transport, store).unwrap()
    }

    /// A started bot that reached `LoggedOn` without a web session, with its
    /// own heartbeat loop and failure timer out of the way.
    async fn logged_on_bot(connection_timeout_secs: u64) -> (Arc<Bot>, Arc<MockTransport>) {
        let global = GlobalConfig {
            connection_timeout_secs,
            login_limiter_delay_secs: 0,
            ..Default::default()
        };
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(
            bot_config(),
            context_with("http://127.0.0.1:9", global),
            &transport,
            &store,
        );

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        bot.stop_failure_timer();
        if let Some(token) = bot.heartbeat.lock().take() {
            token.cancel();
        }
        bot.state.lock().account_id = ACCOUNT;
        bot.set_state(ConnectionState::LoggedOn);

        (bot, transport)
    }

    fn logged_on(result: LoginResult) -> TransportEvent {
        TransportEvent::LoggedOn(LoggedOn {
            result,
            ..Default::default()
        })
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn next_event(
        events: &mut broadcast::Receiver<BotEvent>,
        matches: impl Fn(&BotEvent) -> bool,
    ) -> BotEvent {
        timeout(Duration::from_secs(120), async {
            loop {
                let event = events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_log_on_uses_persisted_artifacts() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set_login_key(Some("stored-key".into())).await.unwrap();
        store.set_cell_id(7).await.unwrap();
        store.write_sentry(0, b"sentry").await.unwrap();

        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);
        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        let details = transport.last_log_on();
        assert_eq!(details.username, "btuser");
        assert_eq!(details.password, "");
        assert_eq!(details.login_key.as_deref(), Some("stored-key"));
        assert_eq!(details.cell_id, 7);
        assert_eq!(details.login_id, LOGIN_ID);
        assert!(details.should_remember_password);
        assert_eq!(
            details.sentry_file_hash,
            Some(Sha1::digest(b"sentry").to_vec())
        );
        assert_eq!(bot.state(), ConnectionState::ConnectedUnauthenticated);

        bot.stop().await;
    }

    #[tokio::test]
    async fn test_disabled_login_keys_submit_password() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set_login_key(Some("stale".into())).await.unwrap();

        let config = BotConfig {
            use_login_keys: false,
            ..bot_config()
        };
        let bot = bot(config, context("http://127.0.0.1:9", 0), &transport, &store);
        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        let details = transport.last_log_on();
        assert_eq!(details.password, "hunter2");
        assert!(details.login_key.is_none());
        assert!(!details.should_remember_password);
        assert!(store.login_key().await.is_none());

        bot.stop().await;
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_without_retry() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);
        let mut events = bot.subscribe();

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.push(logged_on(LoginResult::AccountDisabled));
        let failure = next_event(&mut events, |e| matches!(e, BotEvent::PermanentFailure { .. })).await;
        assert!(matches!(
            failure,
            BotEvent::PermanentFailure {
                result: Some(LoginResult::AccountDisabled)
            }
        ));
        next_event(&mut events, |e| matches!(e, BotEvent::Stopped)).await;

        assert!(!bot.is_running());
        wait_until(|| !transport.is_connected()).await;
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_code_challenge_suspends_until_code_is_submitted() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);
        let mut events = bot.subscribe();

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.push(logged_on(LoginResult::AccountLogonDenied));
        let event = next_event(&mut events, |e| matches!(e, BotEvent::CredentialNeeded(_))).await;
        assert!(matches!(event, BotEvent::CredentialNeeded(CodeKind::AuthCode)));

        transport.drop_connection();
        next_event(&mut events, |e| {
            matches!(
                e,
                BotEvent::StateChanged {
                    new: ConnectionState::Disconnected,
                    ..
                }
            )
        })
        .await;
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(bot.pending_challenge(), Some(CodeKind::AuthCode));

        assert!(!bot.submit_code(CodeKind::TwoFactor, Some("X".into())).await);
        assert!(bot.submit_code(CodeKind::AuthCode, Some("ABCDE".into())).await);
        wait_until(|| transport.log_on_count() == 2).await;

        let details = transport.last_log_on();
        assert_eq!(details.auth_code.as_deref(), Some("ABCDE"));
        assert_eq!(details.password, "hunter2");
        assert!(bot.pending_challenge().is_none());

        bot.stop().await;
    }

    #[tokio::test]
    async fn test_declined_code_stops() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);
        let mut events = bot.subscribe();

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.push(logged_on(LoginResult::AccountLoginDeniedNeedTwoFactor));
        next_event(&mut events, |e| {
            matches!(e, BotEvent::CredentialNeeded(CodeKind::TwoFactor))
        })
        .await;

        assert!(bot.submit_code(CodeKind::TwoFactor, None).await);
        next_event(&mut events, |e| matches!(e, BotEvent::Stopped)).await;
        assert!(!bot.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_delays_reconnect() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.push(logged_on(LoginResult::ServiceUnavailable));
        sleep(Duration::from_millis(100)).await;
        transport.drop_connection();
        wait_until(|| transport.log_on_count() == 2).await;

        let log_ons = transport.log_ons.lock();
        assert!(log_ons[1].0 - log_ons[0].0 >= TRANSIENT_RECONNECT_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_attempts_are_spaced() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 10), &transport, &store);

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.drop_connection();
        timeout(Duration::from_secs(60), async {
            while transport.log_on_count() < 2 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .unwrap();

        let log_ons = transport.log_ons.lock();
        assert!(log_ons[1].0 - log_ons[0].0 >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_keepalives_force_reconnect() {
        let (bot, transport) = logged_on_bot(20).await;
        *transport.keepalive.lock() = Keepalive::Hang;
        sleep(Duration::from_secs(21)).await;

        bot.heartbeat().await;
        assert_eq!(bot.heartbeat_failures.load(Ordering::SeqCst), 1);

        bot.heartbeat().await;
        assert_eq!(bot.heartbeat_failures.load(Ordering::SeqCst), HEARTBEAT_TRIPPED);

        wait_until(|| transport.log_on_count() == 2).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(transport.keepalives.load(Ordering::SeqCst), 2);

        bot.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_trips_after_repeated_failures() {
        // 30s of connection timeout allows three failed keepalives.
        let (bot, transport) = logged_on_bot(30).await;
        assert_eq!(bot.heartbeat_threshold(), 3);
        *transport.keepalive.lock() = Keepalive::Fail;

        bot.heartbeat().await;
        assert_eq!(transport.keepalives.load(Ordering::SeqCst), 0);

        sleep(Duration::from_secs(31)).await;
        bot.heartbeat().await;
        bot.heartbeat().await;
        assert_eq!(bot.heartbeat_failures.load(Ordering::SeqCst), 2);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);

        bot.heartbeat().await;
        assert_eq!(bot.heartbeat_failures.load(Ordering::SeqCst), HEARTBEAT_TRIPPED);

        // Tripped: no further keepalives until the connection is back.
        bot.heartbeat().await;
        assert_eq!(transport.keepalives.load(Ordering::SeqCst), 3);

        wait_until(|| transport.log_on_count() == 2).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(bot.heartbeat_failures.load(Ordering::SeqCst), 0);

        bot.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_events_count_as_traffic() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        sleep(Duration::from_secs(120)).await;
        let before = Instant::now();
        transport.push(TransportEvent::LoginKey {
            key: "new-key".into(),
        });
        wait_until(|| !transport.accepted_keys.lock().is_empty()).await;

        assert!(bot.protocol.last_packet_received() >= before);

        bot.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_login_restarts_the_bot() {
        // 30s of connection timeout gives a one minute failure timer.
        let global = GlobalConfig {
            connection_timeout_secs: 30,
            login_limiter_delay_secs: 0,
            ..Default::default()
        };
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(
            bot_config(),
            context_with("http://127.0.0.1:9", global),
            &transport,
            &store,
        );
        let mut events = bot.subscribe();

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        let failure = next_event(&mut events, |e| matches!(e, BotEvent::PermanentFailure { .. })).await;
        assert!(matches!(failure, BotEvent::PermanentFailure { result: None }));

        wait_until(|| transport.log_on_count() == 2).await;
        assert!(bot.is_running());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);

        let log_ons = transport.log_ons.lock();
        assert!(log_ons[1].0 - log_ons[0].0 >= Duration::from_secs(60));
        drop(log_ons);

        bot.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_holds_login_cooldown() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let context = context("http://127.0.0.1:9", 0);
        let bot = bot(bot_config(), context.clone(), &transport, &store);

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.push(logged_on(LoginResult::RateLimitExceeded));
        sleep(Duration::from_millis(100)).await;
        transport.drop_connection();

        // Other logins are held back as well.
        sleep(Duration::from_secs(60)).await;
        let waiting = Instant::now();
        context.login_limiter().limit_login().await;
        assert!(waiting.elapsed() >= LOGIN_COOLDOWN - Duration::from_secs(61));

        timeout(Duration::from_secs(60), async {
            while transport.log_on_count() < 2 {
                sleep(Duration::from_secs(1)).await;
            }
        })
        .await
        .unwrap();

        let log_ons = transport.log_ons.lock();
        assert!(log_ons[1].0 - log_ons[0].0 >= LOGIN_COOLDOWN);
        drop(log_ons);

        bot.stop().await;
    }

    #[tokio::test]
    async fn test_unrecognized_result_stops() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);
        let mut events = bot.subscribe();

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.push(logged_on(LoginResult::Other(999)));
        let failure = next_event(&mut events, |e| matches!(e, BotEvent::PermanentFailure { .. })).await;
        assert!(matches!(
            failure,
            BotEvent::PermanentFailure {
                result: Some(LoginResult::Other(999))
            }
        ));
        next_event(&mut events, |e| matches!(e, BotEvent::Stopped)).await;

        assert!(!bot.is_running());
        wait_until(|| !transport.is_connected()).await;
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_password_drops_login_key_and_retries() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        store.set_login_key(Some("expired-key".into())).await.unwrap();
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;
        assert_eq!(transport.last_log_on().login_key.as_deref(), Some("expired-key"));

        transport.push(logged_on(LoginResult::InvalidPassword));
        sleep(Duration::from_millis(100)).await;
        assert!(bot.is_running());
        transport.drop_connection();
        wait_until(|| transport.log_on_count() == 2).await;

        assert!(store.login_key().await.is_none());
        let details = transport.last_log_on();
        assert!(details.login_key.is_none());
        assert_eq!(details.password, "hunter2");

        bot.stop().await;
    }

    #[tokio::test]
    async fn test_successful_login_initializes_web_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ISteamUserAuth/AuthenticateUser/v1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "authenticateuser": {"token": "t", "tokensecure": "ts"}
            })))
            .mount(&server)
            .await;

        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context(&server.uri(), 0), &transport, &store);
        let mut events = bot.subscribe();

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.push(TransportEvent::LoggedOn(LoggedOn {
            result: LoginResult::Ok,
            account_id: ACCOUNT,
            vanity_url: Some("me".into()),
            cell_id: 42,
            web_api_nonce: Some("nonce".into()),
            ..Default::default()
        }));
        let event = next_event(&mut events, |e| matches!(e, BotEvent::LoggedOn { .. })).await;
        assert!(matches!(event, BotEvent::LoggedOn { account_id, .. } if account_id == ACCOUNT));

        assert!(bot.web().is_initialized());
        assert_eq!(bot.account_id(), Some(ACCOUNT));
        assert_eq!(store.cell_id().await, 42);
        assert_eq!(*transport.personas.lock(), vec![PersonaState::Online]);
        assert_eq!(bot.web().profile_path().as_deref(), Some("/id/me"));

        transport.push(TransportEvent::Message(InboundMessage::new(
            "ClientVanityURLChangedNotification",
            serde_json::json!({"vanity_url": "renamed"}),
        )));
        next_event(&mut events, |e| matches!(e, BotEvent::Protocol(_))).await;
        assert_eq!(bot.web().profile_path().as_deref(), Some("/id/renamed"));

        transport.push(TransportEvent::Message(InboundMessage::new(
            "ClientSharedLibraryLockStatus",
            serde_json::json!({"own_library_locked_by": 76561198000000001u64}),
        )));
        next_event(&mut events, |e| matches!(e, BotEvent::Protocol(_))).await;
        assert!(bot.is_library_locked());

        bot.stop().await;
    }

    #[tokio::test]
    async fn test_login_key_and_sentry_updates_are_persisted() {
        let transport = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let bot = bot(bot_config(), context("http://127.0.0.1:9", 0), &transport, &store);

        bot.start().await;
        wait_until(|| transport.log_on_count() == 1).await;

        transport.push(TransportEvent::LoginKey {
            key: "new-key".into(),
        });
        transport.push(TransportEvent::MachineAuth(MachineAuthUpdate {
            job_id: 9,
            file_name: "ssfn".into(),
            offset: 0,
            data: vec![1, 2, 3],
            one_time_password: None,
        }));
        wait_until(|| !transport.machine_auth.lock().is_empty()).await;

        assert_eq!(*transport.accepted_keys.lock(), vec!["new-key".to_string()]);
        assert_eq!(store.login_key().await.as_deref(), Some("new-key"));

        let response = transport.machine_auth.lock()[0].clone();
        assert_eq!(response.job_id, 9);
        assert_eq!(response.bytes_written, 3);
        assert_eq!(response.file_size, 3);
        assert_eq!(response.sentry_file_hash, Sha1::digest([1u8, 2, 3]).to_vec());
        assert_eq!(store.read_sentry().await.unwrap(), Some(vec![1, 2, 3]));

        bot.stop().await;
    }
}
