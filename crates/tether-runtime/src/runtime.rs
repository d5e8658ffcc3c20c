//! Runtime orchestration.
//!
//! [`TetherRuntime`] builds the process-wide [`RuntimeContext`] from
//! configuration, owns every registered [`Bot`] and runs them until a
//! shutdown signal arrives.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tether_runtime::TetherRuntime;
//!
//! // Auto-loads tether.toml from the current directory
//! let runtime = TetherRuntime::new()?;
//!
//! // Custom configuration path
//! let runtime = TetherRuntime::builder()
//!     .config_file("config/tether.toml")
//!     .profile("production")
//!     .build()?;
//!
//! // One transport per configured account
//! runtime.register_bots(|bot| Arc::new(MyTransport::new(&bot.login))).await?;
//! runtime.run().await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::RwLock;
use tracing::{Instrument, debug, info, warn};

use tether_core::{ArtifactStore, FileStore, MemoryStore, Transport};

use crate::bot::Bot;
use crate::config::{BotConfig, ConfigLoader, GlobalConfig, TetherConfig};
use crate::context::RuntimeContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

/// Owns the shared context and every bot of the process.
pub struct TetherRuntime {
    config: TetherConfig,
    context: Arc<RuntimeContext>,
    /// Map of bot name to bot.
    bots: Arc<RwLock<HashMap<String, Arc<Bot>>>>,
    running: Arc<RwLock<bool>>,
}

impl TetherRuntime {
    /// Creates a runtime from `tether.toml` in the current directory, or from
    /// defaults when no file is found.
    pub fn new() -> RuntimeResult<Self> {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                TetherConfig::default()
            });

        Self::from_config(&config)
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Initializes logging and builds the shared context from `config`.
    pub fn from_config(config: &TetherConfig) -> RuntimeResult<Self> {
        logging::init_from_config(config);

        let context = RuntimeContext::from_config(config)?;

        info!(
            log_level = %config.logging.level,
            bots = config.bots.len(),
            "Runtime initialized from configuration"
        );

        Ok(Self::with_context(config, Arc::new(context)))
    }

    /// Uses an already built context. Logging is left alone.
    pub fn with_context(config: &TetherConfig, context: Arc<RuntimeContext>) -> Self {
        Self {
            config: config.clone(),
            context,
            bots: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    // =========================================================================
    // Bot Management
    // =========================================================================

    /// Opens the artifact store of bot `name`: file backed when a store
    /// directory is configured, in memory otherwise.
    pub async fn open_store(&self, name: &str) -> RuntimeResult<Arc<dyn ArtifactStore>> {
        match &self.config.store.directory {
            Some(directory) => Ok(Arc::new(FileStore::open(directory, name).await?)),
            None => Ok(Arc::new(MemoryStore::new())),
        }
    }

    /// Registers a bot driving `transport`.
    pub async fn register_bot(
        &self,
        config: BotConfig,
        transport: Arc<dyn Transport>,
    ) -> RuntimeResult<Arc<Bot>> {
        if self.bots.read().await.contains_key(&config.name) {
            return Err(RuntimeError::BotExists(config.name));
        }

        let name = config.name.clone();
        let store = self.open_store(&name).await?;
        let bot = Bot::new(config, self.context.clone(), transport, store)?;

        let mut bots = self.bots.write().await;
        if bots.contains_key(&name) {
            return Err(RuntimeError::BotExists(name));
        }
        bots.insert(name.clone(), bot.clone());
        info!(bot = %name, "Registered bot");

        if *self.running.read().await && bot.config().enabled {
            spawn_start(&bot);
        }

        Ok(bot)
    }

    /// Registers every configured bot, asking `transport` for each one's
    /// connection collaborator.
    pub async fn register_bots<F>(&self, transport: F) -> RuntimeResult<Vec<Arc<Bot>>>
    where
        F: Fn(&BotConfig) -> Arc<dyn Transport>,
    {
        let mut registered = Vec::with_capacity(self.config.bots.len());
        for config in &self.config.bots {
            let bot = self.register_bot(config.clone(), transport(config)).await?;
            registered.push(bot);
        }
        Ok(registered)
    }

    pub async fn bot(&self, name: &str) -> Option<Arc<Bot>> {
        self.bots.read().await.get(name).cloned()
    }

    pub async fn bots(&self) -> Vec<Arc<Bot>> {
        self.bots.read().await.values().cloned().collect()
    }

    pub async fn bot_count(&self) -> usize {
        self.bots.read().await.len()
    }

    /// Stops and forgets bot `name`.
    pub async fn remove_bot(&self, name: &str) -> RuntimeResult<()> {
        let bot = self
            .bots
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RuntimeError::BotNotFound(name.to_string()))?;

        bot.stop().await;
        info!(bot = %name, "Removed bot");
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts every enabled bot.
    pub async fn start(&self) -> RuntimeResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Runtime is already running");
                return Ok(());
            }
            *running = true;
        }

        info!("Starting Tether runtime");

        for bot in self.bots.read().await.values() {
            if !bot.config().enabled {
                debug!(bot = %bot.name(), "Bot is disabled, not starting it");
                continue;
            }
            spawn_start(bot);
        }

        info!("Runtime started");

        Ok(())
    }

    /// Stops every bot.
    pub async fn stop(&self) -> RuntimeResult<()> {
        {
            let mut running = self.running.write().await;
            if !*running {
                warn!("Runtime is not running");
                return Ok(());
            }
            *running = false;
        }

        info!("Stopping Tether runtime");

        let bots = self.bots().await;
        for bot in bots {
            bot.stop().await;
        }

        info!("Runtime stopped");

        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;

        info!("Tether runtime is now running. Press Ctrl+C to stop.");

        self.wait_for_shutdown().await;

        self.stop().await
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;

        shutdown.await;

        self.stop().await
    }

    async fn wait_for_shutdown(&self) {
        #[cfg(unix)]
        {
            let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!(error = %e, "Failed to register SIGTERM handler");
                    wait_for_ctrl_c().await;
                    return;
                }
            };

            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        wait_for_ctrl_c().await;
    }
}

/// Connecting may wait on the login limiter, so bots start in the background.
fn spawn_start(bot: &Arc<Bot>) {
    let span = logging::bot_span(bot.name());
    let bot = bot.clone();
    tokio::spawn(async move { bot.start().await }.instrument(span));
}

async fn wait_for_ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`TetherRuntime`] with custom configuration.
///
/// # Example
///
/// ```rust,ignore
/// let runtime = TetherRuntime::builder()
///     .config_file("config/production.toml")
///     .profile("production")
///     .build()?;
/// ```
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g. "development", "production").
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Enables loading environment variables (enabled by default).
    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Overrides the `global` section.
    pub fn global(mut self, global: GlobalConfig) -> Self {
        self.config_loader = self.config_loader.global(global);
        self
    }

    /// Adds a bot next to the configured ones.
    pub fn bot(mut self, bot: BotConfig) -> Self {
        self.config_loader = self.config_loader.bot(bot);
        self
    }

    pub fn build(self) -> RuntimeResult<TetherRuntime> {
        let config = self.config_loader.load()?;
        TetherRuntime::from_config(&config)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio_test::assert_ok;

    use tether_core::{
        AccountId, LogOnDetails, MachineAuthResponse, PersonaState, TransportEvent,
        TransportResult, Universe,
    };

    use super::*;
    use crate::crypto::RsaAesCipher;

    /// Never connects; only holds the event feed.
    struct IdleTransport {
        receiver: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
        _sender: mpsc::UnboundedSender<TransportEvent>,
    }

    impl IdleTransport {
        fn new() -> Arc<dyn Transport> {
            let (sender, receiver) = mpsc::unbounded_channel();
            Arc::new(Self {
                receiver: Mutex::new(Some(receiver)),
                _sender: sender,
            })
        }
    }

    #[async_trait]
    impl Transport for IdleTransport {
        fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            self.receiver.lock().take()
        }

        fn is_connected(&self) -> bool {
            false
        }

        fn universe(&self) -> Universe {
            Universe::Public
        }

        async fn connect(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn log_on(&self, _details: LogOnDetails) -> TransportResult<()> {
            Ok(())
        }

        async fn request_web_api_nonce(&self) -> TransportResult<String> {
            Ok(String::new())
        }

        async fn request_profile_info(&self, _account: AccountId) -> TransportResult<()> {
            Ok(())
        }

        async fn set_persona_state(&self, _state: PersonaState) -> TransportResult<()> {
            Ok(())
        }

        async fn request_persona_update(&self, _account: AccountId) -> TransportResult<()> {
            Ok(())
        }

        async fn accept_login_key(&self, _key: &str) -> TransportResult<()> {
            Ok(())
        }

        async fn send_machine_auth_response(
            &self,
            _response: MachineAuthResponse,
        ) -> TransportResult<()> {
            Ok(())
        }
    }

    fn runtime(config: TetherConfig) -> TetherRuntime {
        let context = RuntimeContext::new(&config.global, &config.web, Arc::new(RsaAesCipher::new()))
            .unwrap();
        TetherRuntime::with_context(&config, Arc::new(context))
    }

    fn config_with_bots(names: &[&str]) -> TetherConfig {
        let mut config = TetherConfig::default();
        config.global.login_limiter_delay_secs = 0;
        config.bots = names.iter().map(|name| BotConfig::new(*name)).collect();
        config
    }

    #[tokio::test]
    async fn test_register_bots_from_config() {
        let runtime = runtime(config_with_bots(&["first", "second"]));

        let bots = runtime.register_bots(|_| IdleTransport::new()).await.unwrap();

        assert_eq!(bots.len(), 2);
        assert_eq!(runtime.bot_count().await, 2);
        assert!(runtime.bot("first").await.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_bot_is_rejected() {
        let runtime = runtime(TetherConfig::default());

        runtime
            .register_bot(BotConfig::new("main"), IdleTransport::new())
            .await
            .unwrap();
        let result = runtime
            .register_bot(BotConfig::new("main"), IdleTransport::new())
            .await;

        assert!(matches!(result, Err(RuntimeError::BotExists(name)) if name == "main"));
    }

    #[tokio::test]
    async fn test_remove_bot() {
        let runtime = runtime(TetherConfig::default());
        runtime
            .register_bot(BotConfig::new("main"), IdleTransport::new())
            .await
            .unwrap();

        assert_ok!(runtime.remove_bot("main").await);
        assert_eq!(runtime.bot_count().await, 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_bot() {
        let runtime = runtime(TetherConfig::default());
        assert!(matches!(
            runtime.remove_bot("ghost").await,
            Err(RuntimeError::BotNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_is_used_when_configured() {
        let directory = std::env::temp_dir().join(format!("tether-runtime-{}", std::process::id()));
        let mut config = TetherConfig::default();
        config.store.directory = Some(directory.clone());
        let runtime = runtime(config);

        let store = runtime.open_store("main").await.unwrap();
        store.set_cell_id(3).await.unwrap();

        assert!(directory.join("main.db").exists());
        let _ = std::fs::remove_dir_all(directory);
    }

    #[tokio::test]
    async fn test_run_until_starts_and_stops_enabled_bots() {
        let mut config = config_with_bots(&["on", "off"]);
        config.bots[1].enabled = false;
        let runtime = runtime(config);
        runtime.register_bots(|_| IdleTransport::new()).await.unwrap();

        let on = runtime.bot("on").await.unwrap();
        let off = runtime.bot("off").await.unwrap();

        runtime
            .run_until(async {
                for _ in 0..100 {
                    if on.is_running() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                }
                assert!(on.is_running());
                assert!(!off.is_running());
            })
            .await
            .unwrap();

        assert!(!runtime.is_running().await);
        assert!(!on.is_running());
    }
}
