//! Shared runtime context.
//!
//! Everything process-wide lives here and is handed to each bot and web
//! session by reference: timing knobs, the resolved web endpoints, the login
//! and web limiters and the handshake cipher.

use std::fmt;
use std::sync::Arc;

use url::Url;

use tether_transport::WebLimiter;

use crate::config::{ConfigError, ConfigResult, GlobalConfig, TetherConfig, WebConfig};
use crate::crypto::{RsaAesCipher, SessionCipher};
use crate::error::RuntimeResult;
use crate::limiter::LoginLimiter;

/// Logical web host. Community, store and help share one web session; the
/// API host only serves the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WebHost {
    Community,
    Store,
    Help,
    Api,
}

impl WebHost {
    /// Hosts that receive the session cookies.
    pub const SESSION_HOSTS: [WebHost; 3] = [Self::Community, Self::Store, Self::Help];

    pub const ALL: [WebHost; 4] = [Self::Community, Self::Store, Self::Help, Self::Api];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Community => "community",
            Self::Store => "store",
            Self::Help => "help",
            Self::Api => "api",
        }
    }
}

impl fmt::Display for WebHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed base URLs of the logical web hosts.
#[derive(Debug, Clone)]
pub struct WebEndpoints {
    community: Url,
    store: Url,
    help: Url,
    api: Url,
}

impl WebEndpoints {
    pub fn from_config(web: &WebConfig) -> ConfigResult<Self> {
        let parse = |host: WebHost, url: &str| {
            let parsed =
                Url::parse(url).map_err(|e| ConfigError::invalid_url(host.as_str(), url, e.to_string()))?;
            if parsed.host_str().is_none() {
                return Err(ConfigError::invalid_url(host.as_str(), url, "URL has no host"));
            }
            Ok(parsed)
        };

        Ok(Self {
            community: parse(WebHost::Community, &web.community)?,
            store: parse(WebHost::Store, &web.store)?,
            help: parse(WebHost::Help, &web.help)?,
            api: parse(WebHost::Api, &web.api)?,
        })
    }

    pub fn base(&self, host: WebHost) -> &Url {
        match host {
            WebHost::Community => &self.community,
            WebHost::Store => &self.store,
            WebHost::Help => &self.help,
            WebHost::Api => &self.api,
        }
    }

    /// Domain name of `host`, as used for cookies.
    pub fn domain(&self, host: WebHost) -> &str {
        self.base(host).host_str().unwrap_or_default()
    }

    /// Absolute URL for `path` (which starts with `/`) on `host`.
    pub fn url(&self, host: WebHost, path: &str) -> String {
        format!("{}{path}", self.base(host).as_str().trim_end_matches('/'))
    }
}

/// Process-wide state shared by every bot.
pub struct RuntimeContext {
    global: GlobalConfig,
    endpoints: WebEndpoints,
    user_agent: Option<String>,
    login_limiter: LoginLimiter,
    web_limiter: WebLimiter,
    cipher: Arc<dyn SessionCipher>,
}

impl RuntimeContext {
    /// Builds the context with the handshake keys from `config.web`.
    pub fn from_config(config: &TetherConfig) -> RuntimeResult<Self> {
        let cipher = RsaAesCipher::from_config(&config.web)?;
        Self::new(&config.global, &config.web, Arc::new(cipher))
    }

    pub fn new(
        global: &GlobalConfig,
        web: &WebConfig,
        cipher: Arc<dyn SessionCipher>,
    ) -> RuntimeResult<Self> {
        let endpoints = WebEndpoints::from_config(web)?;
        let web_limiter = WebLimiter::new(
            global.web_limiter_delay(),
            global.max_connections,
            WebHost::ALL.map(WebHost::as_str),
        );

        Ok(Self {
            global: global.clone(),
            endpoints,
            user_agent: web.user_agent.clone(),
            login_limiter: LoginLimiter::new(global.login_limiter_delay()),
            web_limiter,
            cipher,
        })
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn endpoints(&self) -> &WebEndpoints {
        &self.endpoints
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn login_limiter(&self) -> &LoginLimiter {
        &self.login_limiter
    }

    pub fn web_limiter(&self) -> &WebLimiter {
        &self.web_limiter
    }

    pub fn cipher(&self) -> &dyn SessionCipher {
        self.cipher.as_ref()
    }
}

impl fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("global", &self.global)
            .field("endpoints", &self.endpoints)
            .field("login_limiter", &self.login_limiter)
            .field("web_limiter", &self.web_limiter)
            .finish_non_exhaustive()
    }
}
