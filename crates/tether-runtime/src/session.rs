//! Authenticated web session of a single bot.
//!
//! [`WebSession`] turns the one-time nonce issued after a network login into
//! session cookies for the community, store and help hosts, keeps track of
//! whether those cookies are still accepted, and wraps requests so they are
//! refreshed and retried transparently.
//!
//! Expiry checks and refreshes are debounced by the minimum session validity
//! (a sixth of the connection timeout) and share one gate, so at most one
//! handshake per bot is ever in flight.

use std::sync::{Arc, LazyLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use url::Url;

use tether_core::{AccountId, Cacheable, Fallback, MAX_TRIES, Universe};
use tether_transport::{FormData, RequestOptions, SessionCookieStore, WebBrowser, WebResult};

use crate::config::PARENTAL_CODE_LENGTH;
use crate::context::{RuntimeContext, WebHost};

const AUTHENTICATE_USER_PATH: &str = "/ISteamUserAuth/AuthenticateUser/v1";
const SESSION_PROBE_PATH: &str = "/account";
const PARENTAL_UNLOCK_PATH: &str = "/parental/ajaxunlock";
const API_KEY_PATH: &str = "/dev/apikey?l=english";
const API_KEY_REGISTER_PATH: &str = "/dev/registerkey";
const LOST_AUTH_HOST: &str = "lostauth";
const SESSION_COOKIE: &str = "sessionid";

/// The controller side of a web session.
#[async_trait]
pub trait SessionOwner: Send + Sync {
    fn is_connected_and_logged_on(&self) -> bool;

    fn is_account_limited(&self) -> bool;

    /// Asks for a fresh nonce and re-runs the handshake.
    async fn refresh_session(&self) -> bool;
}

/// Form field name under which the session id is injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKey {
    /// Nothing is injected.
    None,
    /// `sessionid`
    #[default]
    Lowercase,
    /// `sessionID`
    CamelCase,
    /// `SessionID`
    PascalCase,
}

impl SessionKey {
    pub fn field_name(self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Lowercase => Some("sessionid"),
            Self::CamelCase => Some("sessionID"),
            Self::PascalCase => Some("SessionID"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AuthenticateUserResponse {
    authenticateuser: AuthenticateUser,
}

#[derive(Debug, Deserialize)]
struct AuthenticateUser {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    tokensecure: Option<String>,
}

#[derive(Debug, Default)]
struct SessionState {
    initialized: bool,
    account_id: AccountId,
    vanity_url: Option<String>,
    last_check: Option<Instant>,
    last_refresh: Option<Instant>,
}

/// What the API key settings page says.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ApiKeyState {
    Error,
    Timeout,
    Registered(String),
    NotRegisteredYet,
    AccessDenied,
}

/// Builds the HTTP client a web session runs on.
pub fn build_browser(context: &RuntimeContext) -> WebResult<WebBrowser> {
    let mut builder = WebBrowser::builder().timeout(context.global().connection_timeout());
    if let Some(user_agent) = context.user_agent() {
        builder = builder.user_agent(user_agent);
    }
    builder.build()
}

/// A bot's authenticated web session.
pub struct WebSession {
    bot_name: String,
    context: Arc<RuntimeContext>,
    browser: WebBrowser,
    owner: Weak<dyn SessionOwner>,
    state: Mutex<SessionState>,
    gate: tokio::sync::Mutex<()>,
    api_key: Cacheable<String>,
}

impl WebSession {
    pub fn new(
        bot_name: impl Into<String>,
        context: Arc<RuntimeContext>,
        browser: WebBrowser,
        owner: Weak<dyn SessionOwner>,
    ) -> Arc<Self> {
        let bot_name = bot_name.into();

        Arc::new_cyclic(|this: &Weak<Self>| {
            let this = this.clone();
            let api_key = Cacheable::permanent(move || {
                let this = this.clone();
                async move {
                    match this.upgrade() {
                        Some(session) => session.resolve_api_key().await,
                        None => (false, String::new()),
                    }
                }
            });

            Self {
                bot_name,
                context,
                browser,
                owner,
                state: Mutex::new(SessionState::default()),
                gate: tokio::sync::Mutex::new(()),
                api_key,
            }
        })
    }

    pub fn cookies(&self) -> &Arc<SessionCookieStore> {
        self.browser.cookies()
    }

    pub fn browser(&self) -> &WebBrowser {
        &self.browser
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn vanity_url(&self) -> Option<String> {
        self.state.lock().vanity_url.clone()
    }

    /// Records the account's vanity name. An empty name clears it.
    pub fn on_vanity_url_changed(&self, vanity_url: Option<String>) {
        self.state.lock().vanity_url = vanity_url.filter(|vanity| !vanity.is_empty());
    }

    /// Path of the account's own profile page.
    pub fn profile_path(&self) -> Option<String> {
        let state = self.state.lock();
        match &state.vanity_url {
            Some(vanity) => Some(format!("/id/{vanity}")),
            None if state.account_id.is_valid() => Some(format!("/profiles/{}", state.account_id)),
            None => None,
        }
    }

    fn owner(&self) -> Option<Arc<dyn SessionOwner>> {
        self.owner.upgrade()
    }

    fn owner_logged_on(&self) -> bool {
        self.owner()
            .is_some_and(|owner| owner.is_connected_and_logged_on())
    }

    fn domain(&self, host: WebHost) -> &str {
        self.context.endpoints().domain(host)
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Derives the web session from a one-time `nonce`.
    ///
    /// The nonce is consumed by the first request, so nothing here is
    /// retried. On failure the caller has to obtain a new nonce.
    pub async fn init(
        &self,
        account_id: AccountId,
        universe: Universe,
        nonce: &str,
        parental_code: Option<&str>,
    ) -> bool {
        if !account_id.is_valid() || universe == Universe::Invalid || nonce.is_empty() {
            warn!(
                bot = %self.bot_name,
                account = %account_id,
                universe = %universe,
                "Cannot initialize web session without account, universe and nonce"
            );
            return false;
        }

        self.state.lock().account_id = account_id;

        let Some(login) = self
            .context
            .cipher()
            .encrypt_nonce(universe, nonce.as_bytes())
        else {
            return false;
        };

        info!(bot = %self.bot_name, "Logging in to the web API");

        let form = FormData::new()
            .bytes("encrypted_loginkey", login.encrypted_login_key)
            .bytes("sessionkey", login.session_key)
            .text("steamid", account_id.to_string())
            .text("format", "json");
        let url = self
            .context
            .endpoints()
            .url(WebHost::Api, AUTHENTICATE_USER_PATH);

        let response = self
            .context
            .web_limiter()
            .limit(
                WebHost::Api.as_str(),
                self.browser.url_post_to_json::<AuthenticateUserResponse>(
                    &url,
                    &form,
                    None,
                    RequestOptions::NONE,
                    1,
                ),
            )
            .await;

        let tokens = match response {
            Ok(response) => response.content.authenticateuser,
            Err(e) => {
                warn!(bot = %self.bot_name, error = %e, "Web API login failed");
                return false;
            }
        };

        let Some(token) = tokens.token.filter(|token| !token.is_empty()) else {
            warn!(bot = %self.bot_name, "Web API login returned no token");
            return false;
        };
        let Some(token_secure) = tokens.tokensecure.filter(|token| !token.is_empty()) else {
            warn!(bot = %self.bot_name, "Web API login returned no secure token");
            return false;
        };

        let session_id = STANDARD.encode(account_id.to_string());
        let timezone_offset = format!("{}%2C0", local_offset_secs());

        let cookies = self.cookies();
        for host in WebHost::SESSION_HOSTS {
            let domain = self.domain(host);
            cookies.set(domain, SESSION_COOKIE, &session_id);
            cookies.set(domain, "steamLogin", &token);
            cookies.set(domain, "steamLoginSecure", &token_secure);
            cookies.set(domain, "timezoneOffset", &timezone_offset);
        }

        info!(bot = %self.bot_name, "Web session established");

        if let Some(code) = parental_code.filter(|code| code.chars().count() == PARENTAL_CODE_LENGTH)
            && !self.unlock_parental(code).await
        {
            return false;
        }

        let now = Instant::now();
        let mut state = self.state.lock();
        state.last_check = Some(now);
        state.last_refresh = Some(now);
        state.initialized = true;
        true
    }

    async fn unlock_parental(&self, code: &str) -> bool {
        info!(bot = %self.bot_name, "Unlocking parental account");

        for host in [WebHost::Community, WebHost::Store] {
            if !self.unlock_parental_for(host, code).await {
                warn!(bot = %self.bot_name, host = %host, "Parental unlock failed");
                return false;
            }
        }

        info!(bot = %self.bot_name, "Parental account unlocked");
        true
    }

    async fn unlock_parental_for(&self, host: WebHost, code: &str) -> bool {
        let Some(session_id) = self.cookies().get(self.domain(host), SESSION_COOKIE) else {
            warn!(bot = %self.bot_name, host = %host, "No session id for parental unlock");
            return false;
        };

        let endpoints = self.context.endpoints();
        let url = endpoints.url(host, PARENTAL_UNLOCK_PATH);
        let referer = endpoints.url(host, "");
        let form = FormData::new()
            .text("pin", code)
            .text(SESSION_COOKIE, session_id);

        for _ in 0..MAX_TRIES {
            let response = self
                .context
                .web_limiter()
                .limit(
                    host.as_str(),
                    self.browser.url_post(
                        &url,
                        &form,
                        Some(&referer),
                        RequestOptions::NONE,
                        MAX_TRIES,
                    ),
                )
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    debug!(bot = %self.bot_name, url = %url, error = %e, "Parental unlock request failed");
                    return false;
                }
            };

            // No refresh is possible while the session is being set up.
            if is_session_expired_uri(&response.final_uri) {
                return false;
            }

            if !self.is_profile_uri(&response.final_uri, false).await {
                return true;
            }
            debug!(bot = %self.bot_name, url = %url, "Parental unlock landed on own profile, retrying");
        }

        warn!(bot = %self.bot_name, url = %url, tries = MAX_TRIES, "Request failed too many times");
        false
    }

    /// Forgets the session. Cookies are dropped and the API key is resolved
    /// again after the next handshake.
    pub async fn on_disconnected(&self) {
        {
            let mut state = self.state.lock();
            state.initialized = false;
            state.last_check = None;
            state.last_refresh = None;
        }
        self.cookies().clear();
        self.api_key.reset().await;
    }

    // =========================================================================
    // Expiry & Refresh
    // =========================================================================

    fn min_validity(&self) -> Duration {
        self.context.global().min_session_validity()
    }

    /// Last answer, if the last check is recent enough to be reused.
    fn recent_check(&self) -> Option<bool> {
        let state = self.state.lock();
        let last_check = state.last_check?;
        (last_check.elapsed() < self.min_validity()).then(|| state.last_refresh != Some(last_check))
    }

    fn refreshed_since(&self, triggered_at: Instant) -> bool {
        let window = self.min_validity();
        self.state
            .lock()
            .last_refresh
            .is_some_and(|last_refresh| triggered_at < last_refresh + window)
    }

    /// Probes whether the session cookies are still accepted.
    ///
    /// Returns `None` when the probe itself failed.
    pub async fn is_session_expired(&self) -> Option<bool> {
        if let Some(expired) = self.recent_check() {
            return Some(expired);
        }

        let _gate = self.gate.lock().await;

        if let Some(expired) = self.recent_check() {
            return Some(expired);
        }

        let url = self
            .context
            .endpoints()
            .url(WebHost::Store, SESSION_PROBE_PATH);
        let response = self
            .context
            .web_limiter()
            .limit(
                WebHost::Store.as_str(),
                self.browser
                    .url_head(&url, None, RequestOptions::NONE, MAX_TRIES),
            )
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                debug!(bot = %self.bot_name, error = %e, "Session probe failed");
                return None;
            }
        };

        let expired = is_session_expired_uri(&response.final_uri);
        let now = Instant::now();
        let mut state = self.state.lock();
        if !expired {
            state.last_refresh = Some(now);
        }
        state.last_check = Some(now);

        debug!(bot = %self.bot_name, expired, "Session checked");
        Some(expired)
    }

    /// Re-runs the handshake unless that happened recently.
    pub async fn refresh_session(&self) -> bool {
        let Some(owner) = self.owner() else {
            return false;
        };
        if !owner.is_connected_and_logged_on() {
            return false;
        }

        let triggered_at = Instant::now();
        if self.refreshed_since(triggered_at) {
            return true;
        }

        let _gate = self.gate.lock().await;

        if self.refreshed_since(triggered_at) {
            return true;
        }
        if !owner.is_connected_and_logged_on() {
            return false;
        }

        info!(bot = %self.bot_name, "Refreshing web session");
        let refreshed = owner.refresh_session().await;

        if refreshed {
            let now = Instant::now();
            let mut state = self.state.lock();
            state.last_check = Some(now);
            state.last_refresh = Some(now);
        }
        refreshed
    }

    async fn wait_for_initialization(&self) -> bool {
        for _ in 0..self.context.global().connection_timeout_secs {
            if self.is_initialized() || !self.owner_logged_on() {
                break;
            }
            sleep(Duration::from_secs(1)).await;
        }
        self.is_initialized()
    }

    async fn is_profile_uri(&self, uri: &Url, wait_for_initialization: bool) -> bool {
        if wait_for_initialization && !self.wait_for_initialization().await {
            return false;
        }

        match self.profile_path() {
            Some(profile) => uri.path().trim_end_matches('/') == profile,
            None => false,
        }
    }

    /// Common preamble of the guarded wrappers. `Some(true)` means the
    /// session was just refreshed and the attempt should start over.
    async fn prepare(&self, check_first: bool, url: &str) -> Option<bool> {
        if check_first {
            if self.is_session_expired().await.unwrap_or(true) {
                if self.refresh_session().await {
                    return Some(true);
                }
                warn!(bot = %self.bot_name, url = %url, "Session refresh failed");
                return None;
            }
        } else {
            // Wait out a refresh already in progress.
            drop(self.gate.lock().await);
        }

        if !self.wait_for_initialization().await {
            warn!(bot = %self.bot_name, url = %url, "Web session is not initialized");
            return None;
        }
        Some(false)
    }

    // =========================================================================
    // Guarded Requests
    // =========================================================================

    /// Form POST with session handling. Returns whether the request went
    /// through.
    #[allow(clippy::too_many_arguments)]
    pub async fn post_with_session(
        &self,
        host: WebHost,
        path: &str,
        form: Option<FormData>,
        referer: Option<&str>,
        session_key: SessionKey,
        check_first: bool,
        max_tries: u8,
    ) -> bool {
        let url = self.context.endpoints().url(host, path);
        let mut form = form.unwrap_or_default();

        for _ in 0..max_tries {
            match self.prepare(check_first, &url).await {
                Some(true) => continue,
                Some(false) => {}
                None => return false,
            }

            if let Some(field) = session_key.field_name() {
                let Some(session_id) = self.cookies().get(self.domain(host), SESSION_COOKIE) else {
                    warn!(bot = %self.bot_name, host = %host, "No session id to inject");
                    return false;
                };
                form.insert(field, session_id);
            }

            let response = self
                .context
                .web_limiter()
                .limit(
                    host.as_str(),
                    self.browser
                        .url_post(&url, &form, referer, RequestOptions::NONE, MAX_TRIES),
                )
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    debug!(bot = %self.bot_name, url = %url, error = %e, "Request failed");
                    return false;
                }
            };

            if is_session_expired_uri(&response.final_uri) {
                if self.refresh_session().await {
                    continue;
                }
                warn!(bot = %self.bot_name, url = %url, "Session refresh failed");
                return false;
            }

            if self.is_profile_uri(&response.final_uri, true).await {
                debug!(bot = %self.bot_name, url = %url, "Request landed on own profile, retrying");
                continue;
            }

            return true;
        }

        warn!(bot = %self.bot_name, url = %url, tries = max_tries, "Request failed too many times");
        false
    }

    /// GET with session handling. Returns the page body.
    pub async fn get_html_with_session(
        &self,
        host: WebHost,
        path: &str,
        check_first: bool,
        max_tries: u8,
    ) -> Option<String> {
        let url = self.context.endpoints().url(host, path);

        for _ in 0..max_tries {
            if self.prepare(check_first, &url).await? {
                continue;
            }

            let response = self
                .context
                .web_limiter()
                .limit(
                    host.as_str(),
                    self.browser
                        .url_get_to_string(&url, None, RequestOptions::NONE, MAX_TRIES),
                )
                .await;

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    debug!(bot = %self.bot_name, url = %url, error = %e, "Request failed");
                    return None;
                }
            };

            if is_session_expired_uri(&response.final_uri) {
                if self.refresh_session().await {
                    continue;
                }
                warn!(bot = %self.bot_name, url = %url, "Session refresh failed");
                return None;
            }

            if self.is_profile_uri(&response.final_uri, true).await {
                debug!(bot = %self.bot_name, url = %url, "Request landed on own profile, retrying");
                continue;
            }

            return Some(response.content);
        }

        warn!(bot = %self.bot_name, url = %url, tries = max_tries, "Request failed too many times");
        None
    }

    // =========================================================================
    // API Key
    // =========================================================================

    /// The account's web API key. Empty when the account cannot have one.
    pub async fn api_key(&self) -> (bool, String) {
        self.api_key.get_value(Fallback::FailedNow).await
    }

    /// `Some(true)` with a usable key, `Some(false)` when none can exist,
    /// `None` when it could not be determined.
    pub async fn has_valid_api_key(&self) -> Option<bool> {
        let (success, key) = self.api_key().await;
        success.then(|| !key.is_empty())
    }

    async fn resolve_api_key(&self) -> (bool, String) {
        if self.owner().is_some_and(|owner| owner.is_account_limited()) {
            return (true, String::new());
        }

        let mut state = self.api_key_state().await;

        if state == ApiKeyState::NotRegisteredYet {
            if !self.register_api_key().await {
                return (false, String::new());
            }
            state = self.api_key_state().await;
            if state == ApiKeyState::NotRegisteredYet {
                state = ApiKeyState::Error;
            }
        }

        match state {
            ApiKeyState::Registered(key) => (true, key),
            ApiKeyState::AccessDenied => (true, String::new()),
            ApiKeyState::Timeout => (false, String::new()),
            state => {
                warn!(bot = %self.bot_name, ?state, "Unexpected API key page");
                (false, String::new())
            }
        }
    }

    async fn api_key_state(&self) -> ApiKeyState {
        match self
            .get_html_with_session(WebHost::Community, API_KEY_PATH, true, MAX_TRIES)
            .await
        {
            Some(html) => parse_api_key_page(&html),
            None => ApiKeyState::Timeout,
        }
    }

    async fn register_api_key(&self) -> bool {
        info!(bot = %self.bot_name, "Registering web API key");

        let form = FormData::new()
            .text("agreeToTerms", "agreed")
            .text("domain", "localhost")
            .text("Submit", "Register");
        let referer = self.context.endpoints().url(WebHost::Community, "/dev/apikey");

        self.post_with_session(
            WebHost::Community,
            API_KEY_REGISTER_PATH,
            Some(form),
            Some(&referer),
            SessionKey::Lowercase,
            true,
            MAX_TRIES,
        )
        .await
    }
}

impl std::fmt::Debug for WebSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSession")
            .field("bot_name", &self.bot_name)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

fn local_offset_secs() -> i32 {
    time::UtcOffset::current_local_offset()
        .map(|offset| offset.whole_seconds())
        .unwrap_or(0)
}

/// Login pages and the lost-auth sentinel host mean the session is gone.
fn is_session_expired_uri(uri: &Url) -> bool {
    uri.path().starts_with("/login") || uri.host_str() == Some(LOST_AUTH_HOST)
}

static TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<div[^>]*\bid\s*=\s*["']mainContents["'][^>]*>.*?<h2[^>]*>(.*?)</h2>"#)
        .expect("TITLE_RE should compile")
});

static BODY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<div[^>]*\bid\s*=\s*["']bodyContents_ex["'][^>]*>.*?<p[^>]*>(.*?)</p>"#)
        .expect("BODY_RE should compile")
});

static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*>").expect("TAG_RE should compile"));

fn inner_text(re: &Regex, html: &str) -> Option<String> {
    let inner = re.captures(html)?.get(1)?.as_str();
    Some(TAG_RE.replace_all(inner, "").trim().to_string())
}

fn parse_api_key_page(html: &str) -> ApiKeyState {
    let Some(title) = inner_text(&TITLE_RE, html) else {
        return ApiKeyState::Timeout;
    };
    if title.is_empty() {
        return ApiKeyState::Error;
    }
    if title.contains("Access Denied") || title.contains("Validated email address required") {
        return ApiKeyState::AccessDenied;
    }

    let Some(text) = inner_text(&BODY_RE, html) else {
        return ApiKeyState::Error;
    };
    if text.contains("Registering for a Steam Web API Key") {
        return ApiKeyState::NotRegisteredYet;
    }

    let Some((_, key)) = text.split_once("Key: ") else {
        return ApiKeyState::Error;
    };
    let key = key.trim();
    if key.len() == 32 && key.chars().all(|c| c.is_ascii_hexdigit()) {
        ApiKeyState::Registered(key.to_string())
    } else {
        ApiKeyState::Error
    }
}
