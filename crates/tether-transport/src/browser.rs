//! HTTP request executor with manual redirect handling and bounded retries.
//!
//! The underlying client never follows redirects on its own. [`WebBrowser::request`]
//! inspects every 3xx itself so that targets with non-HTTP schemes reach the
//! caller instead of failing inside the client.
//!
//! # Request flow
//!
//! ```text
//! url_get_to_string / url_head / url_post / url_post_to_json
//!   └─ attempt loop (max_tries)
//!        └─ request(): send ─▶ 2xx ─────────────▶ done
//!                             3xx + hops left ─▶ follow (same method, body, referer)
//!                             3xx, no hops ────▶ done
//!                             4xx ─────────────▶ done, never retried
//!                             5xx / I/O error ─▶ failed attempt
//! ```

use std::future::Future;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, LOCATION, REFERER};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};
use url::form_urlencoded::byte_serialize;

use tether_core::MAX_TRIES;

use crate::cookies::SessionCookieStore;
use crate::error::{WebError, WebResult};

/// Timeout multiplier for requests flagged with [`RequestOptions::EXTENDED_TIMEOUT`].
pub const EXTENDED_TIMEOUT_MULTIPLIER: u32 = 10;

/// Custom application scheme handed back to the caller unfollowed.
pub const MOBILE_SCHEME: &str = "steammobile";

// =============================================================================
// Request Options & Form Data
// =============================================================================

/// Flags tuning a single wrapper call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestOptions(u8);

impl RequestOptions {
    pub const NONE: Self = Self(0);
    /// Hand a 4xx response back instead of failing with [`WebError::ClientError`].
    pub const RETURN_CLIENT_ERRORS: Self = Self(1);
    /// Allow the request to run for [`EXTENDED_TIMEOUT_MULTIPLIER`] times the usual timeout.
    pub const EXTENDED_TIMEOUT: Self = Self(1 << 1);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for RequestOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// URL-encoded form body. Values are raw bytes so binary fields survive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormData {
    fields: Vec<(String, Vec<u8>)>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a text field.
    pub fn text(self, name: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.bytes(name, value.as_ref().as_bytes())
    }

    /// Adds a binary field.
    pub fn bytes(mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets `name`, replacing an existing value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Vec<u8>>) {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(field, _)| *field == name) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Encodes the body as `application/x-www-form-urlencoded`.
    pub fn encode(&self) -> String {
        self.fields
            .iter()
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    byte_serialize(name.as_bytes()).collect::<String>(),
                    byte_serialize(value).collect::<String>()
                )
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Raw outcome of [`WebBrowser::request`]. The body has not been read yet.
#[derive(Debug)]
pub struct HttpResponse {
    response: Response,
    url: Url,
}

impl HttpResponse {
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// URL of the last hop, including any inherited fragment.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Where the exchange ended: the redirect target of an unfollowed 3xx,
    /// otherwise the last URL requested.
    pub fn final_uri(&self) -> Url {
        self.response
            .headers()
            .get(LOCATION)
            .and_then(|location| location.to_str().ok())
            .and_then(|location| self.url.join(location).ok())
            .unwrap_or_else(|| self.url.clone())
    }

    pub fn into_inner(self) -> Response {
        self.response
    }
}

/// Status and final location of a request plus its decoded content.
#[derive(Debug, Clone)]
pub struct WebResponse<T> {
    pub status: StatusCode,
    pub final_uri: Url,
    pub content: T,
}

/// Response whose body was never read.
pub type BasicResponse = WebResponse<()>;

/// Response with the body read as text.
pub type StringResponse = WebResponse<String>;

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`WebBrowser`].
#[derive(Debug, Clone)]
pub struct WebBrowserBuilder {
    timeout: Duration,
    user_agent: Option<String>,
    cookies: Option<Arc<SessionCookieStore>>,
}

impl Default for WebBrowserBuilder {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(90),
            user_agent: None,
            cookies: None,
        }
    }
}

impl WebBrowserBuilder {
    /// Per-request timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Shares an existing cookie jar instead of creating a fresh one.
    pub fn cookies(mut self, cookies: Arc<SessionCookieStore>) -> Self {
        self.cookies = Some(cookies);
        self
    }

    pub fn build(self) -> WebResult<WebBrowser> {
        let cookies = self.cookies.unwrap_or_default();

        let mut builder = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .cookie_provider(cookies.clone());
        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent);
        }
        let client = builder
            .build()
            .map_err(|e| WebError::Client(e.to_string()))?;

        Ok(WebBrowser {
            client,
            cookies,
            timeout: self.timeout,
        })
    }
}

// =============================================================================
// Executor
// =============================================================================

/// HTTP executor bound to one cookie jar.
#[derive(Debug, Clone)]
pub struct WebBrowser {
    client: Client,
    cookies: Arc<SessionCookieStore>,
    timeout: Duration,
}

impl WebBrowser {
    pub fn builder() -> WebBrowserBuilder {
        WebBrowserBuilder::default()
    }

    pub fn cookies(&self) -> &Arc<SessionCookieStore> {
        &self.cookies
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sends one request, following up to `max_redirects` redirects by hand.
    ///
    /// Returns `None` when the request failed at the transport level or the
    /// server answered with something other than 2xx, 3xx or 4xx.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        form: Option<&FormData>,
        referer: Option<&str>,
        options: RequestOptions,
        max_redirects: u8,
    ) -> Option<HttpResponse> {
        let mut url = url;
        let mut redirects_left = max_redirects;

        loop {
            let response = match self.send(method.clone(), &url, form, referer, options).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(%method, %url, error = %e, "Request failed");
                    return None;
                }
            };

            let status = response.status();
            trace!(%method, %url, status = status.as_u16(), "Response received");

            if status.is_success() || status.is_client_error() {
                return Some(HttpResponse { response, url });
            }

            if !status.is_redirection() {
                debug!(%method, %url, status = status.as_u16(), "Server error");
                return None;
            }

            if redirects_left == 0 {
                return Some(HttpResponse { response, url });
            }

            let target = response
                .headers()
                .get(LOCATION)
                .and_then(|location| location.to_str().ok())
                .and_then(|location| url.join(location).ok());
            let Some(mut target) = target else {
                warn!(%url, status = status.as_u16(), "Redirect without a usable location");
                return Some(HttpResponse { response, url });
            };

            match target.scheme() {
                "http" | "https" => {}
                MOBILE_SCHEME => return Some(HttpResponse { response, url }),
                scheme => {
                    warn!(%url, scheme = %scheme, "Unrecognized redirect scheme");
                    return Some(HttpResponse { response, url });
                }
            }

            if target.fragment().is_none() {
                target.set_fragment(url.fragment());
            }

            redirects_left -= 1;
            url = target;
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &Url,
        form: Option<&FormData>,
        referer: Option<&str>,
        options: RequestOptions,
    ) -> reqwest::Result<Response> {
        let timeout = if options.contains(RequestOptions::EXTENDED_TIMEOUT) {
            self.timeout * EXTENDED_TIMEOUT_MULTIPLIER
        } else {
            self.timeout
        };

        let mut builder = self.client.request(method, url.clone()).timeout(timeout);
        if let Some(form) = form {
            builder = builder
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(form.encode());
        }
        if let Some(referer) = referer {
            builder = builder.header(REFERER, referer);
        }

        builder.send().await
    }

    /// Runs `request` up to `max_tries` times, reading each usable response
    /// with `read`. A `read` returning `None` counts as a failed attempt.
    #[allow(clippy::too_many_arguments)]
    async fn with_retries<T, F, Fut>(
        &self,
        method: Method,
        url: &str,
        form: Option<&FormData>,
        referer: Option<&str>,
        options: RequestOptions,
        max_tries: u8,
        read: F,
    ) -> WebResult<WebResponse<T>>
    where
        F: Fn(Response) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let parsed = Url::parse(url)?;

        for _ in 0..max_tries {
            let Some(response) = self
                .request(method.clone(), parsed.clone(), form, referer, options, MAX_TRIES)
                .await
            else {
                continue;
            };

            let status = response.status();
            let final_uri = response.final_uri();

            if status.is_client_error() {
                if !options.contains(RequestOptions::RETURN_CLIENT_ERRORS) {
                    return Err(WebError::ClientError {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                return match read(response.into_inner()).await {
                    Some(content) => Ok(WebResponse {
                        status,
                        final_uri,
                        content,
                    }),
                    None => Err(WebError::ClientError {
                        status: status.as_u16(),
                        url: url.to_string(),
                    }),
                };
            }

            if let Some(content) = read(response.into_inner()).await {
                return Ok(WebResponse {
                    status,
                    final_uri,
                    content,
                });
            }
        }

        if max_tries > 1 {
            warn!(url = %url, tries = max_tries, "Request failed too many times");
        }

        Err(WebError::TooManyTries {
            tries: max_tries,
            url: url.to_string(),
        })
    }

    /// HEAD request; the body is never read.
    pub async fn url_head(
        &self,
        url: &str,
        referer: Option<&str>,
        options: RequestOptions,
        max_tries: u8,
    ) -> WebResult<BasicResponse> {
        self.with_retries(Method::HEAD, url, None, referer, options, max_tries, |_| async {
            Some(())
        })
        .await
    }

    /// GET request with the body read as text.
    pub async fn url_get_to_string(
        &self,
        url: &str,
        referer: Option<&str>,
        options: RequestOptions,
        max_tries: u8,
    ) -> WebResult<StringResponse> {
        self.with_retries(Method::GET, url, None, referer, options, max_tries, read_text)
            .await
    }

    /// Form POST; the body is never read.
    pub async fn url_post(
        &self,
        url: &str,
        form: &FormData,
        referer: Option<&str>,
        options: RequestOptions,
        max_tries: u8,
    ) -> WebResult<BasicResponse> {
        self.with_retries(
            Method::POST,
            url,
            Some(form),
            referer,
            options,
            max_tries,
            |_| async { Some(()) },
        )
        .await
    }

    /// Form POST with the body read as text.
    pub async fn url_post_to_string(
        &self,
        url: &str,
        form: &FormData,
        referer: Option<&str>,
        options: RequestOptions,
        max_tries: u8,
    ) -> WebResult<StringResponse> {
        self.with_retries(
            Method::POST,
            url,
            Some(form),
            referer,
            options,
            max_tries,
            read_text,
        )
        .await
    }

    /// Form POST with the body decoded as JSON. Undecodable bodies count as
    /// failed attempts.
    pub async fn url_post_to_json<T>(
        &self,
        url: &str,
        form: &FormData,
        referer: Option<&str>,
        options: RequestOptions,
        max_tries: u8,
    ) -> WebResult<WebResponse<T>>
    where
        T: DeserializeOwned,
    {
        self.with_retries(
            Method::POST,
            url,
            Some(form),
            referer,
            options,
            max_tries,
            |response| async move {
                let url = response.url().clone();
                match response.json::<T>().await {
                    Ok(content) => Some(content),
                    Err(e) => {
                        debug!(%url, error = %e, "Failed to decode JSON body");
                        None
                    }
                }
            },
        )
        .await
    }
}

async fn read_text(response: Response) -> Option<String> {
    let url = response.url().clone();
    match response.text().await {
        Ok(text) => Some(text),
        Err(e) => {
            debug!(%url, error = %e, "Failed to read response body");
            None
        }
    }
}
