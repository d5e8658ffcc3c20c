//! # Tether Transport
//!
//! HTTP request execution for the Tether session client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────┐
//! │  Web session        │  (tether-runtime)
//! ├─────────────────────┤
//! │  WebLimiter         │  per-host concurrency and start-rate gates
//! ├─────────────────────┤
//! │  WebBrowser         │  <- manual redirects, bounded retries
//! ├─────────────────────┤
//! │  SessionCookieStore │  host-scoped cookie jar
//! └─────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tether_transport::{RequestOptions, WebBrowser, WebLimiter};
//!
//! let browser = WebBrowser::builder().timeout(Duration::from_secs(90)).build()?;
//! let limiter = WebLimiter::with_delay(Duration::from_millis(300), ["store.example.com"]);
//!
//! let page = limiter
//!     .limit("store.example.com", browser.url_get_to_string(
//!         "https://store.example.com/account",
//!         None,
//!         RequestOptions::NONE,
//!         5,
//!     ))
//!     .await?;
//! ```

pub mod browser;
pub mod cookies;
pub mod error;
pub mod limiter;

pub use browser::{
    BasicResponse, EXTENDED_TIMEOUT_MULTIPLIER, FormData, HttpResponse, MOBILE_SCHEME,
    RequestOptions, StringResponse, WebBrowser, WebBrowserBuilder, WebResponse,
};
pub use cookies::SessionCookieStore;
pub use error::{WebError, WebResult};
pub use limiter::{RateGate, WebLimiter};
