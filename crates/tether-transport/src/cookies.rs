//! Host-scoped cookie jar shared between the web session and the HTTP client.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use reqwest::Url;
use reqwest::cookie::CookieStore;
use reqwest::header::HeaderValue;
use tracing::trace;

/// Cookies keyed by host, then by name.
///
/// A cookie set for `example.com` is also sent to its subdomains.
#[derive(Debug, Default)]
pub struct SessionCookieStore {
    hosts: RwLock<HashMap<String, BTreeMap<String, String>>>,
}

impl SessionCookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host: &str, name: &str, value: &str) {
        self.hosts
            .write()
            .entry(host.to_ascii_lowercase())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    /// Looks up the value that would be sent to `host` under `name`.
    pub fn get(&self, host: &str, name: &str) -> Option<String> {
        let host = host.to_ascii_lowercase();
        self.hosts
            .read()
            .iter()
            .filter(|(domain, _)| domain_matches(&host, domain))
            .find_map(|(_, cookies)| cookies.get(name).cloned())
    }

    pub fn clear(&self) {
        self.hosts.write().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().values().all(BTreeMap::is_empty)
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host
            .strip_suffix(domain)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

impl CookieStore for SessionCookieStore {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let Some(host) = url.host_str() else {
            return;
        };

        for header in cookie_headers {
            let Ok(header) = header.to_str() else {
                continue;
            };
            let pair = header.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                trace!(host = %host, cookie = %name.trim(), "Storing cookie");
                self.set(host, name.trim(), value.trim());
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let host = url.host_str()?.to_ascii_lowercase();
        let hosts = self.hosts.read();

        let header = hosts
            .iter()
            .filter(|(domain, _)| domain_matches(&host, domain))
            .flat_map(|(_, cookies)| cookies.iter())
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");

        if header.is_empty() {
            return None;
        }
        HeaderValue::from_str(&header).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookies_apply_to_subdomains_only() {
        let store = SessionCookieStore::new();
        store.set("example.com", "sessionid", "abc");

        assert_eq!(store.get("www.example.com", "sessionid").as_deref(), Some("abc"));
        assert_eq!(store.get("badexample.com", "sessionid"), None);

        let url = Url::parse("https://www.example.com/path").unwrap();
        assert_eq!(store.cookies(&url).unwrap(), "sessionid=abc");
    }

    #[test]
    fn test_set_cookie_headers_are_parsed() {
        let store = SessionCookieStore::new();
        let url = Url::parse("https://store.example.com/").unwrap();
        let headers = [HeaderValue::from_static("browserid=42; Path=/; Secure")];

        store.set_cookies(&mut headers.iter(), &url);

        assert_eq!(store.get("store.example.com", "browserid").as_deref(), Some("42"));
        store.clear();
        assert!(store.is_empty());
    }
}
