use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::debug;

use super::connection::CdpConnection;
use super::error::CdpError;
use super::page::Page;

/// Cache TTL for both the source and data caches.
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Key used for probes without a domain hint.
const ANY_DOMAIN: &str = "*";

/// Cookie bridging for pages created in the default browser context.
///
/// New default-context tabs inherit cookies only from that context; when
/// the user is authenticated in some other open tab, this cache finds
/// that tab and copies its cookies over. Everything here is best-effort:
/// a failed bridge never fails the page creation, and zero cookies is a
/// valid outcome.
pub struct CookieBridge {
    /// domain key (or `"*"`) → (source target id, cached at).
    source_cache: Mutex<HashMap<String, (String, Instant)>>,
    /// source target id → (cookie array, cached at).
    data_cache: Mutex<HashMap<String, (Value, Instant)>>,
    /// domain key → in-flight probe; concurrent probes for the same
    /// domain coalesce onto the first one's outcome.
    in_flight: Mutex<HashMap<String, broadcast::Sender<Option<String>>>>,
    ttl: Duration,
}

impl Default for CookieBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(CACHE_TTL)
    }

    /// Construct with a custom TTL (tests).
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            source_cache: Mutex::new(HashMap::new()),
            data_cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Find a target with at least one cookie, preferring targets whose
    /// host matches `domain`.
    ///
    /// A fresh source-cache hit returns without touching CDP. Cache
    /// misses enumerate page targets, score them by domain affinity, and
    /// probe each in priority order with `Network.getAllCookies`.
    pub async fn find_authenticated_target(
        &self,
        conn: &CdpConnection,
        domain: Option<&str>,
    ) -> Option<String> {
        let key = domain.unwrap_or(ANY_DOMAIN).to_owned();

        {
            let cache = self.source_cache.lock().expect("source cache poisoned");
            if let Some((target_id, at)) = cache.get(&key) {
                if at.elapsed() < self.ttl {
                    return Some(target_id.clone());
                }
            }
        }

        enum Role {
            Leader(broadcast::Sender<Option<String>>),
            Follower(broadcast::Receiver<Option<String>>),
        }

        let role = {
            let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
            if let Some(tx) = in_flight.get(&key) {
                Role::Follower(tx.subscribe())
            } else {
                let (tx, _) = broadcast::channel(1);
                in_flight.insert(key.clone(), tx.clone());
                Role::Leader(tx)
            }
        };

        match role {
            Role::Follower(mut rx) => rx.recv().await.ok().flatten(),
            Role::Leader(tx) => {
                let found = self.scan_targets(conn, domain).await;
                if let Some(target_id) = &found {
                    let mut cache = self.source_cache.lock().expect("source cache poisoned");
                    cache.insert(key.clone(), (target_id.clone(), Instant::now()));
                }
                {
                    let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
                    if in_flight.get(&key).is_some_and(|t| t.same_channel(&tx)) {
                        in_flight.remove(&key);
                    }
                }
                let _ = tx.send(found.clone());
                found
            }
        }
    }

    async fn scan_targets(
        &self,
        conn: &CdpConnection,
        domain: Option<&str>,
    ) -> Option<String> {
        let targets = conn.send_browser("Target.getTargets", None).await.ok()?;
        let infos = targets["targetInfos"].as_array()?;

        let mut candidates: Vec<(u32, String)> = infos
            .iter()
            .filter_map(|info| {
                if info["type"].as_str() != Some("page") {
                    return None;
                }
                let target_url = info["url"].as_str()?;
                if !is_bridgeable_url(target_url) {
                    return None;
                }
                let host = url::Url::parse(target_url)
                    .ok()
                    .and_then(|u| u.host_str().map(ToOwned::to_owned))?;
                if let Some(wanted) = domain {
                    if excludes_localhost(&host, wanted) {
                        return None;
                    }
                }
                let score = domain.map_or(0, |wanted| domain_score(&host, wanted));
                let target_id = info["targetId"].as_str()?.to_owned();
                Some((score, target_id))
            })
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for (score, target_id) in candidates {
            if conn.attach_to_target(&target_id).await.is_err() {
                continue;
            }
            let Ok(result) = conn.send(&target_id, "Network.getAllCookies", None).await else {
                continue;
            };
            let has_cookies = result["cookies"]
                .as_array()
                .is_some_and(|cookies| !cookies.is_empty());
            if has_cookies {
                debug!(target = %target_id, score, "found authenticated target");
                let mut cache = self.data_cache.lock().expect("data cache poisoned");
                cache.insert(target_id.clone(), (result["cookies"].clone(), Instant::now()));
                return Some(target_id);
            }
        }
        None
    }

    /// Copy the source target's cookies onto the destination page.
    ///
    /// Uses the data cache when fresh; otherwise fetches and caches.
    ///
    /// # Errors
    ///
    /// Returns any [`CdpError`] from the fetch or `Network.setCookies`.
    /// Callers treat this as best-effort.
    pub async fn copy_cookies(
        &self,
        conn: &CdpConnection,
        source_target: &str,
        dest: &Page,
    ) -> Result<(), CdpError> {
        let cached = {
            let cache = self.data_cache.lock().expect("data cache poisoned");
            cache.get(source_target).and_then(|(cookies, at)| {
                (at.elapsed() < self.ttl).then(|| cookies.clone())
            })
        };

        let cookies = match cached {
            Some(cookies) => cookies,
            None => {
                conn.attach_to_target(source_target).await?;
                let result = conn
                    .send(source_target, "Network.getAllCookies", None)
                    .await?;
                let cookies = result["cookies"].clone();
                let mut cache = self.data_cache.lock().expect("data cache poisoned");
                cache.insert(source_target.to_owned(), (cookies.clone(), Instant::now()));
                cookies
            }
        };

        let params = cookie_set_params(&cookies);
        if params.is_empty() {
            // Zero cookies is a valid result; nothing to set.
            return Ok(());
        }
        dest.send("Network.setCookies", Some(json!({ "cookies": params })))
            .await?;
        Ok(())
    }

    /// Drop all cached state for a destroyed target.
    pub fn purge_target(&self, target_id: &str) {
        self.data_cache
            .lock()
            .expect("data cache poisoned")
            .remove(target_id);
        self.source_cache
            .lock()
            .expect("source cache poisoned")
            .retain(|_, (cached_target, _)| cached_target != target_id);
    }

    /// Drop every in-flight probe (force-reconnect path). Followers of a
    /// dropped probe observe `None`.
    pub fn clear_in_flight(&self) {
        self.in_flight
            .lock()
            .expect("in-flight map poisoned")
            .clear();
    }

    /// Number of cached source entries (observability / tests).
    #[must_use]
    pub fn source_cache_len(&self) -> usize {
        self.source_cache.lock().expect("source cache poisoned").len()
    }

    /// Number of cached cookie payloads (observability / tests).
    #[must_use]
    pub fn data_cache_len(&self) -> usize {
        self.data_cache.lock().expect("data cache poisoned").len()
    }

    /// Number of in-flight probes (observability / tests).
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().expect("in-flight map poisoned").len()
    }
}

/// Whether a target URL is a plausible cookie source. Internal pages,
/// blank tabs, and auth flows are excluded.
#[must_use]
pub fn is_bridgeable_url(target_url: &str) -> bool {
    if target_url.starts_with("chrome://")
        || target_url.starts_with("chrome-extension://")
        || target_url == "about:blank"
    {
        return false;
    }
    let path = url::Url::parse(target_url)
        .map(|u| u.path().to_owned())
        .unwrap_or_default();
    !(path.contains("/login") || path.contains("/signin") || path.contains("/auth"))
}

fn is_localhost(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1" || host == "[::1]"
}

/// When the wanted domain is an external host, localhost candidates are
/// never acceptable sources.
#[must_use]
pub fn excludes_localhost(candidate_host: &str, wanted_domain: &str) -> bool {
    !is_localhost(wanted_domain) && is_localhost(candidate_host)
}

/// Score a candidate host's affinity to the wanted domain.
///
/// Exact match = 100. Two or more labels matching right-to-left =
/// 50 + 10 × matching labels. Same TLD only = 10. Otherwise 0.
#[must_use]
pub fn domain_score(candidate_host: &str, wanted_domain: &str) -> u32 {
    if candidate_host == wanted_domain {
        return 100;
    }
    let candidate: Vec<&str> = candidate_host.rsplit('.').collect();
    let wanted: Vec<&str> = wanted_domain.rsplit('.').collect();
    let matching = candidate
        .iter()
        .zip(wanted.iter())
        .take_while(|(a, b)| a == b)
        .count();
    match matching {
        0 => 0,
        1 => 10,
        #[allow(clippy::cast_possible_truncation)]
        n => 50 + 10 * n as u32,
    }
}

/// Reduce `Network.getAllCookies` entries to the fields
/// `Network.setCookies` accepts.
#[must_use]
pub fn cookie_set_params(cookies: &Value) -> Vec<Value> {
    const KEEP: &[&str] = &[
        "name", "value", "domain", "path", "secure", "httpOnly", "sameSite", "expires",
    ];
    cookies
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|cookie| {
                    let obj = cookie.as_object()?;
                    let mut kept = serde_json::Map::new();
                    for key in KEEP {
                        if let Some(value) = obj.get(*key) {
                            kept.insert((*key).to_owned(), value.clone());
                        }
                    }
                    kept.contains_key("name").then(|| Value::Object(kept))
                })
                .collect()
        })
        .unwrap_or_default()
}
