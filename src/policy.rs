use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;

use crate::error::ServerError;

/// Navigation policy: a set of glob patterns matched against URL hosts.
///
/// Patterns follow glob syntax (`ads.example.com`, `*.doubleclick.net`).
/// An empty policy allows everything. Bad patterns are skipped with a
/// warning rather than taking the server down.
pub struct DomainPolicy {
    blocked: Option<GlobSet>,
}

impl DomainPolicy {
    /// Build from configured patterns.
    #[must_use]
    pub fn new(patterns: &[String]) -> Self {
        if patterns.is_empty() {
            return Self { blocked: None };
        }

        let mut builder = GlobSetBuilder::new();
        let mut any = false;
        for pattern in patterns {
            match Glob::new(pattern) {
                Ok(glob) => {
                    builder.add(glob);
                    any = true;
                }
                Err(e) => warn!(pattern, error = %e, "ignoring invalid blocked-domain pattern"),
            }
        }
        if !any {
            return Self { blocked: None };
        }

        match builder.build() {
            Ok(set) => Self { blocked: Some(set) },
            Err(e) => {
                warn!(error = %e, "blocked-domain set failed to build; allowing all");
                Self { blocked: None }
            }
        }
    }

    /// An empty, allow-everything policy.
    #[must_use]
    pub fn allow_all() -> Self {
        Self { blocked: None }
    }

    /// Check a URL against the policy.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::DomainBlocked` when the URL's host matches
    /// a blocked pattern. URLs without a host (e.g. `about:blank`) are
    /// always allowed.
    pub fn check(&self, url: &str) -> Result<(), ServerError> {
        let Some(blocked) = &self.blocked else {
            return Ok(());
        };
        let Some(host) = url::Url::parse(url).ok().and_then(|u| {
            u.host_str().map(ToOwned::to_owned)
        }) else {
            return Ok(());
        };
        if blocked.is_match(&host) {
            return Err(ServerError::DomainBlocked { host });
        }
        Ok(())
    }
}
