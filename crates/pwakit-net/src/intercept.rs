//! Request routing: which intercepted requests may touch the store.

use http::Method;
use tracing::trace;

use crate::Request;

/// How the worker handles a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Straight to the network; never read from or written to the store.
    Bypass,
    /// Serve from the store, fall back to the network and populate.
    CacheFirst,
}

/// URL path pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlPattern {
    /// Exact path match.
    Exact(String),
    /// Path prefix.
    Prefix(String),
    /// Path suffix (e.g., file extension).
    Suffix(String),
    /// Path contains substring.
    Contains(String),
}

impl UrlPattern {
    /// Create an exact match pattern.
    pub fn exact(path: &str) -> Self {
        Self::Exact(path.to_string())
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::Prefix(prefix.to_string())
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self::Suffix(suffix.to_string())
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::Contains(substring.to_string())
    }

    /// Check if a request path matches this pattern.
    pub fn matches(&self, path: &str) -> bool {
        match self {
            UrlPattern::Exact(p) => path == p,
            UrlPattern::Prefix(p) => path.starts_with(p.as_str()),
            UrlPattern::Suffix(p) => path.ends_with(p.as_str()),
            UrlPattern::Contains(p) => path.contains(p.as_str()),
        }
    }
}

/// Rule mapping a pattern to a route.
#[derive(Debug, Clone)]
pub struct InterceptRule {
    /// Pattern to match.
    pub pattern: UrlPattern,
    /// Route to take.
    pub route: Route,
    /// Priority (higher = first).
    pub priority: i32,
}

/// Priority-ordered routing table.
#[derive(Debug, Clone)]
pub struct RequestRouter {
    rules: Vec<InterceptRule>,
    default_route: Route,
}

impl Default for RequestRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestRouter {
    /// Create a router that sends everything cache-first.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_route: Route::CacheFirst,
        }
    }

    /// Router whose only rule bypasses the application manifest endpoint.
    pub fn with_manifest_endpoint(endpoint: &str) -> Self {
        let mut router = Self::new();
        router.bypass(UrlPattern::exact(endpoint));
        router
    }

    /// Add a rule.
    pub fn add_rule(&mut self, rule: InterceptRule) {
        self.rules.push(rule);
        // Stable sort keeps insertion order among equal priorities
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Always send matching requests to the network.
    pub fn bypass(&mut self, pattern: UrlPattern) {
        self.add_rule(InterceptRule {
            pattern,
            route: Route::Bypass,
            priority: 10,
        });
    }

    /// Serve matching requests cache-first, overriding lower-priority bypasses.
    pub fn cache_first(&mut self, pattern: UrlPattern, priority: i32) {
        self.add_rule(InterceptRule {
            pattern,
            route: Route::CacheFirst,
            priority,
        });
    }

    /// Decide the route for a request. Only GETs are ever cached.
    pub fn route(&self, request: &Request) -> Route {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Non-GET request bypasses store");
            return Route::Bypass;
        }

        let path = request.url.path();
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(path))
            .map(|rule| rule.route)
            .unwrap_or(self.default_route)
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are installed.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
