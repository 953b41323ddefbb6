//! Maps `(service, request class, user-requested seconds)` to an effective
//! per-call deadline. There is no error path: every input,
//! however nonsensical, produces a deadline.
use std::collections::HashMap;

use parking_lot::RwLock;

/// Online requests are user-facing; offline requests run in the background
/// (cron, task queue workers) and tolerate much longer per-call deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestClass {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeadlineLimits {
    pub default_seconds: f64,
    pub max_seconds: f64,
}

const FALLTHROUGH_ONLINE: DeadlineLimits = DeadlineLimits {
    default_seconds: 5.0,
    max_seconds: 10.0,
};
const FALLTHROUGH_OFFLINE: DeadlineLimits = DeadlineLimits {
    default_seconds: 5.0,
    max_seconds: 10.0,
};

/// Two independent (online, offline) tables from service name to
/// `{default, max}` seconds, seeded with built-in per-service defaults and
/// mutable at runtime via `set_limits`. Reads take a shared lock and never
/// block on a writer holding it only briefly, so reads stay effectively
/// lock-free in practice; writes are fully serialized.
pub struct DeadlineOracle {
    online: RwLock<HashMap<String, DeadlineLimits>>,
    offline: RwLock<HashMap<String, DeadlineLimits>>,
}

impl DeadlineOracle {
    pub fn new() -> Self {
        Self {
            online: RwLock::new(default_online_table()),
            offline: RwLock::new(default_offline_table()),
        }
    }

    /// `Resolve(service, isOffline, userSeconds?) -> seconds`.
    ///
    /// If `user_seconds` is absent, returns the package default for the
    /// request class (falling back to the global fallthrough default if the
    /// service is unrecognized). The result is then clamped to the package
    /// max (or the fallthrough max). Negative inputs are clamped to 0.
    pub fn resolve(&self, service: &str, class: RequestClass, user_seconds: Option<f64>) -> f64 {
        let table = match class {
            RequestClass::Online => &self.online,
            RequestClass::Offline => &self.offline,
        };
        let fallthrough = match class {
            RequestClass::Online => FALLTHROUGH_ONLINE,
            RequestClass::Offline => FALLTHROUGH_OFFLINE,
        };
        let limits = table.read().get(service).copied();
        let default_seconds = limits.map_or(fallthrough.default_seconds, |l| l.default_seconds);
        let max_seconds = limits.map_or(fallthrough.max_seconds, |l| l.max_seconds);

        let requested = user_seconds.unwrap_or(default_seconds);
        let clamped = requested.min(max_seconds);
        clamped.max(0.0)
    }

    /// Add or overwrite a per-service override for one request class.
    /// Additions overwrite prior values; they never merge partial fields.
    pub fn set_limits(
        &self,
        service: impl Into<String>,
        class: RequestClass,
        limits: DeadlineLimits,
    ) {
        let table = match class {
            RequestClass::Online => &self.online,
            RequestClass::Offline => &self.offline,
        };
        table.write().insert(service.into(), limits);
    }
}

impl Default for DeadlineOracle {
    fn default() -> Self {
        Self::new()
    }
}

fn default_online_table() -> HashMap<String, DeadlineLimits> {
    let mut m = HashMap::new();
    let entries: &[(&str, DeadlineLimits)] = &[
        (
            "datastore_v3",
            DeadlineLimits {
                default_seconds: 60.0,
                max_seconds: 270.0,
            },
        ),
        (
            "datastore_v4",
            DeadlineLimits {
                default_seconds: 60.0,
                max_seconds: 270.0,
            },
        ),
        (
            "urlfetch",
            DeadlineLimits {
                default_seconds: 5.0,
                max_seconds: 60.0,
            },
        ),
        (
            "taskqueue",
            DeadlineLimits {
                default_seconds: 5.0,
                max_seconds: 30.0,
            },
        ),
        (
            "blobstore",
            DeadlineLimits {
                default_seconds: 15.0,
                max_seconds: 30.0,
            },
        ),
        (
            "search",
            DeadlineLimits {
                default_seconds: 10.0,
                max_seconds: 60.0,
            },
        ),
        (
            "mail",
            DeadlineLimits {
                default_seconds: 30.0,
                max_seconds: 60.0,
            },
        ),
        (
            "images",
            DeadlineLimits {
                default_seconds: 30.0,
                max_seconds: 30.0,
            },
        ),
        (
            "memcache",
            DeadlineLimits {
                default_seconds: 5.0,
                max_seconds: 60.0,
            },
        ),
    ];
    for (service, limits) in entries {
        m.insert((*service).to_string(), *limits);
    }
    for other in [
        "modules",
        "logservice",
        "stubby",
        "file",
        "rdbms",
        "remote_socket",
        "app_config_service",
    ] {
        m.insert(other.to_string(), FALLTHROUGH_ONLINE);
    }
    m
}

fn default_offline_table() -> HashMap<String, DeadlineLimits> {
    let mut m = default_online_table();
    for raised in ["rdbms", "stubby", "urlfetch"] {
        let entry = m.entry(raised.to_string()).or_insert(FALLTHROUGH_ONLINE);
        entry.max_seconds = 600.0;
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_urlfetch_uses_user_value_under_max() {
        let oracle = DeadlineOracle::new();
        let d = oracle.resolve("urlfetch", RequestClass::Online, Some(30.0));
        assert_eq!(d, 30.0);
    }

    #[test]
    fn online_urlfetch_clamps_to_max() {
        let oracle = DeadlineOracle::new();
        let d = oracle.resolve("urlfetch", RequestClass::Online, Some(90.0));
        assert_eq!(d, 60.0);
    }

    #[test]
    fn offline_rdbms_allows_long_queries() {
        let oracle = DeadlineOracle::new();
        let d = oracle.resolve("rdbms", RequestClass::Offline, Some(300.0));
        assert_eq!(d, 300.0);
    }

    #[test]
    fn missing_user_seconds_uses_package_default() {
        let oracle = DeadlineOracle::new();
        let d = oracle.resolve("mail", RequestClass::Online, None);
        assert_eq!(d, 30.0);
    }

    #[test]
    fn unrecognized_service_uses_fallthrough() {
        let oracle = DeadlineOracle::new();
        let d = oracle.resolve("some_unknown_service", RequestClass::Online, Some(20.0));
        assert_eq!(d, 10.0);
    }

    #[test]
    fn negative_input_clamps_to_zero() {
        let oracle = DeadlineOracle::new();
        let d = oracle.resolve("datastore_v3", RequestClass::Online, Some(-5.0));
        assert_eq!(d, 0.0);
    }

    #[test]
    fn runtime_override_replaces_prior_value() {
        let oracle = DeadlineOracle::new();
        oracle.set_limits(
            "datastore_v3",
            RequestClass::Online,
            DeadlineLimits {
                default_seconds: 1.0,
                max_seconds: 2.0,
            },
        );
        assert_eq!(oracle.resolve("datastore_v3", RequestClass::Online, None), 1.0);
        assert_eq!(
            oracle.resolve("datastore_v3", RequestClass::Online, Some(100.0)),
            2.0
        );
    }
}
