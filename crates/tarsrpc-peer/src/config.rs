use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::{Duration, Instant};

use tarsrpc_codec::{FrameConfig, ProtocolVersion};

use crate::balance::BalanceStrategy;
use crate::endpoint::{split_object_name, Endpoint};
use crate::sync::{lock_ignore_poison, read_ignore_poison, write_ignore_poison};

/// Process-wide client settings shared by every proxy of a communicator.
#[derive(Debug, Clone)]
pub struct CommunicatorConfig {
    /// Identifies this communicator, e.g. in the endpoint cache.
    pub id: String,
    /// Registry object name. `None` means only direct object names work.
    pub locator: Option<String>,
    /// Deadline for synchronous calls.
    pub sync_timeout: Duration,
    /// Deadline for asynchronous calls.
    pub async_timeout: Duration,
    /// Sessions opened per endpoint.
    pub connections: usize,
    /// String encoding on the wire. Only UTF-8 is supported; the
    /// communicator refuses to start with anything else.
    pub charset: String,
    pub module_name: String,
    /// Prefer endpoints in the caller's set division.
    pub enable_set: bool,
    pub set_division: Option<String>,
    /// Directory for the local endpoint cache.
    pub data_path: Option<PathBuf>,
    /// How often a proxy re-resolves its endpoints.
    pub refresh_interval: Duration,
    /// How often overdue tickets are expired.
    pub sweep_interval: Duration,
    /// Threads that decode responses and run async callbacks.
    pub worker_threads: usize,
    pub frame: FrameConfig,
}

impl CommunicatorConfig {
    /// Whether `charset` names UTF-8, ignoring case and the dash.
    pub fn charset_is_utf8(&self) -> bool {
        let charset = self.charset.trim();
        charset.eq_ignore_ascii_case("UTF-8") || charset.eq_ignore_ascii_case("UTF8")
    }
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            id: "tarsrpc".to_string(),
            locator: None,
            sync_timeout: Duration::from_secs(3),
            async_timeout: Duration::from_secs(3),
            connections: 1,
            charset: "UTF-8".to_string(),
            module_name: String::new(),
            enable_set: false,
            set_division: None,
            data_path: None,
            refresh_interval: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(50),
            worker_threads: 4,
            frame: FrameConfig::default(),
        }
    }
}

/// Per-stub choices made when a proxy is obtained.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Overrides the communicator's set division for this proxy.
    pub set_division: Option<String>,
    pub balance: BalanceStrategy,
    pub version: ProtocolVersion,
}

/// Configuration shared by every call through one proxy.
///
/// Everything is fixed at construction except the endpoint list, which is
/// swapped wholesale on refresh. Readers take a cheap `Arc` snapshot; at most
/// one thread refreshes at a time.
#[derive(Debug)]
pub struct ServantProxyConfig {
    pub communicator_id: String,
    /// Object name as given, possibly with a direct `@` endpoint list.
    pub object_name: String,
    /// Object name without the endpoint list.
    pub simple_object_name: String,
    pub locator: Option<String>,
    pub charset: String,
    pub module_name: String,
    pub sync_timeout: Duration,
    pub async_timeout: Duration,
    pub connections: usize,
    pub enable_set: bool,
    pub set_division: Option<String>,
    pub version: ProtocolVersion,
    pub refresh_interval: Duration,
    endpoints: RwLock<Arc<Vec<Endpoint>>>,
    refresh: Mutex<()>,
    last_refresh: Mutex<Option<Instant>>,
}

impl ServantProxyConfig {
    pub fn new(object_name: &str, communicator: &CommunicatorConfig, options: &ProxyOptions) -> Self {
        let (simple, _) = split_object_name(object_name);
        Self {
            communicator_id: communicator.id.clone(),
            object_name: object_name.trim().to_string(),
            simple_object_name: simple.to_string(),
            locator: communicator.locator.clone(),
            charset: communicator.charset.clone(),
            module_name: communicator.module_name.clone(),
            sync_timeout: communicator.sync_timeout,
            async_timeout: communicator.async_timeout,
            connections: communicator.connections.max(1),
            enable_set: communicator.enable_set,
            set_division: options
                .set_division
                .clone()
                .or_else(|| communicator.set_division.clone()),
            version: options.version,
            refresh_interval: communicator.refresh_interval,
            endpoints: RwLock::new(Arc::new(Vec::new())),
            refresh: Mutex::new(()),
            last_refresh: Mutex::new(None),
        }
    }

    /// Whether the object name carries its own endpoint list.
    pub fn is_direct(&self) -> bool {
        split_object_name(&self.object_name).1.is_some()
    }

    /// Set division used for endpoint preference, if set routing is on.
    pub fn active_set(&self) -> Option<&str> {
        if self.enable_set {
            self.set_division.as_deref()
        } else {
            None
        }
    }

    pub fn endpoints(&self) -> Arc<Vec<Endpoint>> {
        Arc::clone(&read_ignore_poison(&self.endpoints))
    }

    pub fn set_endpoints(&self, endpoints: Vec<Endpoint>) {
        *write_ignore_poison(&self.endpoints) = Arc::new(endpoints);
        *lock_ignore_poison(&self.last_refresh) = Some(Instant::now());
    }

    /// Whether the endpoint list is older than the refresh interval.
    pub fn refresh_due(&self, now: Instant) -> bool {
        match *lock_ignore_poison(&self.last_refresh) {
            Some(at) => now.saturating_duration_since(at) >= self.refresh_interval,
            None => true,
        }
    }

    /// Claim the refresh slot. `None` if another thread holds it.
    pub fn try_begin_refresh(&self) -> Option<MutexGuard<'_, ()>> {
        match self.refresh.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Record a refresh attempt without changing the endpoints, so a failing
    /// registry is not hammered on every call.
    pub fn touch_refresh(&self) {
        *lock_ignore_poison(&self.last_refresh) = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charset_accepts_utf8_spellings_only() {
        for charset in ["UTF-8", "utf-8", "utf8", " UTF8 "] {
            let config = CommunicatorConfig {
                charset: charset.into(),
                ..CommunicatorConfig::default()
            };
            assert!(config.charset_is_utf8(), "{charset}");
        }
        let gbk = CommunicatorConfig {
            charset: "GBK".into(),
            ..CommunicatorConfig::default()
        };
        assert!(!gbk.charset_is_utf8());
    }

    #[test]
    fn proxy_set_overrides_communicator_set() {
        let communicator = CommunicatorConfig {
            enable_set: true,
            set_division: Some("sz.a.1".into()),
            ..CommunicatorConfig::default()
        };
        let options = ProxyOptions {
            set_division: Some("gz.b.2".into()),
            ..ProxyOptions::default()
        };
        let config = ServantProxyConfig::new("Demo.A.Obj", &communicator, &options);
        assert_eq!(config.active_set(), Some("gz.b.2"));

        let plain = ServantProxyConfig::new(
            "Demo.A.Obj",
            &CommunicatorConfig::default(),
            &ProxyOptions::default(),
        );
        assert_eq!(plain.active_set(), None);
    }

    #[test]
    fn direct_object_name_is_detected() {
        let config = ServantProxyConfig::new(
            "Demo.A.Obj@tcp -h a -p 1",
            &CommunicatorConfig::default(),
            &ProxyOptions::default(),
        );
        assert!(config.is_direct());
        assert_eq!(config.simple_object_name, "Demo.A.Obj");
    }

    #[test]
    fn refresh_slot_is_exclusive() {
        let config = ServantProxyConfig::new(
            "Demo.A.Obj",
            &CommunicatorConfig::default(),
            &ProxyOptions::default(),
        );
        assert!(config.refresh_due(Instant::now()));

        let held = config.try_begin_refresh().expect("first claim should succeed");
        assert!(config.try_begin_refresh().is_none());
        drop(held);
        assert!(config.try_begin_refresh().is_some());

        config.set_endpoints(vec![Endpoint::tcp("a", 1)]);
        assert!(!config.refresh_due(Instant::now()));
        assert_eq!(config.endpoints().len(), 1);
    }
}
