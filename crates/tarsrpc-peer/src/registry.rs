//! Endpoint resolution: registry first, local cache as a fallback.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ServantProxyConfig;
use crate::endpoint::{parse_endpoint_list, split_object_name, Endpoint};
use crate::error::{RegistryError, Result, RpcError};
use crate::sync::{lock_ignore_poison, read_ignore_poison, write_ignore_poison};

/// Service discovery. Returns raw endpoint strings for a servant name.
pub trait RegistryClient: Send + Sync + fmt::Debug {
    fn query(&self, servant: &str) -> std::result::Result<Vec<String>, RegistryError>;
}

/// Registry backed by an in-process table.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    servants: RwLock<HashMap<String, Vec<String>>>,
    failure: RwLock<Option<RegistryError>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, servant: impl Into<String>, endpoints: &[&str]) -> Self {
        self.insert(servant, endpoints.iter().map(|e| e.to_string()).collect());
        self
    }

    pub fn insert(&self, servant: impl Into<String>, endpoints: Vec<String>) {
        write_ignore_poison(&self.servants).insert(servant.into(), endpoints);
    }

    /// Make every query fail with `failure` until cleared with `None`.
    pub fn set_failure(&self, failure: Option<RegistryError>) {
        *write_ignore_poison(&self.failure) = failure;
    }
}

impl RegistryClient for StaticRegistry {
    fn query(&self, servant: &str) -> std::result::Result<Vec<String>, RegistryError> {
        if let Some(failure) = read_ignore_poison(&self.failure).clone() {
            return Err(failure);
        }
        match read_ignore_poison(&self.servants).get(servant) {
            Some(endpoints) if !endpoints.is_empty() => Ok(endpoints.clone()),
            _ => Err(RegistryError::Empty(servant.to_string())),
        }
    }
}

/// Keyed store of last known endpoints per (process, servant).
pub trait EndpointCache: Send + Sync + fmt::Debug {
    fn get(
        &self,
        process_id: &str,
        servant: &str,
        data_path: Option<&Path>,
    ) -> Result<Option<Vec<Endpoint>>>;

    fn save(
        &self,
        process_id: &str,
        servant: &str,
        endpoints: &[Endpoint],
        data_path: Option<&Path>,
    ) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    servants: BTreeMap<String, Vec<Endpoint>>,
}

/// One JSON file per process id under the data path. Without a data path
/// nothing is stored.
#[derive(Debug, Default)]
pub struct FileEndpointCache {
    write: Mutex<()>,
}

impl FileEndpointCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_path(data_path: &Path, process_id: &str) -> PathBuf {
        data_path.join(format!("{process_id}.endpoints.json"))
    }

    fn load(path: &Path) -> Result<CacheFile> {
        match fs::read(path) {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(CacheFile::default()),
            Err(err) => Err(err.into()),
        }
    }
}

impl EndpointCache for FileEndpointCache {
    fn get(
        &self,
        process_id: &str,
        servant: &str,
        data_path: Option<&Path>,
    ) -> Result<Option<Vec<Endpoint>>> {
        let Some(dir) = data_path else {
            return Ok(None);
        };
        let mut file = Self::load(&Self::file_path(dir, process_id))?;
        Ok(file.servants.remove(servant).filter(|e| !e.is_empty()))
    }

    fn save(
        &self,
        process_id: &str,
        servant: &str,
        endpoints: &[Endpoint],
        data_path: Option<&Path>,
    ) -> Result<()> {
        let Some(dir) = data_path else {
            return Ok(());
        };
        let _guard = lock_ignore_poison(&self.write);
        fs::create_dir_all(dir)?;

        let path = Self::file_path(dir, process_id);
        let mut file = Self::load(&path)?;
        file.servants.insert(servant.to_string(), endpoints.to_vec());

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        fs::rename(&tmp, &path)?;
        debug!(servant, path = %path.display(), "saved endpoint cache");
        Ok(())
    }
}

/// In-process cache, ignoring the data path.
#[derive(Debug, Default)]
pub struct MemoryEndpointCache {
    entries: Mutex<HashMap<(String, String), Vec<Endpoint>>>,
}

impl MemoryEndpointCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EndpointCache for MemoryEndpointCache {
    fn get(
        &self,
        process_id: &str,
        servant: &str,
        _data_path: Option<&Path>,
    ) -> Result<Option<Vec<Endpoint>>> {
        Ok(lock_ignore_poison(&self.entries)
            .get(&(process_id.to_string(), servant.to_string()))
            .cloned())
    }

    fn save(
        &self,
        process_id: &str,
        servant: &str,
        endpoints: &[Endpoint],
        _data_path: Option<&Path>,
    ) -> Result<()> {
        lock_ignore_poison(&self.entries).insert(
            (process_id.to_string(), servant.to_string()),
            endpoints.to_vec(),
        );
        Ok(())
    }
}

/// Resolves a proxy's endpoint list.
///
/// Direct object names (`Obj@endpoints`) and the locator itself never touch
/// the registry. Otherwise the registry is authoritative and every success
/// overwrites the cache; the cache is read only when the registry is
/// unreachable or has nothing for the servant.
#[derive(Debug, Clone)]
pub struct EndpointResolver {
    registry: Option<Arc<dyn RegistryClient>>,
    cache: Arc<dyn EndpointCache>,
    data_path: Option<PathBuf>,
}

impl EndpointResolver {
    pub fn new(
        registry: Option<Arc<dyn RegistryClient>>,
        cache: Arc<dyn EndpointCache>,
        data_path: Option<PathBuf>,
    ) -> Self {
        Self {
            registry,
            cache,
            data_path,
        }
    }

    pub fn resolve(&self, config: &ServantProxyConfig) -> Result<Vec<Endpoint>> {
        if let (_, Some(direct)) = split_object_name(&config.object_name) {
            return parse_endpoint_list(direct);
        }
        if let Some(locator) = &config.locator {
            if let (name, Some(direct)) = split_object_name(locator) {
                if name == config.simple_object_name {
                    return parse_endpoint_list(direct);
                }
            }
        }

        let servant = config.simple_object_name.as_str();
        match self.query(servant) {
            Ok(endpoints) => {
                if let Err(err) = self.cache.save(
                    &config.communicator_id,
                    servant,
                    &endpoints,
                    self.data_path.as_deref(),
                ) {
                    warn!(servant, error = %err, "failed to save endpoint cache");
                }
                Ok(endpoints)
            }
            Err(RpcError::Registry(err)) if err.allows_cache_fallback() => {
                let cached = self
                    .cache
                    .get(&config.communicator_id, servant, self.data_path.as_deref())
                    .unwrap_or_else(|cache_err| {
                        warn!(servant, error = %cache_err, "failed to read endpoint cache");
                        None
                    });
                match cached {
                    Some(endpoints) if !endpoints.is_empty() => {
                        warn!(
                            servant,
                            error = %err,
                            endpoints = endpoints.len(),
                            "registry lookup failed, using local cache"
                        );
                        Ok(endpoints)
                    }
                    _ => Err(RpcError::Config(format!(
                        "no endpoints for {servant}: {err}, and the local cache is empty"
                    ))),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn query(&self, servant: &str) -> Result<Vec<Endpoint>> {
        let registry = self.registry.as_ref().ok_or_else(|| {
            RegistryError::Unreachable("no registry client configured".to_string())
        })?;
        let raw = registry.query(servant)?;
        if raw.is_empty() {
            return Err(RegistryError::Empty(servant.to_string()).into());
        }

        let mut endpoints = Vec::with_capacity(raw.len());
        for entry in &raw {
            endpoints.extend(parse_endpoint_list(entry)?);
        }
        if endpoints.is_empty() {
            return Err(RegistryError::Empty(servant.to_string()).into());
        }
        debug!(servant, endpoints = endpoints.len(), "resolved endpoints from registry");
        Ok(endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommunicatorConfig, ProxyOptions};

    const SERVANT: &str = "Demo.EchoServer.EchoObj";

    fn config(object_name: &str) -> ServantProxyConfig {
        let communicator = CommunicatorConfig {
            id: "test-proc".into(),
            ..CommunicatorConfig::default()
        };
        ServantProxyConfig::new(object_name, &communicator, &ProxyOptions::default())
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "tarsrpc-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    #[test]
    fn registry_success_overwrites_cache() {
        let registry = Arc::new(StaticRegistry::new().with(SERVANT, &["tcp -h a -p 1"]));
        let cache = Arc::new(MemoryEndpointCache::new());
        cache
            .save("test-proc", SERVANT, &[Endpoint::tcp("stale", 9)], None)
            .expect("save should succeed");

        let resolver = EndpointResolver::new(Some(registry), cache.clone(), None);
        let endpoints = resolver.resolve(&config(SERVANT)).expect("should resolve");
        assert_eq!(endpoints, vec![Endpoint::tcp("a", 1)]);
        assert_eq!(
            cache.get("test-proc", SERVANT, None).expect("get"),
            Some(vec![Endpoint::tcp("a", 1)])
        );
    }

    #[test]
    fn unreachable_registry_falls_back_to_cache() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_failure(Some(RegistryError::Unreachable("down".into())));
        let cache = Arc::new(MemoryEndpointCache::new());
        cache
            .save("test-proc", SERVANT, &[Endpoint::tcp("cached", 2)], None)
            .expect("save should succeed");

        let resolver = EndpointResolver::new(Some(registry), cache, None);
        let endpoints = resolver.resolve(&config(SERVANT)).expect("should use cache");
        assert_eq!(endpoints[0].host, "cached");
    }

    #[test]
    fn rejected_query_does_not_fall_back() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_failure(Some(RegistryError::Rejected("denied".into())));
        let cache = Arc::new(MemoryEndpointCache::new());
        cache
            .save("test-proc", SERVANT, &[Endpoint::tcp("cached", 2)], None)
            .expect("save should succeed");

        let resolver = EndpointResolver::new(Some(registry), cache, None);
        assert!(matches!(
            resolver.resolve(&config(SERVANT)),
            Err(RpcError::Registry(RegistryError::Rejected(_)))
        ));
    }

    #[test]
    fn malformed_registry_answer_does_not_fall_back() {
        let registry = Arc::new(StaticRegistry::new().with(SERVANT, &["tcp -h a"]));
        let cache = Arc::new(MemoryEndpointCache::new());
        cache
            .save("test-proc", SERVANT, &[Endpoint::tcp("cached", 2)], None)
            .expect("save should succeed");

        let resolver = EndpointResolver::new(Some(registry), cache, None);
        assert!(matches!(
            resolver.resolve(&config(SERVANT)),
            Err(RpcError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn both_failing_is_a_config_error() {
        let resolver =
            EndpointResolver::new(None, Arc::new(MemoryEndpointCache::new()), None);
        assert!(matches!(
            resolver.resolve(&config(SERVANT)),
            Err(RpcError::Config(_))
        ));
    }

    #[test]
    fn direct_object_name_skips_registry() {
        let registry = Arc::new(StaticRegistry::new());
        registry.set_failure(Some(RegistryError::Rejected("must not be asked".into())));
        let resolver =
            EndpointResolver::new(Some(registry), Arc::new(MemoryEndpointCache::new()), None);
        let endpoints = resolver
            .resolve(&config("Demo.EchoServer.EchoObj@tcp -h a -p 1:tcp -h b -p 2"))
            .expect("direct list should parse");
        assert_eq!(endpoints.len(), 2);
    }

    #[test]
    fn file_cache_persists_across_instances() {
        let dir = temp_dir("cache");
        let endpoints = vec![Endpoint::tcp("a", 1).with_weight(3), Endpoint::tcp("b", 2)];

        FileEndpointCache::new()
            .save("proc", SERVANT, &endpoints, Some(&dir))
            .expect("save should succeed");
        FileEndpointCache::new()
            .save("proc", "Other.Obj", &[Endpoint::tcp("c", 3)], Some(&dir))
            .expect("second save should succeed");

        let loaded = FileEndpointCache::new()
            .get("proc", SERVANT, Some(&dir))
            .expect("get should succeed");
        assert_eq!(loaded, Some(endpoints));
        assert_eq!(
            FileEndpointCache::new()
                .get("other-proc", SERVANT, Some(&dir))
                .expect("missing file is not an error"),
            None
        );
        let _ = fs::remove_dir_all(&dir);
    }
}
