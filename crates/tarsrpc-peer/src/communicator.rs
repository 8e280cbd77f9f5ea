use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tarsrpc_codec::{Codec, InterfaceDescriptor, ProtocolVersion, TarsCodec};
use tracing::{debug, info};

use crate::config::{CommunicatorConfig, ProxyOptions, ServantProxyConfig};
use crate::correlator::Correlator;
use crate::dispatch::{Dispatcher, Inbound};
use crate::error::{Result, RpcError};
use crate::proxy::ServantProxy;
use crate::registry::{EndpointCache, EndpointResolver, FileEndpointCache, RegistryClient};
use crate::session::{ConnectionPool, Connector, TcpConnector};
use crate::sweeper::TimeoutSweeper;
use crate::sync::lock_ignore_poison;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProxyKey {
    interface: String,
    object_name: String,
    set_division: Option<String>,
    version: ProtocolVersion,
}

/// Builder for [`Communicator`].
pub struct CommunicatorBuilder {
    config: CommunicatorConfig,
    registry: Option<Arc<dyn RegistryClient>>,
    cache: Option<Arc<dyn EndpointCache>>,
    connector: Option<Arc<dyn Connector>>,
    codecs: HashMap<String, Arc<dyn Codec>>,
    correlator: Option<Arc<Correlator>>,
}

impl CommunicatorBuilder {
    pub fn new(config: CommunicatorConfig) -> Self {
        Self {
            config,
            registry: None,
            cache: None,
            connector: None,
            codecs: HashMap::new(),
            correlator: None,
        }
    }

    pub fn registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Local endpoint cache. Defaults to [`FileEndpointCache`].
    pub fn cache(mut self, cache: Arc<dyn EndpointCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Session factory. Defaults to [`TcpConnector`].
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use `codec` for every proxy of the named interface.
    pub fn with_codec(mut self, interface: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        self.codecs.insert(interface.into(), codec);
        self
    }

    /// Share a correlator, e.g. to start request ids at a known value.
    pub fn correlator(mut self, correlator: Arc<Correlator>) -> Self {
        self.correlator = Some(correlator);
        self
    }

    pub fn build(self) -> Result<Communicator> {
        let config = self.config;
        if config.connections == 0 {
            return Err(RpcError::Config("connections must be at least 1".into()));
        }
        if !config.charset_is_utf8() {
            return Err(RpcError::Config(format!(
                "unsupported charset '{}' (only UTF-8)",
                config.charset
            )));
        }

        let correlator = self.correlator.unwrap_or_default();
        let sweeper = TimeoutSweeper::start(Arc::clone(&correlator), config.sweep_interval)?;
        let workers = Arc::new(WorkerPool::new("tarsrpc-client", config.worker_threads)?);
        let resolver = EndpointResolver::new(
            self.registry,
            self.cache
                .unwrap_or_else(|| Arc::new(FileEndpointCache::new()) as Arc<dyn EndpointCache>),
            config.data_path.clone(),
        );
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(TcpConnector::new(config.frame.clone(), config.sync_timeout)) as Arc<dyn Connector>
        });

        info!(id = %config.id, locator = ?config.locator, "communicator started");
        Ok(Communicator {
            config,
            correlator,
            workers,
            resolver,
            connector,
            codecs: self.codecs,
            default_codec: Arc::new(TarsCodec::new()),
            proxies: Mutex::new(HashMap::new()),
            sweeper: Mutex::new(Some(sweeper)),
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Client context: owns the correlator, its sweeper, the worker pool and
/// every proxy created through it.
pub struct Communicator {
    config: CommunicatorConfig,
    correlator: Arc<Correlator>,
    workers: Arc<WorkerPool>,
    resolver: EndpointResolver,
    connector: Arc<dyn Connector>,
    codecs: HashMap<String, Arc<dyn Codec>>,
    default_codec: Arc<dyn Codec>,
    proxies: Mutex<HashMap<ProxyKey, Arc<ServantProxy>>>,
    sweeper: Mutex<Option<TimeoutSweeper>>,
    shut_down: AtomicBool,
}

impl Communicator {
    pub fn new(config: CommunicatorConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: CommunicatorConfig) -> CommunicatorBuilder {
        CommunicatorBuilder::new(config)
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Codec registered for `interface`, or the default binary codec.
    pub fn codec_for(&self, interface: &str) -> Arc<dyn Codec> {
        self.codecs
            .get(interface)
            .map_or_else(|| Arc::clone(&self.default_codec), Arc::clone)
    }

    pub fn proxy(&self, object_name: &str, interface: Arc<InterfaceDescriptor>) -> Result<Arc<ServantProxy>> {
        self.proxy_with(object_name, interface, ProxyOptions::default())
    }

    /// Get or create the proxy for `object_name`.
    ///
    /// Proxies are cached per interface, object name, set division and
    /// protocol version.
    /// Creating one resolves its endpoints; that happens outside the cache
    /// lock, and a concurrent creator that loses the race discards its copy.
    pub fn proxy_with(
        &self,
        object_name: &str,
        interface: Arc<InterfaceDescriptor>,
        options: ProxyOptions,
    ) -> Result<Arc<ServantProxy>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RpcError::Shutdown);
        }
        let key = ProxyKey {
            interface: interface.name().to_string(),
            object_name: object_name.trim().to_string(),
            set_division: options.set_division.clone(),
            version: options.version,
        };
        if let Some(proxy) = lock_ignore_poison(&self.proxies).get(&key) {
            return Ok(Arc::clone(proxy));
        }

        let proxy = Arc::new(self.create_proxy(object_name, interface, &options)?);
        let mut proxies = lock_ignore_poison(&self.proxies);
        let winner = proxies.entry(key).or_insert_with(|| Arc::clone(&proxy));
        if !Arc::ptr_eq(winner, &proxy) {
            proxy.close();
        }
        Ok(Arc::clone(winner))
    }

    fn create_proxy(
        &self,
        object_name: &str,
        interface: Arc<InterfaceDescriptor>,
        options: &ProxyOptions,
    ) -> Result<ServantProxy> {
        let config = Arc::new(ServantProxyConfig::new(object_name, &self.config, options));
        let endpoints = self.resolver.resolve(&config)?;
        config.set_endpoints(endpoints);

        let codec = self.codec_for(interface.name());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&codec),
            Inbound::Responses(Arc::clone(&self.correlator)),
            Arc::clone(&self.workers),
        ));
        let pool = ConnectionPool::new(Arc::clone(&self.connector), dispatcher, config.connections);

        debug!(
            servant = %config.simple_object_name,
            endpoints = config.endpoints().len(),
            codec = codec.name(),
            "proxy created"
        );
        Ok(ServantProxy::new(
            config,
            interface,
            codec,
            options.balance.build(),
            self.resolver.clone(),
            pool,
            Arc::clone(&self.correlator),
            Arc::clone(&self.workers),
        ))
    }

    /// Close every proxy's sessions and stop background threads.
    ///
    /// Pending calls fail by timeout or disconnection.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let proxies: Vec<_> = lock_ignore_poison(&self.proxies).drain().map(|(_, p)| p).collect();
        for proxy in proxies {
            proxy.close();
        }
        if let Some(mut sweeper) = lock_ignore_poison(&self.sweeper).take() {
            sweeper.stop();
        }
        self.workers.shutdown();
        info!(id = %self.config.id, "communicator stopped");
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("id", &self.config.id)
            .field("proxies", &lock_ignore_poison(&self.proxies).len())
            .field("pending", &self.correlator.pending())
            .finish()
    }
}
