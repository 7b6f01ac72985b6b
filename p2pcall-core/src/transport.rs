//! Peer transport resolution
//!
//! Locates the [`PeerFactory`] used to create peer sessions. A transport
//! module can surface its constructor in several shapes: directly, behind a
//! `default` property, or as one of several named exports. The resolver
//! does not assume one convention; it runs an ordered list of
//! [`ResolveStrategy`]s against the module and takes the first hit.
//!
//! Resolution has two stages:
//!
//! 1. [`TransportResolver::resolve_constructor`] probes the statically linked
//!    module. Synchronous, best effort.
//! 2. [`TransportResolver::resolve_constructor_async`] performs exactly one
//!    fresh load through a [`TransportLoader`] and probes the result.
//!
//! If both fail the error is fatal for the call. There is no further retry.

use crate::peer::PeerFactory;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use thiserror::Error;

/// Transport resolution errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No loader is configured for the dynamic stage
    #[error("No static transport and no dynamic loader configured")]
    NoLoader,

    /// Dynamic load failed
    #[error("Transport module failed to load: {0}")]
    LoadFailed(String),

    /// Module loaded but no strategy found a constructor
    #[error("Transport module exposes no peer constructor (tried: {0})")]
    NoConstructor(String),
}

/// Shape of a loaded transport module
#[derive(Clone)]
pub enum TransportExport {
    /// A constructor
    Callable(Arc<dyn PeerFactory>),
    /// A namespace with properties in declaration order
    Object(Vec<(String, TransportExport)>),
    /// Any non-callable value
    Value(serde_json::Value),
}

impl std::fmt::Debug for TransportExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callable(factory) => f.debug_tuple("Callable").field(&factory.name()).finish(),
            Self::Object(props) => f
                .debug_map()
                .entries(props.iter().map(|(k, v)| (k, v)))
                .finish(),
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
        }
    }
}

impl TransportExport {
    /// Wrap a constructor
    pub fn callable(factory: Arc<dyn PeerFactory>) -> Self {
        Self::Callable(factory)
    }

    /// Build a namespace
    pub fn object<K: Into<String>>(props: impl IntoIterator<Item = (K, TransportExport)>) -> Self {
        Self::Object(props.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// The constructor, if this export is one
    pub fn as_callable(&self) -> Option<Arc<dyn PeerFactory>> {
        match self {
            Self::Callable(factory) => Some(factory.clone()),
            _ => None,
        }
    }

    /// Property lookup on a namespace
    pub fn get(&self, name: &str) -> Option<&TransportExport> {
        match self {
            Self::Object(props) => props.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }
}

/// One way of extracting a constructor from a module
pub trait ResolveStrategy: Send + Sync {
    /// Strategy name for logging
    fn name(&self) -> &'static str;

    /// Return the constructor this strategy recognises, if any
    fn extract(&self, module: &TransportExport) -> Option<Arc<dyn PeerFactory>>;
}

/// The module itself is the constructor
pub struct DirectCallable;

impl ResolveStrategy for DirectCallable {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn extract(&self, module: &TransportExport) -> Option<Arc<dyn PeerFactory>> {
        module.as_callable()
    }
}

/// The module is a namespace whose `default` property is the constructor
pub struct DefaultExport;

impl ResolveStrategy for DefaultExport {
    fn name(&self) -> &'static str {
        "default-export"
    }

    fn extract(&self, module: &TransportExport) -> Option<Arc<dyn PeerFactory>> {
        module.get("default").and_then(TransportExport::as_callable)
    }
}

/// First callable property of the namespace, in declaration order
pub struct NamedExportScan;

impl ResolveStrategy for NamedExportScan {
    fn name(&self) -> &'static str {
        "named-export"
    }

    fn extract(&self, module: &TransportExport) -> Option<Arc<dyn PeerFactory>> {
        match module {
            TransportExport::Object(props) => props.iter().find_map(|(_, v)| v.as_callable()),
            _ => None,
        }
    }
}

/// The standard strategy order: direct, `default`, then named exports
pub fn default_strategies() -> Vec<Box<dyn ResolveStrategy>> {
    vec![
        Box::new(DirectCallable),
        Box::new(DefaultExport),
        Box::new(NamedExportScan),
    ]
}

/// Loads a fresh copy of the transport module
#[async_trait]
pub trait TransportLoader: Send + Sync {
    /// Load the module
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::LoadFailed`] if the module is unavailable.
    async fn load(&self) -> Result<TransportExport, TransportError>;
}

/// Locates the peer constructor
pub struct TransportResolver {
    static_module: Option<TransportExport>,
    loader: Option<Arc<dyn TransportLoader>>,
    strategies: Vec<Box<dyn ResolveStrategy>>,
    resolved: OnceCell<Arc<dyn PeerFactory>>,
}

impl TransportResolver {
    /// Resolver over a statically linked module (if any)
    #[must_use]
    pub fn new(static_module: Option<TransportExport>) -> Self {
        Self {
            static_module,
            loader: None,
            strategies: default_strategies(),
            resolved: OnceCell::new(),
        }
    }

    /// Resolver with no static module; everything goes through `loader`
    #[must_use]
    pub fn dynamic(loader: Arc<dyn TransportLoader>) -> Self {
        Self::new(None).with_loader(loader)
    }

    /// Resolver over the transport compiled into this crate.
    ///
    /// With the `webrtc-transport` feature this is the webrtc-backed
    /// factory; without it the resolver starts empty.
    #[must_use]
    pub fn builtin(ice_servers: Vec<String>) -> Self {
        #[cfg(feature = "webrtc-transport")]
        {
            let factory = Arc::new(crate::webrtc_peer::WebRtcPeerFactory::new(ice_servers));
            Self::new(Some(TransportExport::callable(factory)))
        }
        #[cfg(not(feature = "webrtc-transport"))]
        {
            let _ = ice_servers;
            Self::new(None)
        }
    }

    /// Set the dynamic loader
    #[must_use]
    pub fn with_loader(mut self, loader: Arc<dyn TransportLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Append a strategy after the standard ones
    #[must_use]
    pub fn with_strategy(mut self, strategy: Box<dyn ResolveStrategy>) -> Self {
        self.strategies.push(strategy);
        self
    }

    fn probe(&self, module: &TransportExport) -> Option<Arc<dyn PeerFactory>> {
        self.strategies.iter().find_map(|strategy| {
            let found = strategy.extract(module);
            if let Some(factory) = &found {
                tracing::debug!(
                    strategy = strategy.name(),
                    factory = factory.name(),
                    "Peer constructor resolved"
                );
            }
            found
        })
    }

    fn strategy_names(&self) -> String {
        self.strategies
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Probe the statically linked module
    pub fn resolve_constructor(&self) -> Option<Arc<dyn PeerFactory>> {
        if let Some(factory) = self.resolved.get() {
            return Some(factory.clone());
        }
        let factory = self.probe(self.static_module.as_ref()?)?;
        Some(self.resolved.get_or_init(|| factory).clone())
    }

    /// Load the module once through the loader and probe it
    ///
    /// # Errors
    ///
    /// Returns error if there is no loader, the load fails, or the loaded
    /// module has no constructor.
    pub async fn resolve_constructor_async(&self) -> Result<Arc<dyn PeerFactory>, TransportError> {
        if let Some(factory) = self.resolved.get() {
            return Ok(factory.clone());
        }
        let loader = self.loader.as_ref().ok_or(TransportError::NoLoader)?;

        tracing::debug!("Loading transport module dynamically");
        let module = loader.load().await?;

        match self.probe(&module) {
            Some(factory) => Ok(self.resolved.get_or_init(|| factory).clone()),
            None => {
                tracing::error!(module = ?module, "Loaded transport module has no peer constructor");
                Err(TransportError::NoConstructor(self.strategy_names()))
            }
        }
    }

    /// Static stage, then the single dynamic attempt
    ///
    /// # Errors
    ///
    /// Returns the dynamic stage's error when both stages fail.
    pub async fn resolve(&self) -> Result<Arc<dyn PeerFactory>, TransportError> {
        if let Some(factory) = self.resolve_constructor() {
            return Ok(factory);
        }
        tracing::warn!("Static peer transport unavailable; falling back to dynamic load");
        self.resolve_constructor_async().await
    }
}

impl Default for TransportResolver {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::simulated::{SimulatedLoader, SimulatedPeerFactory};
    use serde_json::json;

    fn factory(name: &str) -> Arc<dyn PeerFactory> {
        Arc::new(SimulatedPeerFactory::named(name))
    }

    #[test]
    fn test_direct_callable() {
        let resolver = TransportResolver::new(Some(TransportExport::callable(factory("direct"))));
        assert_eq!(resolver.resolve_constructor().unwrap().name(), "direct");
    }

    #[test]
    fn test_default_export() {
        let module = TransportExport::object([
            ("version", TransportExport::Value(json!("1.0"))),
            ("default", TransportExport::callable(factory("wrapped"))),
        ]);
        let resolver = TransportResolver::new(Some(module));
        assert_eq!(resolver.resolve_constructor().unwrap().name(), "wrapped");
    }

    #[test]
    fn test_default_wins_over_earlier_named_export() {
        let module = TransportExport::object([
            ("Peer", TransportExport::callable(factory("named"))),
            ("default", TransportExport::callable(factory("default"))),
        ]);
        let resolver = TransportResolver::new(Some(module));
        assert_eq!(resolver.resolve_constructor().unwrap().name(), "default");
    }

    #[test]
    fn test_non_callable_default_falls_through_to_scan() {
        let module = TransportExport::object([
            ("default", TransportExport::Value(json!({"WEBRTC_SUPPORT": true}))),
            ("config", TransportExport::Value(json!(null))),
            ("SimplePeer", TransportExport::callable(factory("scanned"))),
            ("Other", TransportExport::callable(factory("later"))),
        ]);
        let resolver = TransportResolver::new(Some(module));
        assert_eq!(resolver.resolve_constructor().unwrap().name(), "scanned");
    }

    #[test]
    fn test_no_static_module() {
        let resolver = TransportResolver::new(None);
        assert!(resolver.resolve_constructor().is_none());

        let opaque = TransportResolver::new(Some(TransportExport::Value(json!(42))));
        assert!(opaque.resolve_constructor().is_none());
    }

    #[tokio::test]
    async fn test_async_without_loader() {
        let resolver = TransportResolver::new(None);
        let err = resolver.resolve_constructor_async().await.err().unwrap();
        assert_eq!(err, TransportError::NoLoader);
    }

    #[tokio::test]
    async fn test_async_load_then_cached() {
        let loader = Arc::new(SimulatedLoader::new(TransportExport::object([(
            "default",
            TransportExport::callable(factory("loaded")),
        )])));
        let resolver = TransportResolver::dynamic(loader.clone());

        assert_eq!(resolver.resolve().await.unwrap().name(), "loaded");
        assert_eq!(resolver.resolve().await.unwrap().name(), "loaded");
        assert_eq!(loader.load_count(), 1);
        assert!(resolver.resolve_constructor().is_some());
    }

    #[tokio::test]
    async fn test_async_module_without_constructor() {
        let loader = Arc::new(SimulatedLoader::new(TransportExport::Value(json!("nope"))));
        let resolver = TransportResolver::dynamic(loader.clone());
        let err = resolver.resolve().await.err().unwrap();
        assert!(matches!(err, TransportError::NoConstructor(ref tried) if tried.contains("named-export")));
        assert_eq!(loader.load_count(), 1);
    }

    struct NestedDefault;

    impl ResolveStrategy for NestedDefault {
        fn name(&self) -> &'static str {
            "nested-default"
        }

        fn extract(&self, module: &TransportExport) -> Option<Arc<dyn PeerFactory>> {
            module.get("default")?.get("default")?.as_callable()
        }
    }

    #[test]
    fn test_custom_strategy_appended() {
        let module = TransportExport::object([(
            "default",
            TransportExport::object([("default", TransportExport::callable(factory("deep")))]),
        )]);
        let plain = TransportResolver::new(Some(module.clone()));
        assert!(plain.resolve_constructor().is_none());

        let extended = TransportResolver::new(Some(module)).with_strategy(Box::new(NestedDefault));
        assert_eq!(extended.resolve_constructor().unwrap().name(), "deep");
    }
}
