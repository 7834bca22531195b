//! Bridge builder and server assembly.

use crate::client_pool::{backend_tls_config, ClientPool};
use crate::connection::ws_handler;
use crate::descriptor::DescriptorRegistry;
use crate::error::{Error, Result};
use crate::shutdown;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Shared state handed to every connection.
#[derive(Debug)]
pub(crate) struct BridgeState {
    pub(crate) registry: Arc<DescriptorRegistry>,
    pub(crate) pool: ClientPool,
    pub(crate) default_target: String,
    pub(crate) max_calls_per_connection: usize,
}

/// The assembled bridge - entry point for the library.
///
/// # Example
///
/// ```rust,no_run
/// use grpc_websocket_bridge::{Bridge, DescriptorRegistry};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut registry = DescriptorRegistry::new();
/// registry.load_protos(&["greeter.proto".into()], &[])?;
///
/// let bridge = Bridge::builder()
///     .registry(registry)
///     .default_target("localhost:50051")
///     .build()?;
///
/// bridge.serve(([0, 0, 0, 0], 8080).into()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Bridge {
    state: Arc<BridgeState>,
}

impl Bridge {
    pub fn builder() -> BridgeBuilder {
        BridgeBuilder::new()
    }

    /// Convert the bridge into an axum router accepting WebSocket upgrades
    /// on `/` and `/ws`.
    pub fn into_router(self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .with_state(self.state)
    }

    /// Bind the port and serve until an OS shutdown signal arrives.
    ///
    /// Bind failure is the one fatal error; everything per-call is surfaced
    /// on the wire instead.
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(address = %addr, "WebSocket bridge listening");
        axum::serve(listener, self.into_router())
            .with_graceful_shutdown(shutdown::os_signal())
            .await?;
        Ok(())
    }
}

/// Builder for creating a [`Bridge`].
pub struct BridgeBuilder {
    registry: DescriptorRegistry,
    default_target: String,
    secure: bool,
    tls_ca: Option<PathBuf>,
    max_calls_per_connection: usize,
}

impl BridgeBuilder {
    pub fn new() -> Self {
        Self {
            registry: DescriptorRegistry::new(),
            default_target: "localhost:50051".to_string(),
            secure: false,
            tls_ca: None,
            max_calls_per_connection: 100,
        }
    }

    /// The descriptor registry to resolve methods against.
    pub fn registry(mut self, registry: DescriptorRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Fallback gRPC target for `start` frames without an explicit one.
    pub fn default_target(mut self, target: impl Into<String>) -> Self {
        self.default_target = target.into();
        self
    }

    /// Use TLS toward backend servers.
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Root CA bundle for backend TLS. Implies nothing unless
    /// [`Self::secure`] is set; without a bundle the system trust store is
    /// used.
    pub fn tls_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.tls_ca = Some(path.into());
        self
    }

    /// Cap on concurrent calls per connection (default 100).
    pub fn max_calls_per_connection(mut self, max: usize) -> Self {
        self.max_calls_per_connection = max;
        self
    }

    pub fn build(self) -> Result<Bridge> {
        if self.registry.is_empty() {
            return Err(Error::DescriptorLoad(
                "no services loaded; supply at least one proto file or descriptor set".to_string(),
            ));
        }

        let pool = if self.secure {
            ClientPool::with_tls(backend_tls_config(self.tls_ca.as_deref())?)
        } else {
            ClientPool::new()
        };

        Ok(Bridge {
            state: Arc::new(BridgeState {
                registry: Arc::new(self.registry),
                pool,
                default_target: self.default_target,
                max_calls_per_connection: self.max_calls_per_connection,
            }),
        })
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_registry;

    #[test]
    fn test_builder_defaults() {
        let builder = BridgeBuilder::new();
        assert_eq!(builder.default_target, "localhost:50051");
        assert!(!builder.secure);
        assert!(builder.tls_ca.is_none());
        assert_eq!(builder.max_calls_per_connection, 100);
    }

    #[test]
    fn test_build_requires_descriptors() {
        let err = Bridge::builder().build().unwrap_err();
        assert!(matches!(err, Error::DescriptorLoad(_)));
    }

    #[test]
    fn test_build_with_registry() {
        let bridge = Bridge::builder()
            .registry(test_registry())
            .default_target("localhost:9999")
            .max_calls_per_connection(8)
            .build()
            .unwrap();
        assert_eq!(bridge.state.default_target, "localhost:9999");
        assert_eq!(bridge.state.max_calls_per_connection, 8);

        let _router = bridge.into_router();
    }

    #[test]
    fn test_build_with_missing_ca_bundle_fails() {
        let err = Bridge::builder()
            .registry(test_registry())
            .secure(true)
            .tls_ca("/nonexistent/ca.pem")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
