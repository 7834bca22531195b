//! Client pool: cached gRPC channels keyed by `(target, service)`.
//!
//! Channels are built lazily so that an unreachable backend surfaces as a
//! per-call failure rather than at pool time, and are reused across every
//! concurrent call on the same key for the lifetime of the process.

use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::debug;

/// Build the TLS configuration for backend channels.
///
/// With a CA bundle, that bundle is the trust root; otherwise the system
/// trust store is used.
pub fn backend_tls_config(ca_bundle: Option<&Path>) -> Result<ClientTlsConfig> {
    match ca_bundle {
        Some(path) => {
            let pem = std::fs::read(path)?;
            Ok(ClientTlsConfig::new().ca_certificate(Certificate::from_pem(pem)))
        }
        None => Ok(ClientTlsConfig::new().with_native_roots()),
    }
}

/// Shared cache of backend channels.
#[derive(Clone, Default, Debug)]
pub struct ClientPool {
    tls: Option<ClientTlsConfig>,
    channels: Arc<RwLock<HashMap<(String, String), Channel>>>,
}

impl ClientPool {
    /// A plaintext pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool whose channels use TLS toward the backend.
    pub fn with_tls(tls: ClientTlsConfig) -> Self {
        Self {
            tls: Some(tls),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch the channel for `(target, service)`, connecting lazily on the
    /// first use of the key.
    pub fn channel(&self, target: &str, service: &str) -> Result<Channel> {
        let key = (target.to_string(), service.to_string());
        if let Some(channel) = self.channels.read().get(&key) {
            return Ok(channel.clone());
        }

        let channel = self.connect(target)?;
        debug!(target = %target, service = %service, "opened backend channel");
        // Keep the first channel on a concurrent race for the same key.
        Ok(self
            .channels
            .write()
            .entry(key)
            .or_insert(channel)
            .clone())
    }

    fn connect(&self, target: &str) -> Result<Channel> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let mut endpoint = Endpoint::from_shared(format!("{scheme}://{target}"))?;
        if let Some(tls) = &self.tls {
            endpoint = endpoint.tls_config(tls.clone())?;
        }
        Ok(endpoint.connect_lazy())
    }

    /// Number of cached channels.
    pub fn cached(&self) -> usize {
        self.channels.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_channel_for_unreachable_target() {
        // connect_lazy never dials, so this succeeds even with nothing
        // listening.
        let pool = ClientPool::new();
        assert!(pool.channel("localhost:1", "demo.Greeter").is_ok());
    }

    #[tokio::test]
    async fn test_channels_cached_per_key() {
        let pool = ClientPool::new();
        pool.channel("localhost:50051", "demo.Greeter").unwrap();
        pool.channel("localhost:50051", "demo.Greeter").unwrap();
        assert_eq!(pool.cached(), 1);

        pool.channel("localhost:50051", "other.Service").unwrap();
        pool.channel("localhost:50052", "demo.Greeter").unwrap();
        assert_eq!(pool.cached(), 3);
    }

    #[test]
    fn test_invalid_target_rejected() {
        let pool = ClientPool::new();
        assert!(pool.channel("not a target", "demo.Greeter").is_err());
    }

    #[test]
    fn test_tls_config_missing_ca_file() {
        let err = backend_tls_config(Some(Path::new("/nonexistent/ca.pem"))).unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }
}
