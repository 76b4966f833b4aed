//! Monitoring server lifecycle.
//!
//! [`start_server`] binds the listener and serves until the `shutdown`
//! future resolves, then returns so the caller can drain the runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use questvault_db::config::ServerSection;
use tokio::net::TcpListener;

use crate::router::build_router;
use crate::state::AppState;

/// Port used when nothing else is configured.
pub const DEFAULT_PORT: u16 = 8090;

/// Listener address for the monitoring server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind, e.g. `127.0.0.1`.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerConfig {
    fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        let raw = format!("{}:{}", self.host, self.port);
        raw.parse().map_err(|source| ServerError::Address { raw, source })
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("0.0.0.0"),
            port: DEFAULT_PORT,
        }
    }
}

impl From<&ServerSection> for ServerConfig {
    fn from(section: &ServerSection) -> Self {
        Self {
            host: section.host.clone(),
            port: section.port,
        }
    }
}

/// Serve `/health` and `/stats` until `shutdown` resolves.
///
/// # Errors
///
/// [`ServerError::Address`] for an unparsable host, [`ServerError::Bind`]
/// when the port is taken, [`ServerError::Serve`] if the accept loop dies.
pub async fn start_server<F>(config: &ServerConfig, state: Arc<AppState>, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.socket_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    tracing::info!(%addr, "Monitoring endpoints listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}

/// Failures of the monitoring listener.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// `host:port` is not a socket address.
    #[error("invalid listen address {raw}: {source}")]
    Address {
        /// The string that failed to parse.
        raw: String,
        /// Parser error.
        source: std::net::AddrParseError,
    },

    /// The listener could not bind.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: SocketAddr,
        /// Socket error.
        source: std::io::Error,
    },

    /// The accept loop stopped with an I/O error.
    #[error("monitoring server stopped: {0}")]
    Serve(#[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_follows_the_yaml_section() {
        let section = ServerSection {
            host: String::from("127.0.0.1"),
            port: 9191,
        };
        let config = ServerConfig::from(&section);
        let addr = config.socket_addr();
        assert!(addr.is_ok());
        let Ok(addr) = addr else { return };
        assert_eq!(addr.port(), 9191);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn bad_host_is_an_address_error() {
        let config = ServerConfig {
            host: String::from("not a host"),
            port: DEFAULT_PORT,
        };
        assert!(matches!(config.socket_addr(), Err(ServerError::Address { .. })));
    }
}
