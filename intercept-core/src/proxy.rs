use crate::{
    ca::CertificateAuthority, config::InterceptConfig, error::InterceptError,
    handlers::InterceptHandler, Result,
};
use hudsucker::{certificate_authority::RcgenAuthority, rustls, ProxyBuilder};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use tracing::info;

/// Number of minted host certificates kept by the authority.
const CERT_CACHE_SIZE: u64 = 1000;

pub struct ProxyServer {
    config: InterceptConfig,
    ca: CertificateAuthority,
    handler: InterceptHandler,
}

impl ProxyServer {
    pub fn new(config: InterceptConfig, ca: CertificateAuthority, handler: InterceptHandler) -> Self {
        Self { config, ca, handler }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.config.listen_address.parse().map_err(|e| {
            InterceptError::Configuration(format!(
                "Invalid listen address {}: {}",
                self.config.listen_address, e
            ))
        })?;
        Ok(SocketAddr::new(ip, self.config.listen_port))
    }

    /// Runs the MITM proxy until `shutdown` completes.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.listen_addr()?;
        info!("Starting intercepting proxy on {}", addr);

        // Hudsucker/Rustls expects DER, not PEM.
        let private_key = rustls::PrivateKey(self.ca.key_der());
        let ca_cert = rustls::Certificate(self.ca.cert_der()?);

        let authority = RcgenAuthority::new(private_key, ca_cert, CERT_CACHE_SIZE).map_err(|e| {
            InterceptError::Certificate(format!("Failed to create CA authority: {}", e))
        })?;

        let proxy = ProxyBuilder::new()
            .with_addr(addr)
            .with_rustls_client()
            .with_ca(authority)
            .with_http_handler(self.handler.clone())
            .with_websocket_handler(self.handler)
            .build();

        proxy
            .start(shutdown)
            .await
            .map_err(|e| InterceptError::Network(format!("Proxy failed: {}", e)))?;

        info!("Proxy stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiDispatcher;
    use crate::config::ApiConfig;
    use crate::dispatcher::ListenerDispatcher;
    use crate::session::Session;
    use std::sync::Arc;

    fn server(listen_address: &str) -> ProxyServer {
        let session = Arc::new(Session::default());
        let handler = InterceptHandler::new(
            Arc::new(ListenerDispatcher::new(session.clone(), session)),
            Arc::new(ApiDispatcher::new(ApiConfig::default())),
        );
        let config = InterceptConfig {
            listen_address: listen_address.to_string(),
            listen_port: 18080,
            ..InterceptConfig::default()
        };
        ProxyServer::new(config, CertificateAuthority::generate(1).unwrap(), handler)
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(
            server("127.0.0.1").listen_addr().unwrap(),
            "127.0.0.1:18080".parse::<SocketAddr>().unwrap()
        );
        assert!(matches!(
            server("not-an-ip").listen_addr(),
            Err(InterceptError::Configuration(_))
        ));
    }
}
