//! 关联的传输层：TCP，可选 TLS

use std::io;

use courier_core::{CourierError, PacsNodeConfig, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

/// 可读写的异步字节流
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// 到远端节点的连接工厂
pub struct Transport {
    host: String,
    port: u16,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsConnector>,
}

impl Transport {
    pub fn new(config: &PacsNodeConfig) -> Result<Self> {
        #[cfg(not(feature = "tls"))]
        if config.tls {
            return Err(CourierError::config(
                "配置启用了 TLS, 但程序编译时未启用 tls 特性",
            ));
        }

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            #[cfg(feature = "tls")]
            tls: if config.tls {
                Some(tls::connector())
            } else {
                None
            },
        })
    }

    pub async fn connect(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        debug!(host = %self.host, port = self.port, "TCP连接已建立");

        #[cfg(feature = "tls")]
        if let Some(connector) = &self.tls {
            let stream = tls::wrap(connector, &self.host, stream).await?;
            return Ok(Box::new(stream));
        }

        Ok(Box::new(stream))
    }
}

#[cfg(feature = "tls")]
mod tls {
    use std::io;
    use std::sync::Arc;

    use tokio::net::TcpStream;
    use tokio_rustls::client::TlsStream;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    pub(super) fn connector() -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    pub(super) async fn wrap(
        connector: &TlsConnector,
        host: &str,
        stream: TcpStream,
    ) -> io::Result<TlsStream<TcpStream>> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        connector.connect(server_name, stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "tls"))]
    #[test]
    fn test_tls_without_feature_is_config_error() {
        let config = PacsNodeConfig {
            tls: true,
            ..Default::default()
        };
        let err = Transport::new(&config).err().unwrap();
        assert_eq!(err.class(), courier_core::ErrorClass::Configuration);
    }

    #[tokio::test]
    async fn test_connection_refused_is_io_error() {
        // 先绑定再释放，得到一个当前无人监听的端口
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = PacsNodeConfig {
            port,
            ..Default::default()
        };
        let transport = Transport::new(&config).unwrap();
        assert!(transport.connect().await.is_err());
    }
}
