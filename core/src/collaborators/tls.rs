//! TLS listener factory (spec.md §6 (iii)).
//!
//! "Given `{keystorePath, keystorePassword, certificatesPath}` returns a
//! TLS listener enforcing TLSv1.3. Keystore format is PKCS#12. Relative
//! paths resolve under `certificatesPath`; absolute paths are used
//! verbatim. Missing keystore or wrong password is a fatal bind failure
//! for that listener."
//!
//! Built on `openssl`, already part of the teacher's dependency stack,
//! plus `tokio-openssl` for the async accept side.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use openssl::pkcs12::Pkcs12;
use openssl::ssl::{SslAcceptor, SslMethod, SslVerifyMode, SslVersion};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;

use crate::error::ConfigError;

/// A stream indistinguishable to callers whether or not it's wrapped in
/// TLS — `Listener::serve` only ever talks to this.
pub type BoxedStream = Pin<Box<dyn AsyncReadWrite>>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}

/// Given a plain accepted socket, wraps it in TLS (or not).
pub enum TlsListener {
    Plain,
    Tls(SslAcceptor),
}

impl TlsListener {
    pub async fn accept(&self, tcp: TcpStream) -> std::io::Result<BoxedStream> {
        match self {
            TlsListener::Plain => Ok(Box::pin(tcp)),
            TlsListener::Tls(acceptor) => {
                let ssl = openssl::ssl::Ssl::new(acceptor.context())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                let mut stream = SslStream::new(ssl, tcp)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Pin::new(&mut stream)
                    .accept()
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                Ok(Box::pin(stream))
            }
        }
    }
}

pub trait TlsListenerFactory: Send + Sync {
    /// Binds `addr` with `SO_REUSEADDR` and returns the bound socket plus
    /// a [`TlsListener`] wrapper to apply per accepted connection.
    fn bind(
        &self,
        addr: SocketAddr,
        keystore_path: Option<&Path>,
        keystore_password: Option<&str>,
        certificates_path: Option<&Path>,
    ) -> Result<(TcpListener, TlsListener), ConfigError>;
}

pub struct OpenSslTlsListenerFactory;

impl OpenSslTlsListenerFactory {
    fn resolve(path: &Path, certificates_path: Option<&Path>) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            match certificates_path {
                Some(base) => base.join(path),
                None => path.to_path_buf(),
            }
        }
    }
}

impl TlsListenerFactory for OpenSslTlsListenerFactory {
    fn bind(
        &self,
        addr: SocketAddr,
        keystore_path: Option<&Path>,
        keystore_password: Option<&str>,
        certificates_path: Option<&Path>,
    ) -> Result<(TcpListener, TlsListener), ConfigError> {
        let std_listener = std::net::TcpListener::bind(addr).map_err(|e| {
            ConfigError::KeystoreMissing(format!("bind {addr} failed: {e}"))
        })?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| ConfigError::KeystoreMissing(e.to_string()))?;
        let tcp_listener = TcpListener::from_std(std_listener)
            .map_err(|e| ConfigError::KeystoreMissing(e.to_string()))?;

        let Some(path) = keystore_path else {
            return Ok((tcp_listener, TlsListener::Plain));
        };
        let resolved = Self::resolve(path, certificates_path);
        let der = std::fs::read(&resolved)
            .map_err(|_| ConfigError::KeystoreMissing(resolved.display().to_string()))?;
        let pkcs12 = Pkcs12::from_der(&der)
            .map_err(|_| ConfigError::KeystorePassword(resolved.display().to_string()))?;
        let password = keystore_password.unwrap_or("");
        let parsed = pkcs12
            .parse2(password)
            .map_err(|_| ConfigError::KeystorePassword(resolved.display().to_string()))?;
        let cert = parsed
            .cert
            .ok_or_else(|| ConfigError::KeystorePassword(resolved.display().to_string()))?;
        let pkey = parsed
            .pkey
            .ok_or_else(|| ConfigError::KeystorePassword(resolved.display().to_string()))?;

        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())
            .map_err(|e| ConfigError::KeystorePassword(e.to_string()))?;
        builder
            .set_min_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| ConfigError::KeystorePassword(e.to_string()))?;
        builder
            .set_certificate(&cert)
            .map_err(|e| ConfigError::KeystorePassword(e.to_string()))?;
        builder
            .set_private_key(&pkey)
            .map_err(|e| ConfigError::KeystorePassword(e.to_string()))?;
        if let Some(chain) = parsed.ca {
            for extra in chain {
                builder
                    .add_extra_chain_cert(extra)
                    .map_err(|e| ConfigError::KeystorePassword(e.to_string()))?;
            }
        }
        builder.set_verify(SslVerifyMode::NONE);

        Ok((tcp_listener, TlsListener::Tls(builder.build())))
    }
}
