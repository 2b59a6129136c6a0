use std::{fs, path::{Path, PathBuf}, sync::Arc, time::Duration};
use serde::Deserialize;
use config::Config;
use tokio_rustls::rustls::{
    Certificate, PrivateKey, RootCertStore, ServerConfig as RustlsServerConfig,
};
use rustls_pemfile::{certs, Item};
use pkcs8::{EncryptedPrivateKeyInfo, SecretDocument};
use tracing::debug;

use crate::server::tls::{AcceptAnyClientCertificate, GeminiAcceptor, PeerValidator};
use crate::utils::error::GeminiError;

/// Default Gemini port.
pub const DEFAULT_PORT: u16 = 1965;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// Configuration settings for the Gemini server.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address the listener binds to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// The port on which the server will listen.
    #[serde(default = "default_port")]
    pub port: u16,
    /// PEM certificate chain presented to clients.
    pub cert_path: PathBuf,
    /// PEM private key matching `cert_path`.
    pub key_path: PathBuf,
    /// Passphrase for an encrypted PKCS#8 key.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Maximum number of simultaneous sessions; unbounded when unset.
    #[serde(default)]
    pub max_connections: Option<usize>,
    /// New connections allowed per second per peer IP; unlimited when unset.
    #[serde(default)]
    pub connection_rate_limit: Option<u32>,
    /// Port of the Prometheus endpoint; disabled when unset.
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// Options passed through to the TLS layer.
    #[serde(default)]
    pub tls: TlsOptions,
}

/// Transport options passed through to the TLS layer.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    /// PEM bundle of issuers whose client certificates count as trusted.
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
    /// Upper bound on the TLS handshake.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Maximum TLS record size.
    #[serde(default)]
    pub max_fragment_size: Option<usize>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            client_ca_path: None,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_fragment_size: None,
        }
    }
}

impl TlsOptions {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_owned()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_handshake_timeout_secs() -> u64 {
    120
}

impl ServerConfig {
    /// Builds a configuration with every optional setting at its default.
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            passphrase: None,
            max_connections: None,
            connection_rate_limit: None,
            metrics_port: None,
            tls: TlsOptions::default(),
        }
    }

    /// Loads the server configuration from environment variables.
    ///
    /// Environment variables are prefixed with `GEMINI_`; nested TLS options use `__`,
    /// as in `GEMINI_TLS__CLIENT_CA_PATH`.
    ///
    /// # Errors
    /// Returns a `GeminiError::ConfigurationError` if the configuration cannot be loaded.
    pub fn from_env() -> Result<Self, GeminiError> {
        Config::builder()
            .add_source(
                config::Environment::with_prefix("GEMINI")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| GeminiError::ConfigurationError(e.to_string()))?
            .try_deserialize()
            .map_err(|e| GeminiError::ConfigurationError(e.to_string()))
    }

    /// Address string suitable for `TcpListener::bind`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Validates the configuration settings.
    ///
    /// # Errors
    /// Returns a `GeminiError::ConfigurationError` if validation fails.
    pub fn validate(&self) -> Result<(), GeminiError> {
        require_file("Certificate", &self.cert_path)?;
        require_file("Key", &self.key_path)?;

        if let Some(ca) = &self.tls.client_ca_path {
            require_file("Client CA", ca)?;
        }

        if self.passphrase.as_deref() == Some("") {
            return Err(GeminiError::ConfigurationError(
                "passphrase must not be empty".into(),
            ));
        }

        match self.max_connections {
            Some(0) => {
                return Err(GeminiError::ConfigurationError(
                    "max_connections must be greater than 0".into(),
                ))
            }
            Some(n) if n > 10_000 => {
                return Err(GeminiError::ConfigurationError(
                    "max_connections cannot exceed 10,000".into(),
                ))
            }
            _ => {}
        }

        if self.connection_rate_limit == Some(0) {
            return Err(GeminiError::ConfigurationError(
                "connection_rate_limit must be greater than 0".into(),
            ));
        }

        if self.tls.handshake_timeout_secs == 0 {
            return Err(GeminiError::ConfigurationError(
                "handshake_timeout_secs must be greater than 0".into(),
            ));
        }

        if let Some(size) = self.tls.max_fragment_size {
            if !(32..=16_389).contains(&size) {
                return Err(GeminiError::ConfigurationError(format!(
                    "max_fragment_size must be between 32 and 16389, got {}",
                    size
                )));
            }
        }

        Ok(())
    }

    /// Creates the TLS acceptor for Gemini connections.
    ///
    /// Loads the certificate chain and private key, offers the `gemini` protocol id and
    /// requests (without requiring) a client certificate.
    ///
    /// # Errors
    /// Returns a `GeminiError::ConfigurationError` if any part of the TLS setup fails.
    pub fn create_tls_acceptor(&self) -> Result<GeminiAcceptor, GeminiError> {
        let cert_chain = load_certificates(&self.cert_path)?;
        if cert_chain.is_empty() {
            return Err(GeminiError::ConfigurationError(format!(
                "No certificate found in {:?}",
                self.cert_path
            )));
        }
        let key = self.load_private_key()?;

        let mut config = RustlsServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(AcceptAnyClientCertificate))
            .with_single_cert(cert_chain, key)
            .map_err(|e| GeminiError::ConfigurationError(format!("TLS config error: {}", e)))?;

        config.max_fragment_size = self.tls.max_fragment_size;

        Ok(GeminiAcceptor::new(config))
    }

    /// Builds the validator for presented client chains from `tls.client_ca_path`.
    ///
    /// # Errors
    /// Returns a `GeminiError::ConfigurationError` if the bundle cannot be read.
    pub fn peer_validator(&self) -> Result<PeerValidator, GeminiError> {
        let mut roots = RootCertStore::empty();
        if let Some(path) = &self.tls.client_ca_path {
            let ders: Vec<Vec<u8>> = load_certificates(path)?.into_iter().map(|c| c.0).collect();
            let (added, ignored) = roots.add_parsable_certificates(&ders);
            debug!(added, ignored, "Loaded client CA roots from {:?}", path);
            if added == 0 {
                return Err(GeminiError::ConfigurationError(format!(
                    "No usable client CA certificate in {:?}",
                    path
                )));
            }
        }
        Ok(PeerValidator::new(roots))
    }

    fn load_private_key(&self) -> Result<PrivateKey, GeminiError> {
        let pem = fs::read_to_string(&self.key_path).map_err(|e| {
            GeminiError::ConfigurationError(format!("Key error: {} (path: {:?})", e, self.key_path))
        })?;

        match &self.passphrase {
            Some(passphrase) => decrypt_private_key(&pem, passphrase),
            None => {
                let items = rustls_pemfile::read_all(&mut pem.as_bytes()).map_err(|e| {
                    GeminiError::ConfigurationError(format!("Key parse error: {}", e))
                })?;
                items
                    .into_iter()
                    .find_map(|item| match item {
                        Item::PKCS8Key(der) | Item::RSAKey(der) | Item::ECKey(der) => {
                            Some(PrivateKey(der))
                        }
                        _ => None,
                    })
                    .ok_or_else(|| {
                        GeminiError::ConfigurationError(format!(
                            "No private key found in {:?}",
                            self.key_path
                        ))
                    })
            }
        }
    }
}

fn require_file(what: &str, path: &Path) -> Result<(), GeminiError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(GeminiError::ConfigurationError(format!(
            "{} file not found: {:?}",
            what, path
        )))
    }
}

fn load_certificates(path: &Path) -> Result<Vec<Certificate>, GeminiError> {
    let pem = fs::read(path).map_err(|e| {
        GeminiError::ConfigurationError(format!("Certificate error: {} (path: {:?})", e, path))
    })?;
    let ders = certs(&mut pem.as_slice())
        .map_err(|e| GeminiError::ConfigurationError(format!("Cert parse error: {}", e)))?;
    Ok(ders.into_iter().map(Certificate).collect())
}

fn decrypt_private_key(pem: &str, passphrase: &str) -> Result<PrivateKey, GeminiError> {
    let (label, document) = SecretDocument::from_pem(pem)
        .map_err(|e| GeminiError::ConfigurationError(format!("Key parse error: {}", e)))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(GeminiError::ConfigurationError(format!(
            "A passphrase requires an {} key, found {}",
            ENCRYPTED_KEY_LABEL, label
        )));
    }

    let decrypted = EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .and_then(|info| info.decrypt(passphrase))
        .map_err(|e| GeminiError::ConfigurationError(format!("Key decryption failed: {}", e)))?;

    Ok(PrivateKey(decrypted.as_bytes().to_vec()))
}
