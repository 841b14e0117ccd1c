use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use thiserror::Error;

use crate::access::{RoleParseError, StaticRoles};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both ROOMKEEPER_TLS_CERT and ROOMKEEPER_TLS_KEY must be set, or neither")]
    PartialTls,
    #[error("ROOMKEEPER_ROLES: {0}")]
    Roles(#[from] RoleParseError),
    #[error("TLS setup: {0}")]
    Tls(#[from] io::Error),
}

/// Server settings, read once at startup from `ROOMKEEPER_*` variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls: Option<(PathBuf, PathBuf)>,
    pub metrics_port: Option<u16>,
    pub roles: StaticRoles,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(var) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::Invalid { var, value }),
            }
        }

        let tls = match (lookup("ROOMKEEPER_TLS_CERT"), lookup("ROOMKEEPER_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => return Err(ConfigError::PartialTls),
        };

        let metrics_port = match lookup("ROOMKEEPER_METRICS_PORT") {
            None => None,
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "ROOMKEEPER_METRICS_PORT",
                value,
            })?),
        };

        Ok(Self {
            port: parsed(&lookup, "ROOMKEEPER_PORT", 5433)?,
            bind: lookup("ROOMKEEPER_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("ROOMKEEPER_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("ROOMKEEPER_PASSWORD").unwrap_or_else(|| "roomkeeper".into()),
            max_connections: parsed(&lookup, "ROOMKEEPER_MAX_CONNECTIONS", 256)?,
            compact_threshold: parsed(&lookup, "ROOMKEEPER_COMPACT_THRESHOLD", 1000)?,
            tls,
            metrics_port,
            roles: StaticRoles::parse(&lookup("ROOMKEEPER_ROLES").unwrap_or_default())?,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("roomkeeper.wal")
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        match &self.tls {
            None => Ok(None),
            Some((cert, key)) => Ok(Some(load_tls_acceptor(cert, key)?)),
        }
    }
}

fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
