//! Maps stored data source fields to an engine-specific connection URL.

use std::{fmt, str::FromStr};

use tally_db::DataSourceRecord;
use thiserror::Error;
use url::Url;

use crate::vault::{CredentialVault, VaultError};

const MYSQL_DEFAULT_PORT: u16 = 3306;
const POSTGRES_DEFAULT_PORT: u16 = 5432;
const DEFAULT_HOST: &str = "localhost";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("unsupported database engine '{0}'")]
    UnsupportedEngine(String),
    #[error("could not decrypt data source password: {0}")]
    Credential(#[from] VaultError),
    #[error("invalid connection target: {0}")]
    InvalidTarget(String),
}

/// Database engines a data source may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineKind {
    Sqlite,
    Mysql,
    Postgres,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Sqlite => "sqlite",
            EngineKind::Mysql => "mysql",
            EngineKind::Postgres => "postgres",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(EngineKind::Sqlite),
            "mysql" => Ok(EngineKind::Mysql),
            "postgres" | "postgresql" => Ok(EngineKind::Postgres),
            _ => Err(ConnectorError::UnsupportedEngine(s.to_string())),
        }
    }
}

/// Resolved connection target. Holds the decrypted secret inside `url`, so the
/// `Debug` output masks it.
#[derive(Clone)]
pub struct ConnectionDescriptor {
    engine: EngineKind,
    url: String,
    redacted: String,
}

impl ConnectionDescriptor {
    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn redacted(&self) -> &str {
        &self.redacted
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("engine", &self.engine)
            .field("url", &self.redacted)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionResolver {
    vault: CredentialVault,
}

impl ConnectionResolver {
    pub fn new(vault: CredentialVault) -> Self {
        Self { vault }
    }

    /// Builds the descriptor for `source`. The engine kind is checked before the
    /// secret is touched; sqlite ignores everything but the database field.
    pub fn resolve(
        &self,
        source: &DataSourceRecord,
    ) -> Result<ConnectionDescriptor, ConnectorError> {
        let engine = EngineKind::from_str(&source.engine)?;

        match engine {
            EngineKind::Sqlite => {
                let url = sqlite_url(&source.database_name)?;
                Ok(ConnectionDescriptor {
                    engine,
                    redacted: url.clone(),
                    url,
                })
            }
            EngineKind::Mysql | EngineKind::Postgres => {
                let secret = self.vault.decrypt(&source.encrypted_secret)?;
                let mask = if secret.is_empty() { "" } else { "***" };
                let url = network_url(engine, source, &secret)?;
                let redacted = network_url(engine, source, mask)?;
                Ok(ConnectionDescriptor {
                    engine,
                    url: url.into(),
                    redacted: redacted.into(),
                })
            }
        }
    }
}

fn sqlite_url(database: &str) -> Result<String, ConnectorError> {
    let target = database.trim();
    if target.is_empty() {
        return Err(ConnectorError::InvalidTarget(
            "sqlite data source has no database path".into(),
        ));
    }
    if target == ":memory:" {
        return Ok("sqlite::memory:".into());
    }
    if target.starts_with("sqlite:") {
        return Ok(target.to_string());
    }
    Ok(format!("sqlite://{target}"))
}

fn network_url(
    engine: EngineKind,
    source: &DataSourceRecord,
    secret: &str,
) -> Result<Url, ConnectorError> {
    let scheme = engine.as_str();
    let default_port = if engine == EngineKind::Postgres {
        POSTGRES_DEFAULT_PORT
    } else {
        MYSQL_DEFAULT_PORT
    };
    let invalid = |what: &str| {
        ConnectorError::InvalidTarget(format!("invalid {what} for {scheme} data source"))
    };

    let mut url = Url::parse(&format!("{scheme}://{DEFAULT_HOST}"))
        .map_err(|err| ConnectorError::InvalidTarget(err.to_string()))?;

    let host = source.host.trim();
    if !host.is_empty() {
        url.set_host(Some(host)).map_err(|_| invalid("host"))?;
    }
    let port = if source.port == 0 {
        default_port
    } else {
        source.port
    };
    url.set_port(Some(port)).map_err(|_| invalid("port"))?;

    if !source.username.is_empty() {
        url.set_username(&source.username)
            .map_err(|_| invalid("username"))?;
    }
    if !secret.is_empty() {
        url.set_password(Some(secret))
            .map_err(|_| invalid("password"))?;
    }
    url.set_path(source.database_name.trim());

    if engine == EngineKind::Postgres {
        url.query_pairs_mut().append_pair("sslmode", "disable");
    }

    Ok(url)
}
