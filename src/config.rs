use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use ulid::Ulid;

/// Daemon settings. Every flag can also come from a `CURBSIDE_*` variable.
#[derive(Debug, Clone, Parser)]
#[command(name = "curbside", version, about = "Parking reservation engine over the Postgres wire protocol")]
pub struct Config {
    #[arg(long, env = "CURBSIDE_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(long, env = "CURBSIDE_PORT", default_value_t = 5433)]
    pub port: u16,

    #[arg(long, env = "CURBSIDE_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Cleartext password every session must present.
    #[arg(long, env = "CURBSIDE_PASSWORD", default_value = "curbside", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "CURBSIDE_MAX_CONNECTIONS", default_value_t = 256)]
    pub max_connections: usize,

    /// WAL appends between compactions.
    #[arg(long, env = "CURBSIDE_COMPACT_THRESHOLD", default_value_t = 1000)]
    pub compact_threshold: u64,

    /// Per-statement deadline handed to the engine.
    #[arg(long, env = "CURBSIDE_OP_TIMEOUT_MS", default_value_t = 5000)]
    pub op_timeout_ms: u64,

    /// Login users (caller ids) that get the admin role.
    #[arg(long, env = "CURBSIDE_ADMINS", value_delimiter = ',')]
    pub admins: Vec<Ulid>,

    /// Create the seven weekday resource-days at startup when missing.
    #[arg(long, env = "CURBSIDE_SEED_WEEKDAYS")]
    pub seed_weekdays: bool,

    #[arg(long, env = "CURBSIDE_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    #[arg(long, env = "CURBSIDE_TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    #[arg(long, env = "CURBSIDE_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Default filter when `RUST_LOG` is unset.
    #[arg(long, env = "CURBSIDE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "CURBSIDE_LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("curbside.wal")
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Build the TLS acceptor from the configured PEM files. TLS is off when
    /// neither is set; setting only one is an error.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (&self.tls_cert, &self.tls_key) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both CURBSIDE_TLS_CERT and CURBSIDE_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}
