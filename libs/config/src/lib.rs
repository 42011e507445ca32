use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use ingest_core::{codec::CodecKind, decorate::Decoration};
use tracing::{debug, warn};

pub mod wire;

/// validated ingest config
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    connection: ConnectionConfig,
    subscriptions: Vec<SubjectSubscription>,
    codec: CodecKind,
    decoration: Decoration,
    path: Option<PathBuf>,
}

/// How to reach the broker. Immutable once built; the optional reconnect
/// fields are resolved into a policy by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// ordered, non-empty list of server urls
    pub servers: Vec<String>,
    pub use_tls: bool,
    pub client_name: Option<String>,
    pub verbose_ack: bool,
    pub strict_protocol: bool,
    pub reconnect_wait: Option<Duration>,
    pub max_reconnect_attempts: Option<u32>,
    pub tls: TlsFiles,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            servers: vec![wire::DEFAULT_SERVER.to_owned()],
            use_tls: false,
            client_name: None,
            verbose_ack: false,
            strict_protocol: false,
            reconnect_wait: None,
            max_reconnect_attempts: None,
            tls: TlsFiles::default(),
        }
    }
}

/// certificate material for TLS connections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsFiles {
    /// client certificate and private key, always set together
    pub client_cert: Option<(PathBuf, PathBuf)>,
    /// extra root CA
    pub ca_file: Option<PathBuf>,
}

impl TlsFiles {
    pub fn is_empty(&self) -> bool {
        self.client_cert.is_none() && self.ca_file.is_none()
    }
}

/// one subscription to register
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubjectSubscription {
    pub subject: String,
    pub queue_group: Option<String>,
}

impl SubjectSubscription {
    pub fn new<S: Into<String>>(subject: S) -> Self {
        Self {
            subject: subject.into(),
            queue_group: None,
        }
    }

    pub fn with_queue_group<S: Into<String>>(mut self, group: S) -> Self {
        self.queue_group = Some(group.into());
        self
    }
}

impl IngestConfig {
    /// build from parts, already validated by the caller
    pub fn new(
        connection: ConnectionConfig,
        subscriptions: Vec<SubjectSubscription>,
        codec: CodecKind,
        decoration: Decoration,
    ) -> Self {
        Self {
            connection,
            subscriptions,
            codec,
            decoration,
            path: None,
        }
    }

    /// reads the file at `path` and decodes it first as JSON, then YAML,
    /// finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to find config at {}", &path.display()))?;
        let mut config = Self::parse_str(raw)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// decodes `s` first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let wire: wire::Config = match serde_json::from_str(s) {
            Ok(cfg) => cfg,
            Err(json_err) => serde_yaml::from_str(s).with_context(|| {
                format!("config is neither valid JSON ({json_err}) nor valid YAML")
            })?,
        };
        debug!(?wire);
        Self::try_from(wire)
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }
    pub fn subscriptions(&self) -> &[SubjectSubscription] {
        &self.subscriptions
    }
    pub fn codec(&self) -> CodecKind {
        self.codec
    }
    pub fn decoration(&self) -> &Decoration {
        &self.decoration
    }
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl TryFrom<wire::Config> for IngestConfig {
    type Error = anyhow::Error;

    fn try_from(cfg: wire::Config) -> Result<Self> {
        let servers = cfg.server_list();
        if servers.is_empty() {
            bail!("at least one server must be configured");
        }

        if let Some(group) = &cfg.queue_group {
            validate_token("queue_group", group)?;
        }
        if cfg.subjects.is_empty() {
            bail!("at least one subject must be configured");
        }
        let subscriptions = cfg
            .subjects
            .iter()
            .map(|entry| -> Result<SubjectSubscription> {
                let sub = match entry {
                    wire::SubjectEntry::Name(subject) => SubjectSubscription {
                        subject: subject.clone(),
                        queue_group: cfg.queue_group.clone(),
                    },
                    wire::SubjectEntry::Full {
                        subject,
                        queue_group,
                    } => SubjectSubscription {
                        subject: subject.clone(),
                        queue_group: queue_group.clone().or_else(|| cfg.queue_group.clone()),
                    },
                };
                validate_token("subject", &sub.subject)?;
                if let Some(group) = &sub.queue_group {
                    validate_token("queue_group", group)?;
                }
                Ok(sub)
            })
            .collect::<Result<Vec<_>>>()?;

        let client_cert = match (cfg.cert_file, cfg.private_key_file) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            (Some(_), None) => bail!("'cert_file' requires 'private_key_file'"),
            (None, Some(_)) => bail!("'private_key_file' requires 'cert_file'"),
        };
        let tls = TlsFiles {
            client_cert,
            ca_file: cfg.ca_file,
        };
        if !cfg.ssl && !tls.is_empty() {
            warn!("certificate files configured without 'ssl', TLS will be required");
        }

        let reconnect_wait = cfg
            .reconnect_time_wait
            .as_ref()
            .map(wire::WaitTime::to_duration)
            .transpose()
            .context("invalid 'reconnect_time_wait'")?;

        Ok(Self {
            connection: ConnectionConfig {
                servers,
                use_tls: cfg.ssl || !tls.is_empty(),
                client_name: cfg.name,
                verbose_ack: cfg.verbose,
                strict_protocol: cfg.pedantic,
                reconnect_wait,
                max_reconnect_attempts: cfg.max_reconnect_attempts,
                tls,
            },
            subscriptions,
            codec: cfg.codec,
            decoration: cfg.decorate,
            path: None,
        })
    }
}

/// subjects and queue groups are whitespace-free, non-empty tokens
fn validate_token(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        bail!("{what} cannot be empty");
    }
    if value.chars().any(char::is_whitespace) {
        bail!("{what} '{value}' cannot contain whitespace");
    }
    if value.starts_with('.') || value.ends_with('.') || value.contains("..") {
        bail!("{what} '{value}' has an empty token");
    }
    Ok(())
}
