use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::{ProducerConfig, ProducerKind, ResourceRecord};
use log::{debug, info};
use reqwest::Client;
use thiserror::Error;

/// Services the bundled inspectors know how to scan.
pub const KNOWN_SERVICES: &[&str] = &["s3", "ec2", "iam", "rds"];

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("inspector answered {status} for {service}")]
    Status {
        service: String,
        status: reqwest::StatusCode,
    },

    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed records for {service}: {source}")]
    Decode {
        service: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("scan of {service} timed out after {secs}s")]
    Timeout { service: String, secs: u64 },

    #[error("inspection of {service} failed: {reason}")]
    Inspection { service: String, reason: String },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no services configured")]
    NoServices,

    #[error("unknown service '{0}'")]
    UnknownService(String),

    #[error("service '{0}' configured twice")]
    DuplicateService(String),
}

pub type ScanFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<ResourceRecord>, ProducerError>> + Send + 'a>>;

/// Source of resource records for one or more services.
pub trait SnapshotProducer: Send + Sync {
    fn scan<'a>(&'a self, service: &'a str) -> ScanFuture<'a>;

    fn supports(&self, service: &str) -> bool {
        KNOWN_SERVICES.contains(&service)
    }
}

/// Ordered mapping from service name to the producer that scans it.
/// Built once at startup; the order is the scan order of every cycle.
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    entries: Vec<(String, Arc<dyn SnapshotProducer>)>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        mut self,
        service: impl Into<String>,
        producer: Arc<dyn SnapshotProducer>,
    ) -> Result<Self, RegistryError> {
        let service = service.into();
        if !producer.supports(&service) {
            return Err(RegistryError::UnknownService(service));
        }
        if self.entries.iter().any(|(s, _)| *s == service) {
            return Err(RegistryError::DuplicateService(service));
        }
        self.entries.push((service, producer));
        Ok(self)
    }

    pub fn for_services(
        services: &[String],
        producer: Arc<dyn SnapshotProducer>,
    ) -> Result<Self, RegistryError> {
        if services.is_empty() {
            return Err(RegistryError::NoServices);
        }
        services
            .iter()
            .try_fold(Self::new(), |registry, service| {
                registry.register(service.clone(), Arc::clone(&producer))
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn SnapshotProducer>)> {
        self.entries.iter().map(|(s, p)| (s.as_str(), p))
    }

    pub fn services(&self) -> Vec<&str> {
        self.entries.iter().map(|(s, _)| s.as_str()).collect()
    }

}

/// Fetches `{base_url}/{service}` from an inspector service that answers
/// with a JSON array of records.
#[derive(Clone)]
pub struct HttpProducer {
    client: Client,
    base_url: String,
}

impl HttpProducer {
    pub fn new(base_url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, service: &str) -> Result<Vec<ResourceRecord>, ProducerError> {
        let url = format!("{}/{}", self.base_url, service);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| ProducerError::Http { url: url.clone(), source })?;

        let status = response.status();
        if !status.is_success() {
            // inspectors report scan failures as {"detail": "..."}
            let detail = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|body| body.get("detail").and_then(|d| d.as_str()).map(str::to_string));
            return Err(match detail {
                Some(reason) => ProducerError::Inspection { service: service.to_string(), reason },
                None => ProducerError::Status { service: service.to_string(), status },
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|source| ProducerError::Http { url, source })?;
        serde_json::from_slice(&body).map_err(|source| ProducerError::Decode {
            service: service.to_string(),
            source,
        })
    }
}

impl SnapshotProducer for HttpProducer {
    fn scan<'a>(&'a self, service: &'a str) -> ScanFuture<'a> {
        Box::pin(self.fetch(service))
    }
}

/// Reads `{directory}/{service}.json`, one file per service.
#[derive(Clone, Debug)]
pub struct DirectoryProducer {
    directory: PathBuf,
}

impl DirectoryProducer {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self { directory: directory.into() }
    }

    async fn read(&self, service: &str) -> Result<Vec<ResourceRecord>, ProducerError> {
        let path = self.directory.join(format!("{}.json", service));
        let content = tokio::fs::read(&path)
            .await
            .map_err(|source| ProducerError::Io { path: path.clone(), source })?;
        serde_json::from_slice(&content).map_err(|source| ProducerError::Decode {
            service: service.to_string(),
            source,
        })
    }
}

impl SnapshotProducer for DirectoryProducer {
    fn scan<'a>(&'a self, service: &'a str) -> ScanFuture<'a> {
        Box::pin(self.read(service))
    }
}

pub fn from_config(config: &ProducerConfig) -> anyhow::Result<Arc<dyn SnapshotProducer>> {
    match config.kind {
        ProducerKind::Http => {
            let producer = HttpProducer::new(
                config.base_url.clone(),
                Duration::from_secs(config.request_timeout.max(1)),
            )?;
            info!("Using HTTP inspector at {}", producer.base_url());
            Ok(Arc::new(producer))
        }
        ProducerKind::Directory => {
            info!("Using record files from {}", config.directory);
            Ok(Arc::new(DirectoryProducer::new(&config.directory)))
        }
    }
}
