//! Command-line configuration and its validated, immutable form.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The requested service type is not one Kubernetes knows about.
    #[error("invalid service type: {0}")]
    InvalidServiceType(String),

    /// `--service-name` was empty.
    #[error("service name is required")]
    MissingServiceName,

    /// `--service-namespace` was empty.
    #[error("service namespace is required")]
    MissingServiceNamespace,

    /// Neither `--id` nor `POD_NAME` was set.
    #[error("id is required")]
    MissingIdentity,

    /// The lease timings cannot produce a stable leader.
    #[error(
        "lease timings must satisfy lease-duration ({lease_duration}s) > renew-deadline \
         ({renew_deadline}s) > retry-period ({retry_period}s) > 0"
    )]
    InvalidLeaseTimings {
        /// Requested lease duration in seconds.
        lease_duration: u64,
        /// Requested renew deadline in seconds.
        renew_deadline: u64,
        /// Requested retry period in seconds.
        retry_period: u64,
    },

    /// The cache sync timeout was zero.
    #[error("cache sync timeout must be greater than zero")]
    InvalidCacheSyncTimeout,
}

/// Kubernetes `Service` types the mirror may expose.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// Cluster-internal virtual IP.
    ClusterIP,
    /// Exposed on a port of every node.
    NodePort,
    /// Provisioned by the cloud provider's load balancer.
    LoadBalancer,
    /// DNS alias to an external name.
    ExternalName,
}

impl ServiceType {
    /// Every supported service type.
    pub const ALL: [ServiceType; 4] = [
        Self::ClusterIP,
        Self::NodePort,
        Self::LoadBalancer,
        Self::ExternalName,
    ];

    /// The value Kubernetes uses for `spec.type`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClusterIP => "ClusterIP",
            Self::NodePort => "NodePort",
            Self::LoadBalancer => "LoadBalancer",
            Self::ExternalName => "ExternalName",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidServiceType(s.to_string()))
    }
}

/// Raw command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "apiserver-mirror",
    version,
    about = "Mirrors the Kubernetes API server Service under a different Service type"
)]
pub struct Cli {
    /// Absolute path to the kubeconfig file; in-cluster credentials are used when empty
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    /// Service type of the mirrored Service
    #[arg(long, default_value = "LoadBalancer")]
    pub service_type: String,

    /// Unique id for the leader election
    #[arg(long, env = "POD_NAME", default_value = "")]
    pub id: String,

    /// Name of the mirrored Service and EndpointSlice
    #[arg(long, default_value = "k8s-apiserver")]
    pub service_name: String,

    /// Namespace of the mirrored Service, EndpointSlice and leader election lease
    #[arg(long, default_value = "default")]
    pub service_namespace: String,

    /// Seconds a lease is valid for without renewal
    #[arg(long, default_value_t = 60)]
    pub lease_duration: u64,

    /// Seconds the leader keeps retrying renewal before giving up leadership
    #[arg(long, default_value_t = 30)]
    pub renew_deadline: u64,

    /// Seconds between lease acquire or renew attempts
    #[arg(long, default_value_t = 10)]
    pub retry_period: u64,

    /// Seconds to wait for the initial EndpointSlice list
    #[arg(long, default_value_t = 60)]
    pub cache_sync_timeout: u64,
}

/// Lease timing parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseTimings {
    /// How long a lease is valid without renewal.
    pub lease_duration: Duration,
    /// How long the leader retries renewal before stepping down.
    pub renew_deadline: Duration,
    /// Interval between acquire or renew attempts.
    pub retry_period: Duration,
}

impl Default for LeaseTimings {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            renew_deadline: Duration::from_secs(30),
            retry_period: Duration::from_secs(10),
        }
    }
}

impl LeaseTimings {
    /// Checks `lease_duration > renew_deadline > retry_period > 0`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidLeaseTimings`] if the ordering does not hold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.lease_duration > self.renew_deadline
            && self.renew_deadline > self.retry_period
            && !self.retry_period.is_zero();

        if ordered {
            Ok(())
        } else {
            Err(ConfigError::InvalidLeaseTimings {
                lease_duration: self.lease_duration.as_secs(),
                renew_deadline: self.renew_deadline.as_secs(),
                retry_period: self.retry_period.as_secs(),
            })
        }
    }
}

/// Validated configuration, immutable for the lifetime of the process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Name of the mirrored Service and EndpointSlice.
    pub service_name: String,
    /// Namespace of the mirrored objects and of the lease.
    pub service_namespace: String,
    /// Type forced onto the mirrored Service.
    pub service_type: ServiceType,
    /// Leader election identity of this process.
    pub identity: String,
    /// Kubeconfig path; `None` selects in-cluster credentials.
    pub kubeconfig: Option<PathBuf>,
    /// Leader election timings.
    pub lease: LeaseTimings,
    /// How long a leadership session waits for the initial EndpointSlice list.
    pub cache_sync_timeout: Duration,
}

impl Config {
    /// Creates a configuration with default timings and in-cluster credentials.
    ///
    /// # Errors
    ///
    /// Fails if a name, the namespace or the identity is empty.
    pub fn new(
        service_name: impl Into<String>,
        service_namespace: impl Into<String>,
        service_type: ServiceType,
        identity: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            service_name: service_name.into(),
            service_namespace: service_namespace.into(),
            service_type,
            identity: identity.into(),
            kubeconfig: None,
            lease: LeaseTimings::default(),
            cache_sync_timeout: Duration::from_secs(60),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::MissingServiceName);
        }
        if self.service_namespace.is_empty() {
            return Err(ConfigError::MissingServiceNamespace);
        }
        if self.identity.is_empty() {
            return Err(ConfigError::MissingIdentity);
        }
        self.lease.validate()?;
        if self.cache_sync_timeout.is_zero() {
            return Err(ConfigError::InvalidCacheSyncTimeout);
        }
        Ok(())
    }
}

impl TryFrom<Cli> for Config {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let service_type = cli.service_type.parse()?;
        let kubeconfig = (!cli.kubeconfig.is_empty()).then(|| PathBuf::from(cli.kubeconfig));

        let config = Self {
            service_name: cli.service_name,
            service_namespace: cli.service_namespace,
            service_type,
            identity: cli.id,
            kubeconfig,
            lease: LeaseTimings {
                lease_duration: Duration::from_secs(cli.lease_duration),
                renew_deadline: Duration::from_secs(cli.renew_deadline),
                retry_period: Duration::from_secs(cli.retry_period),
            },
            cache_sync_timeout: Duration::from_secs(cli.cache_sync_timeout),
        };
        config.validate()?;
        Ok(config)
    }
}
