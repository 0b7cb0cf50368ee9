use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// UDP port agents listen on for discovery probes.
pub const DEFAULT_DISCOVERY_PORT: u16 = 2333;

/// TCP port agents accept job-transfer connections on.
pub const DEFAULT_JOB_PORT: u16 = 4444;

/// How the dispatcher reacts to failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per unit, the first one included.
    pub max_attempts: u32,
    /// Requeue units whose job ran and reported an error status.
    /// On by default, so a nonzero exit spends one of `max_attempts` like
    /// any other failure; turn it off to fail such units on their first
    /// error. Connection and protocol failures are always requeued.
    pub retry_job_errors: bool,
    /// Consecutive connection/protocol failures before an agent is dropped.
    pub max_agent_failures: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_job_errors: true,
            max_agent_failures: 3,
        }
    }
}

/// Configuration of an agent process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Address the discovery socket binds to.
    pub discovery_addr: SocketAddr,
    /// Address the job-transfer listener binds to.
    pub job_addr: SocketAddr,
    /// Core count advertised in discovery replies.
    pub cores: usize,
    /// Parent directory of the per-job scratch directories.
    pub scratch_root: PathBuf,
    /// Keep scratch directories after the job finished (debugging).
    pub keep_scratch: bool,
    /// Interval between `<Alive>` records while a job runs.
    pub heartbeat_interval: Duration,
    /// Idle-read timeout while waiting for the job query.
    pub io_timeout: Duration,
    /// How long a DISCOVERED agent waits for the dispatcher to connect.
    pub reservation_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            discovery_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_DISCOVERY_PORT)),
            job_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_JOB_PORT)),
            cores: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            scratch_root: std::env::temp_dir().join("herd-agent"),
            keep_scratch: false,
            heartbeat_interval: Duration::from_secs(2),
            io_timeout: Duration::from_secs(30),
            reservation_timeout: Duration::from_secs(10),
        }
    }
}

impl AgentConfig {
    pub fn new(discovery_addr: SocketAddr, job_addr: SocketAddr) -> Self {
        Self {
            discovery_addr,
            job_addr,
            ..Default::default()
        }
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = cores.max(1);
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }
}

/// Configuration of the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Where probes are sent; the subnet broadcast address by default.
    pub discovery_target: SocketAddr,
    /// Job port assumed for agents whose reply does not advertise one.
    pub default_job_port: u16,
    /// Time between discovery probes while work is pending.
    pub probe_interval: Duration,
    pub connect_timeout: Duration,
    /// Idle-read timeout on job-transfer connections.
    pub io_timeout: Duration,
    pub retry: RetryPolicy,
    /// Optional address for the HTTP status surface.
    pub status_addr: Option<SocketAddr>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            discovery_target: SocketAddr::from(([255, 255, 255, 255], DEFAULT_DISCOVERY_PORT)),
            default_job_port: DEFAULT_JOB_PORT,
            probe_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            status_addr: None,
        }
    }
}

impl DispatcherConfig {
    pub fn new(discovery_target: SocketAddr) -> Self {
        Self {
            discovery_target,
            ..Default::default()
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_status_addr(mut self, addr: SocketAddr) -> Self {
        self.status_addr = Some(addr);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.retry_job_errors);
        assert_eq!(policy.max_agent_failures, 3);
    }

    #[test]
    fn agent_config_default() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.discovery_addr.port(), DEFAULT_DISCOVERY_PORT);
        assert_eq!(cfg.job_addr.port(), DEFAULT_JOB_PORT);
        assert!(cfg.cores >= 1);
        assert!(!cfg.keep_scratch);
        assert_eq!(cfg.reservation_timeout, Duration::from_secs(10));
    }

    #[test]
    fn agent_config_builders() {
        let discovery: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let job: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let cfg = AgentConfig::new(discovery, job)
            .with_cores(0)
            .with_scratch_root("/tmp/scratch");
        assert_eq!(cfg.discovery_addr, discovery);
        assert_eq!(cfg.job_addr, job);
        assert_eq!(cfg.cores, 1, "core count is clamped to at least one");
        assert_eq!(cfg.scratch_root, PathBuf::from("/tmp/scratch"));
    }

    #[test]
    fn dispatcher_config_default() {
        let cfg = DispatcherConfig::default();
        assert_eq!(cfg.discovery_target.to_string(), "255.255.255.255:2333");
        assert_eq!(cfg.default_job_port, DEFAULT_JOB_PORT);
        assert!(cfg.status_addr.is_none());
        assert_eq!(cfg.io_timeout, Duration::from_secs(30));
    }

    #[test]
    fn dispatcher_config_with_status_addr() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = DispatcherConfig::default()
            .with_status_addr(addr)
            .with_retry(RetryPolicy {
                max_attempts: 1,
                retry_job_errors: false,
                max_agent_failures: 1,
            });
        assert_eq!(cfg.status_addr, Some(addr));
        assert_eq!(cfg.retry.max_attempts, 1);
        assert!(!cfg.retry.retry_job_errors);
    }
}
