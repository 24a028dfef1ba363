use std::{env, net::SocketAddr, path::PathBuf, time::Duration};

use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    context_store_address: String,
    broker_address: String,
    shared_storage_root: PathBuf,
    max_attempts_per_stage: u32,
    stage_deadline_default: Duration,
    gpu_devices: Vec<u32>,
    gpu_lease_ttl: Duration,
    gpu_lease_renew_interval: Duration,
    gpu_lease_acquire_max_wait: Duration,
    gpu_sweep_interval: Duration,
    subprocess_startup_timeout: Duration,
    cache_reuse_enabled: bool,
    worker_concurrency: usize,
    worker_capabilities: Vec<String>,
    scheduler_poll_interval: Duration,
    resume_rescan_interval: Duration,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
    ffmpeg_extract_cmd: PathBuf,
    asr_infer_cmd: PathBuf,
    diarize_infer_cmd: PathBuf,
    optimize_cmd: PathBuf,
    rebuild_cmd: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// Load and validate the worker configuration from the environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when a required variable is unset or any value
    /// fails to parse, including a renew interval at or above the lease TTL.
    pub fn from_env() -> Result<Self, ConfigError> {
        let context_store_address = env_var("SUBFLOW_STORE_ADDRESS")?;
        let broker_address = env::var("SUBFLOW_BROKER_ADDRESS")
            .unwrap_or_else(|_| context_store_address.clone());
        let shared_storage_root = PathBuf::from(env_var("SUBFLOW_STORAGE_ROOT")?);
        let http_bind = parse_socket_addr("SUBFLOW_HTTP_BIND", "0.0.0.0:9105")?;

        let max_attempts_per_stage = parse_u32("SUBFLOW_MAX_ATTEMPTS_PER_STAGE", 3)?;
        let stage_deadline_default =
            parse_duration_secs("SUBFLOW_STAGE_DEADLINE_DEFAULT_S", 3600)?;

        // GPU arbitration settings
        let gpu_devices = parse_device_list("SUBFLOW_GPU_DEVICES", "0")?;
        let gpu_lease_ttl = parse_duration_secs("SUBFLOW_GPU_LEASE_TTL_S", 120)?;
        let gpu_lease_renew_interval =
            parse_duration_secs("SUBFLOW_GPU_LEASE_RENEW_INTERVAL_S", 30)?;
        let gpu_lease_acquire_max_wait =
            parse_duration_secs("SUBFLOW_GPU_LEASE_ACQUIRE_MAX_WAIT_S", 600)?;
        let gpu_sweep_interval = parse_duration_secs("SUBFLOW_GPU_SWEEP_INTERVAL_S", 30)?;
        if gpu_lease_renew_interval >= gpu_lease_ttl {
            return Err(ConfigError::Invalid {
                name: "SUBFLOW_GPU_LEASE_RENEW_INTERVAL_S",
                source: anyhow::anyhow!(
                    "renew interval ({}s) must be below the lease ttl ({}s)",
                    gpu_lease_renew_interval.as_secs(),
                    gpu_lease_ttl.as_secs()
                ),
            });
        }

        let subprocess_startup_timeout =
            parse_duration_secs("SUBFLOW_SUBPROCESS_STARTUP_TIMEOUT_S", 120)?;
        let cache_reuse_enabled = parse_bool("SUBFLOW_CACHE_REUSE_ENABLED", true)?;

        // Worker settings
        let worker_concurrency =
            parse_usize("SUBFLOW_WORKER_CONCURRENCY", num_cpus::get().max(1))?;
        let worker_capabilities = parse_csv(
            "SUBFLOW_WORKER_CAPABILITIES",
            "ffmpeg.extract_audio,asr.transcribe,pyannote.diarize,subtitle.optimize,subtitle.rebuild",
        );
        let scheduler_poll_interval = parse_duration_ms("SUBFLOW_SCHEDULER_POLL_INTERVAL_MS", 500)?;
        let resume_rescan_interval = parse_duration_secs("SUBFLOW_RESUME_RESCAN_INTERVAL_S", 60)?;

        // OpenTelemetry settings
        let otel_exporter_endpoint = env::var("OTEL_EXPORTER_ENDPOINT").ok();
        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;

        // External command adapters per node
        let ffmpeg_extract_cmd =
            parse_path("SUBFLOW_FFMPEG_EXTRACT_CMD", "/opt/subflow/bin/extract_audio");
        let asr_infer_cmd = parse_path("SUBFLOW_ASR_INFER_CMD", "/opt/subflow/bin/asr_infer");
        let diarize_infer_cmd =
            parse_path("SUBFLOW_DIARIZE_INFER_CMD", "/opt/subflow/bin/diarize_infer");
        let optimize_cmd =
            parse_path("SUBFLOW_OPTIMIZE_CMD", "/opt/subflow/bin/subtitle_optimize");
        let rebuild_cmd = parse_path("SUBFLOW_REBUILD_CMD", "/opt/subflow/bin/subtitle_rebuild");

        Ok(Self {
            http_bind,
            context_store_address,
            broker_address,
            shared_storage_root,
            max_attempts_per_stage,
            stage_deadline_default,
            gpu_devices,
            gpu_lease_ttl,
            gpu_lease_renew_interval,
            gpu_lease_acquire_max_wait,
            gpu_sweep_interval,
            subprocess_startup_timeout,
            cache_reuse_enabled,
            worker_concurrency,
            worker_capabilities,
            scheduler_poll_interval,
            resume_rescan_interval,
            otel_exporter_endpoint,
            otel_sampling_ratio,
            ffmpeg_extract_cmd,
            asr_infer_cmd,
            diarize_infer_cmd,
            optimize_cmd,
            rebuild_cmd,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn context_store_address(&self) -> &str {
        &self.context_store_address
    }

    #[must_use]
    pub fn broker_address(&self) -> &str {
        &self.broker_address
    }

    #[must_use]
    pub fn shared_storage_root(&self) -> &PathBuf {
        &self.shared_storage_root
    }

    #[must_use]
    pub fn max_attempts_per_stage(&self) -> u32 {
        self.max_attempts_per_stage
    }

    #[must_use]
    pub fn stage_deadline_default(&self) -> Duration {
        self.stage_deadline_default
    }

    #[must_use]
    pub fn gpu_devices(&self) -> &[u32] {
        &self.gpu_devices
    }

    #[must_use]
    pub fn gpu_lease_ttl(&self) -> Duration {
        self.gpu_lease_ttl
    }

    #[must_use]
    pub fn gpu_lease_renew_interval(&self) -> Duration {
        self.gpu_lease_renew_interval
    }

    #[must_use]
    pub fn gpu_lease_acquire_max_wait(&self) -> Duration {
        self.gpu_lease_acquire_max_wait
    }

    #[must_use]
    pub fn gpu_sweep_interval(&self) -> Duration {
        self.gpu_sweep_interval
    }

    #[must_use]
    pub fn subprocess_startup_timeout(&self) -> Duration {
        self.subprocess_startup_timeout
    }

    #[must_use]
    pub fn cache_reuse_enabled(&self) -> bool {
        self.cache_reuse_enabled
    }

    #[must_use]
    pub fn worker_concurrency(&self) -> usize {
        self.worker_concurrency
    }

    #[must_use]
    pub fn worker_capabilities(&self) -> &[String] {
        &self.worker_capabilities
    }

    #[must_use]
    pub fn scheduler_poll_interval(&self) -> Duration {
        self.scheduler_poll_interval
    }

    #[must_use]
    pub fn resume_rescan_interval(&self) -> Duration {
        self.resume_rescan_interval
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }

    #[must_use]
    pub fn ffmpeg_extract_cmd(&self) -> &PathBuf {
        &self.ffmpeg_extract_cmd
    }

    #[must_use]
    pub fn asr_infer_cmd(&self) -> &PathBuf {
        &self.asr_infer_cmd
    }

    #[must_use]
    pub fn diarize_infer_cmd(&self) -> &PathBuf {
        &self.diarize_infer_cmd
    }

    #[must_use]
    pub fn optimize_cmd(&self) -> &PathBuf {
        &self.optimize_cmd
    }

    #[must_use]
    pub fn rebuild_cmd(&self) -> &PathBuf {
        &self.rebuild_cmd
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default_ms.to_string());
    let ms = raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    Ok(Duration::from_millis(ms))
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}

fn parse_csv(name: &'static str, default: &str) -> Vec<String> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_device_list(name: &'static str, default: &str) -> Result<Vec<u32>, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let mut devices = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let device = part.parse::<u32>().map_err(|error| ConfigError::Invalid {
            name,
            source: anyhow::Error::new(error),
        })?;
        devices.push(device);
    }
    if devices.is_empty() {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("at least one GPU device index is required"),
        });
    }
    Ok(devices)
}

fn parse_path(name: &'static str, default: &str) -> PathBuf {
    PathBuf::from(env::var(name).unwrap_or_else(|_| default.to_string()))
}
