use std::path::{Path, PathBuf};
use std::time::Duration;

use iris_core::matcher::{DEFAULT_MAX_SHIFT, DEFAULT_MIN_OVERLAP_BITS};
use iris_core::types::TEMPLATE_COLS;
use iris_core::{PipelineConfig, DEFAULT_MATCH_THRESHOLD};
use thiserror::Error;

use crate::store::EnrollPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Engine configuration.
///
/// Resolution order: built-in defaults, then the optional TOML file, then
/// `IRIS_*` environment variables. Unparseable environment values are
/// ignored.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Accept iff the best masked Hamming distance is below this.
    pub match_threshold: f32,
    /// Half-width of the rotation search, in template columns.
    pub max_shift: i32,
    /// Minimum jointly valid bits for a comparison to count.
    pub min_overlap_bits: usize,
    /// Per-request processing budget.
    pub timeout_ms: u64,
    pub enroll_policy: EnrollPolicy,
    pub pipeline: PipelineConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            max_shift: DEFAULT_MAX_SHIFT,
            min_overlap_bits: DEFAULT_MIN_OVERLAP_BITS,
            timeout_ms: 5_000,
            enroll_policy: EnrollPolicy::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML file and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::load`] with an explicit environment lookup.
    pub fn load_with<F>(path: Option<&Path>, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = env("IRIS_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        self.match_threshold = env_parse(&env, "IRIS_MATCH_THRESHOLD", self.match_threshold);
        self.max_shift = env_parse(&env, "IRIS_MAX_SHIFT", self.max_shift);
        self.min_overlap_bits = env_parse(&env, "IRIS_MIN_OVERLAP_BITS", self.min_overlap_bits);
        self.timeout_ms = env_parse(&env, "IRIS_TIMEOUT_MS", self.timeout_ms);
        self.enroll_policy = env_parse(&env, "IRIS_ENROLL_POLICY", self.enroll_policy);
        self.pipeline.liveness.threshold = env_parse(
            &env,
            "IRIS_LIVENESS_THRESHOLD",
            self.pipeline.liveness.threshold,
        );
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0 && self.match_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be in (0, 1], got {}",
                self.match_threshold
            )));
        }
        let max_shift = (TEMPLATE_COLS / 2) as i32;
        if !(0..=max_shift).contains(&self.max_shift) {
            return Err(ConfigError::Invalid(format!(
                "max_shift must be in 0..={max_shift}, got {}",
                self.max_shift
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeout_ms must be positive".into()));
        }
        let liveness = self.pipeline.liveness.threshold;
        if !(0.0..=1.0).contains(&liveness) {
            return Err(ConfigError::Invalid(format!(
                "liveness threshold must be in [0, 1], got {liveness}"
            )));
        }
        self.validate_filters()
    }

    /// Filter wavelengths and envelope must fit one angular row.
    fn validate_filters(&self) -> Result<(), ConfigError> {
        let features = &self.pipeline.features;
        let cols = TEMPLATE_COLS as f32;
        let sigma_ratio = features.sigma_ratio;
        if !(sigma_ratio.is_finite() && sigma_ratio > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "sigma_ratio must be positive, got {sigma_ratio}"
            )));
        }
        for &wavelength in &features.wavelengths {
            if !(wavelength.is_finite() && wavelength > 0.0 && wavelength <= cols) {
                return Err(ConfigError::Invalid(format!(
                    "wavelength must be in (0, {TEMPLATE_COLS}], got {wavelength}"
                )));
            }
            // Kernel spans 2 * ceil(3 sigma) + 1 texels
            let sigma = (sigma_ratio * wavelength).max(0.5);
            let span = 2.0 * (3.0 * sigma).ceil() + 1.0;
            if span > cols {
                return Err(ConfigError::Invalid(format!(
                    "filter of wavelength {wavelength} with sigma_ratio {sigma_ratio} \
                     spans {span} texels, more than {TEMPLATE_COLS}"
                )));
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// `$XDG_DATA_HOME/iris/templates.db`, falling back to `~/.local/share`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("iris")
        .join("templates.db")
}

fn env_parse<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    env(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
