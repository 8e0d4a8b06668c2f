//! Host configuration
//!
//! Loaded from `$REX_CONFIG` or `~/.config/rex/config.toml`. A missing file
//! is an empty configuration; a malformed one is an error.

use rex_core::{Backend, Error, ExecutionContext, Result, SchedulerOptions, DEFAULT_PYTHON};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "REX_CONFIG";

/// Whole config file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalConfig {
    /// Short name to `user@host`
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,

    /// Per-alias defaults
    #[serde(default)]
    pub hosts: BTreeMap<String, HostConfig>,
}

/// Defaults applied to every run against one host
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Submit through the batch scheduler unless told otherwise
    #[serde(default)]
    pub default_slurm: bool,
    pub python: Option<String>,
    #[serde(default)]
    pub modules: Vec<String>,
    pub code_dir: Option<String>,
    pub run_dir: Option<String>,
    pub cpu_partition: Option<String>,
    pub gpu_partition: Option<String>,
    /// Prefer the GPU partition when neither `--gpu` nor `--cpu` is given
    #[serde(default)]
    pub default_gpu: bool,
    pub gres: Option<String>,
    pub time: Option<String>,
    pub cpus: Option<u32>,
    pub mem: Option<String>,
    pub constraint: Option<String>,
    pub prefer: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Private key passed to `ssh -i`
    pub identity_file: Option<String>,
}

/// Settings given on the command line
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub slurm: bool,
    pub python: Option<String>,
    pub modules: Vec<String>,
    pub partition: Option<String>,
    pub gres: Option<String>,
    pub time: Option<String>,
    pub cpus: Option<u32>,
    pub mem: Option<String>,
    pub constraint: Option<String>,
    pub prefer: Option<String>,
    pub gpu: bool,
    pub cpu: bool,
}

/// Everything needed to build an executor for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub backend: Backend,
    pub context: ExecutionContext,
    pub options: SchedulerOptions,
}

impl GlobalConfig {
    /// Default location of the config file
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("rex")
                .join("config.toml")
        })
    }

    /// Load the config file at the default location
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from_file(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
            .map_err(|e| Error::ConfigError(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate config text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {}", e)))?;

        for (name, host) in &config.hosts {
            host.scheduler_defaults().validate().map_err(|e| {
                Error::ConfigError(format!("[hosts.{}] {}", name, e))
            })?;
        }

        Ok(config)
    }

    /// Expand an alias to its connection target and host defaults
    ///
    /// A name that is not an alias is used verbatim as the target; host
    /// defaults may still be keyed by it.
    pub fn resolve_target<'a>(&'a self, name: &str) -> (String, Option<&'a HostConfig>) {
        match self.aliases.get(name) {
            Some(target) => (target.clone(), self.hosts.get(name)),
            None => (name.to_string(), self.hosts.get(name)),
        }
    }
}

impl HostConfig {
    /// Every scheduler value this host sets, regardless of job kind
    fn scheduler_defaults(&self) -> SchedulerOptions {
        SchedulerOptions {
            partition: self.gpu_partition.clone().or_else(|| self.cpu_partition.clone()),
            gres: self.gres.clone(),
            time: self.time.clone(),
            cpus: self.cpus,
            mem: self.mem.clone(),
            constraint: self.constraint.clone(),
            prefer: self.prefer.clone(),
        }
    }
}

/// Combine command-line settings with host defaults
///
/// Command line wins over host config, which wins over built-in defaults.
/// Host `gres`, `constraint` and `prefer` only apply to GPU jobs.
pub fn resolve(overrides: &Overrides, host: Option<&HostConfig>) -> Result<Resolved> {
    if overrides.gpu && overrides.cpu {
        return Err(Error::ValidationError(
            "--gpu and --cpu are mutually exclusive".to_string(),
        ));
    }

    let fallback = HostConfig::default();
    let host = host.unwrap_or(&fallback);

    if overrides.gpu && overrides.partition.is_none() && host.gpu_partition.is_none() {
        return Err(Error::ValidationError(
            "--gpu needs gpu_partition in the host config (or an explicit --partition)"
                .to_string(),
        ));
    }

    let mut use_gpu = overrides.gpu;
    let partition = match &overrides.partition {
        Some(p) => Some(p.clone()),
        None if overrides.gpu => host.gpu_partition.clone(),
        None if overrides.cpu && host.cpu_partition.is_some() => host.cpu_partition.clone(),
        None if !overrides.cpu && host.default_gpu && host.gpu_partition.is_some() => {
            use_gpu = true;
            host.gpu_partition.clone()
        }
        None => host.cpu_partition.clone(),
    };

    let gpu_only = |value: &Option<String>| if use_gpu { value.clone() } else { None };

    let options = SchedulerOptions {
        partition,
        gres: overrides.gres.clone().or_else(|| gpu_only(&host.gres)),
        time: overrides.time.clone().or_else(|| host.time.clone()),
        cpus: overrides.cpus.or(host.cpus),
        mem: overrides.mem.clone().or_else(|| host.mem.clone()),
        constraint: overrides
            .constraint
            .clone()
            .or_else(|| gpu_only(&host.constraint)),
        prefer: overrides.prefer.clone().or_else(|| gpu_only(&host.prefer)),
    };
    options.validate()?;

    let modules = if overrides.modules.is_empty() {
        host.modules.clone()
    } else {
        overrides.modules.clone()
    };

    let context = ExecutionContext {
        python: overrides
            .python
            .clone()
            .or_else(|| host.python.clone())
            .unwrap_or_else(|| DEFAULT_PYTHON.to_string()),
        modules,
        code_dir: host.code_dir.clone(),
        run_dir: host.run_dir.clone(),
        env: host.env.clone(),
    };

    let backend = if overrides.slurm || host.default_slurm {
        Backend::Batch
    } else {
        Backend::Direct
    };

    Ok(Resolved {
        backend,
        context,
        options,
    })
}
