use crate::error::AgentErr;
use crate::flags::STEPWISE_DEFAULT_MODEL;
use crate::flags::STEPWISE_EXEC_TIMEOUT_MS;
use crate::protocol::ApprovalPolicy;
use crate::protocol::SandboxPolicy;
use dirs::home_dir;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_MAX_STEPS: usize = 10;

/// Application configuration loaded from disk and merged with overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub model: String,

    /// Upper bound on LLM calls per turn.
    pub max_steps: usize,

    pub approval_policy: ApprovalPolicy,

    /// Label forwarded to the shell tool.
    pub sandbox_policy: SandboxPolicy,

    /// Directory that should be treated as the *root* of the session. All
    /// relative paths supplied by the model are resolved against it.
    pub cwd: PathBuf,

    /// Contents of `instructions.md` (or `instructions` in config.toml),
    /// appended to the built-in prompt.
    pub user_instructions: Option<String>,

    /// Glob patterns; patches touching a match are rejected outright.
    pub protected_paths: Vec<String>,

    /// Timeout for `shell` calls that do not set one.
    pub shell_timeout: Duration,

    /// Directory where config.toml and instructions.md are read from.
    pub stepwise_home: PathBuf,
}

/// Base config deserialized from $STEPWISE_HOME/config.toml.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ConfigToml {
    pub model: Option<String>,
    pub max_steps: Option<usize>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub sandbox_policy: Option<SandboxPolicy>,
    pub instructions: Option<String>,
    #[serde(default)]
    pub protected_paths: Vec<String>,
    pub shell_timeout_ms: Option<u64>,
}

/// Optional overrides for user configuration (e.g., from CLI flags).
#[derive(Default, Debug, Clone)]
pub struct ConfigOverrides {
    pub model: Option<String>,
    pub max_steps: Option<usize>,
    pub approval_policy: Option<ApprovalPolicy>,
    pub sandbox_policy: Option<SandboxPolicy>,
    pub cwd: Option<PathBuf>,
}

impl Config {
    /// Load configuration, optionally applying overrides (CLI flags). Merges
    /// $STEPWISE_HOME/config.toml, $STEPWISE_HOME/instructions.md and any
    /// values provided in `overrides` (highest precedence).
    pub fn load_with_overrides(overrides: ConfigOverrides) -> Result<Self, AgentErr> {
        let stepwise_home = find_stepwise_home()?;
        let cfg = load_config_as_toml(&stepwise_home)?;
        tracing::debug!("Config parsed from config.toml: {cfg:?}");
        Self::load_from_base_config_with_overrides(cfg, overrides, stepwise_home)
    }

    /// Meant to be used exclusively for tests: `load_with_overrides()` should
    /// be used in all other cases.
    pub fn load_from_base_config_with_overrides(
        cfg: ConfigToml,
        overrides: ConfigOverrides,
        stepwise_home: PathBuf,
    ) -> Result<Self, AgentErr> {
        // Destructure ConfigOverrides fully to ensure all overrides are applied.
        let ConfigOverrides {
            model,
            max_steps,
            approval_policy,
            sandbox_policy,
            cwd,
        } = overrides;

        let max_steps = max_steps
            .or(cfg.max_steps)
            .unwrap_or(DEFAULT_MAX_STEPS);
        if max_steps == 0 {
            return Err(AgentErr::Config("max_steps must be at least 1".to_string()));
        }

        let cwd = match cwd {
            None => std::env::current_dir()?,
            Some(p) if p.is_absolute() => p,
            Some(p) => std::env::current_dir()?.join(p),
        };

        let user_instructions = Self::load_instructions(&stepwise_home).or(cfg.instructions);

        Ok(Self {
            model: model
                .or(cfg.model)
                .unwrap_or_else(|| STEPWISE_DEFAULT_MODEL.to_string()),
            max_steps,
            approval_policy: approval_policy.or(cfg.approval_policy).unwrap_or_default(),
            sandbox_policy: sandbox_policy.or(cfg.sandbox_policy).unwrap_or_default(),
            cwd,
            user_instructions,
            protected_paths: cfg.protected_paths,
            shell_timeout: cfg
                .shell_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(*STEPWISE_EXEC_TIMEOUT_MS),
            stepwise_home,
        })
    }

    fn load_instructions(stepwise_home: &std::path::Path) -> Option<String> {
        let p = stepwise_home.join("instructions.md");
        let contents = std::fs::read_to_string(&p).ok()?;
        let s = contents.trim();
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    }
}

/// Attempt to parse the file at `$STEPWISE_HOME/config.toml`. A missing file
/// yields the defaults.
fn load_config_as_toml(stepwise_home: &std::path::Path) -> Result<ConfigToml, AgentErr> {
    let config_toml_path = stepwise_home.join("config.toml");
    match std::fs::read_to_string(&config_toml_path) {
        Ok(contents) => toml::from_str::<ConfigToml>(&contents).map_err(|e| {
            tracing::error!("Failed to parse config.toml: {e}");
            AgentErr::Config(format!("{}: {e}", config_toml_path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!("config.toml not found, using defaults");
            Ok(ConfigToml::default())
        }
        Err(e) => {
            tracing::error!("Failed to read config.toml: {e}");
            Err(e.into())
        }
    }
}

/// Returns the path to the configuration directory, which is `$STEPWISE_HOME`
/// when set and `~/.stepwise` otherwise. Does not verify that it exists.
pub fn find_stepwise_home() -> std::io::Result<PathBuf> {
    if let Ok(val) = std::env::var("STEPWISE_HOME") {
        if !val.is_empty() {
            return Ok(PathBuf::from(val));
        }
    }

    let mut p = home_dir().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Could not find home directory",
        )
    })?;
    p.push(".stepwise");
    Ok(p)
}
