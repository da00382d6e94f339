//! Configuration loading, validation and env substitution.
//!
//! Config files: `corral.toml`, `corral.yaml`, `corral.yml` or `corral.json`,
//! searched in `./` then the user config directory (`~/.config/corral/`).
//!
//! `${ENV_VAR}` placeholders are substituted before parsing and a few
//! `CORRAL_*` variables override individual settings afterwards.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{apply_env_overrides, config_dir, discover_and_load, find_config_file, load_config},
    schema::{
        ActionLoadConfig, AllocatorConfig, BackupConfig, CorralConfig, DatabaseConfig,
        DispatcherConfig, HealthConfig, JobTimeouts, LocksConfig, ScoringConfig, SnapshotsConfig,
        SweepsConfig, WarmPoolConfig,
    },
    validate::{
        Diagnostic, Severity, ValidationResult, validate_config, validate_file, validate_str,
    },
};
