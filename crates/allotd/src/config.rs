use std::path::Path;

use allot_core::config::Config;
use allot_core::constraints::QuotaConstraintSet;

/// Load and validate the top-level config file.
pub fn load_config(path: &Path) -> eyre::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| eyre::eyre!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

/// Load the quota-constraints file referenced by a cluster config, resolved
/// relative to the config file's directory. No reference means no
/// constraints.
pub fn load_constraints(
    config_path: &Path,
    cluster: &allot_core::config::ClusterConfig,
) -> eyre::Result<QuotaConstraintSet> {
    let Some(constraints_path) = &cluster.constraints else {
        return Ok(QuotaConstraintSet::default());
    };
    let resolved = match config_path.parent() {
        Some(dir) if constraints_path.is_relative() => dir.join(constraints_path),
        _ => constraints_path.clone(),
    };
    let contents = std::fs::read_to_string(&resolved).map_err(|e| {
        eyre::eyre!("failed to read constraints at {}: {e}", resolved.display())
    })?;
    let constraints: QuotaConstraintSet = serde_yaml::from_str(&contents)?;
    constraints.validate()?;
    Ok(constraints)
}
