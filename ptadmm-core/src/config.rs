use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AdmmError;

/// Hyperparameters of an ADMM run.
///
/// Only the coordinating process's copy matters: it is broadcast to every rank
/// during setup, so workers may pass `AdmmConfig::default()`.
///
/// # Example
///
/// ```rust
/// # use ptadmm_core::config::AdmmConfig;
///
/// let config = AdmmConfig::from_json_str(r#"{ "niter": 20, "rho": 0.8 }"#).unwrap();
/// assert_eq!(config.niter, 20);
/// assert_eq!(config.gamma, 0.25);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmmConfig {
    /// Number of outer ADMM iterations; a hard budget
    pub niter: usize,
    /// Augmented Lagrangian penalty
    pub rho: f64,
    /// Step size handed to the ptychography solver
    pub gamma: f64,
    pub ptycho_algorithm: String,
    pub tomo_algorithm: String,
    /// Iterations each subproblem solver runs per outer iteration
    pub inner_iterations: usize,
    /// Tomography regularization parameter; negative disables it
    pub tomo_reg_par: f64,
}

impl Default for AdmmConfig {
    fn default() -> Self {
        AdmmConfig {
            niter: 1,
            rho: 0.5,
            gamma: 0.25,
            ptycho_algorithm: "grad".to_string(),
            tomo_algorithm: "grad".to_string(),
            inner_iterations: 1,
            tomo_reg_par: -1.0,
        }
    }
}

impl AdmmConfig {
    pub fn new(niter: usize, rho: f64, gamma: f64) -> Self {
        AdmmConfig {
            niter,
            rho,
            gamma,
            ..AdmmConfig::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, AdmmError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, AdmmError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// Configuration for local filesystem exports.
///
/// # Example
///
/// ```rust
/// # use ptadmm_core::config::LocalConfig;
/// # use std::path::Path;
///
/// let config = LocalConfig::new(Path::new("/tmp/admm"), "run1_");
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Root directory path for storing files
    pub root: String,
    /// Filename prefix for organizing files
    pub prefix: String,
}

impl LocalConfig {
    pub fn new(root: &Path, prefix: &str) -> Self {
        LocalConfig {
            root: root.to_string_lossy().into_owned(),
            prefix: prefix.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_disable_tomo_regularization() {
        let config = AdmmConfig::default();
        assert_eq!(config.tomo_reg_par, -1.0);
        assert_eq!(config.inner_iterations, 1);
        assert_eq!(config.ptycho_algorithm, "grad");
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = AdmmConfig::from_json_str(r#"{"rho": 2.0, "tomo_algorithm": "art"}"#).unwrap();
        assert_eq!(config.rho, 2.0);
        assert_eq!(config.tomo_algorithm, "art");
        assert_eq!(config.niter, 1);
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = AdmmConfig::from_json_str("{ niter: }").unwrap_err();
        assert!(matches!(err, AdmmError::Config(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"niter": 7, "gamma": 0.1}}"#).unwrap();
        let config = AdmmConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config, AdmmConfig { niter: 7, gamma: 0.1, ..AdmmConfig::default() });
    }
}
