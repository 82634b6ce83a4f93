//! Settings read from the environment once at attach.

use std::path::PathBuf;

pub const DISABLE_VAR: &str = "DXSHIM_DISABLE";
pub const ENHANCED_VAR: &str = "DXSHIM_ENHANCED";
pub const LOG_VAR: &str = "DXSHIM_LOG";
pub const LOG_FILE_VAR: &str = "DXSHIM_LOG_FILE";

const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShimConfig {
    /// Install no hooks at all.
    pub disabled: bool,
    /// Try `Direct3DCreate9Ex` before `Direct3DCreate9`.
    pub enhanced: bool,
    /// `env_logger` filter directives.
    pub log_filter: String,
    pub log_file: Option<PathBuf>,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            enhanced: true,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_file: None,
        }
    }
}

impl ShimConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from `lookup`, which maps a variable name to its value.
    /// Unset, empty or unrecognized values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |name: &str, default: bool| {
            lookup(name)
                .as_deref()
                .and_then(parse_flag)
                .unwrap_or(default)
        };
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        Self {
            disabled: flag(DISABLE_VAR, defaults.disabled),
            enhanced: flag(ENHANCED_VAR, defaults.enhanced),
            log_filter: non_empty(LOG_VAR).unwrap_or(defaults.log_filter),
            log_file: non_empty(LOG_FILE_VAR).map(PathBuf::from),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ShimConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ShimConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(config(&[]), ShimConfig::default());
        assert!(config(&[]).enhanced);
        assert_eq!(config(&[]).log_filter, "info");
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert!(config(&[("DXSHIM_DISABLE", "1")]).disabled);
        assert!(config(&[("DXSHIM_DISABLE", "TRUE")]).disabled);
        assert!(!config(&[("DXSHIM_ENHANCED", "off")]).enhanced);
        assert!(!config(&[("DXSHIM_ENHANCED", " no ")]).enhanced);
    }

    #[test]
    fn unrecognized_flags_keep_defaults() {
        let c = config(&[("DXSHIM_DISABLE", "maybe"), ("DXSHIM_ENHANCED", "")]);
        assert!(!c.disabled);
        assert!(c.enhanced);
    }

    #[test]
    fn log_settings() {
        let c = config(&[
            ("DXSHIM_LOG", "dxshim_agent=debug"),
            ("DXSHIM_LOG_FILE", "C:\\logs\\dxshim.log"),
        ]);
        assert_eq!(c.log_filter, "dxshim_agent=debug");
        assert_eq!(c.log_file, Some(PathBuf::from("C:\\logs\\dxshim.log")));
        assert_eq!(config(&[("DXSHIM_LOG_FILE", "  ")]).log_file, None);
    }
}
