//! Typed configuration surface (§6 "Configuration surface", ambient module
//! A2 from SPEC_FULL.md).
//!
//! The library itself never loads configuration from the environment —
//! there is no ambient global config singleton (§9, "no global mutable
//! state"). [`GlobalConfig::from_env`] is provided for the demo binary
//! only, grounded in the teacher's `figment`-based loader
//! (`dwctl/src/config.rs`).

use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;

/// Global defaults merged with per-call values on every `execute()`
/// (§4.1 step 2) — per-call always wins.
#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
    pub headers: Vec<(String, String)>,
    pub debug: bool,
}

/// On-disk/env shape for [`GlobalConfig`], used only by the demo binary.
/// `timeout` is parsed with `humantime_serde` so a YAML/env value like
/// `"10s"` works the same way the teacher's config accepts durations.
#[derive(Debug, Deserialize)]
struct RawGlobalConfig {
    base_url: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    timeout: Option<Duration>,
    #[serde(default)]
    headers: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    debug: bool,
}

impl GlobalConfig {
    /// Load from an optional YAML file plus `REQUEST_RUNTIME_`-prefixed
    /// environment variables, env taking precedence (demo binary only —
    /// mirrors `dwctl::config::Config::load`'s merge order).
    pub fn from_env(yaml_path: Option<&str>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new();
        if let Some(path) = yaml_path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("REQUEST_RUNTIME_").split("__"));

        let raw: RawGlobalConfig = figment.extract()?;
        Ok(Self {
            base_url: raw.base_url,
            timeout: raw.timeout,
            headers: raw.headers.into_iter().collect(),
            debug: raw.debug,
        })
    }
}
