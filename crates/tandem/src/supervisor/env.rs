//! Environment handed to the sidecar at spawn time.

use std::collections::BTreeMap;
use std::path::PathBuf;

use log::warn;

use crate::config::SidecarConfig;

/// Variables set on the sidecar process, on top of its inherited environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarEnv {
    vars: BTreeMap<String, String>,
}

impl SidecarEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration, reading forwarded variables from the host.
    pub fn from_config(config: &SidecarConfig) -> Self {
        Self::build(config, |name| std::env::var(name).ok())
    }

    /// Build from configuration with an explicit host lookup.
    pub fn build(config: &SidecarConfig, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut env = Self::new().forward(&config.forward_env, &lookup);
        if let Some(proxy) = config.proxy.as_deref() {
            env = env.proxy(proxy);
        }
        if !config.extra_path.is_empty() {
            env = env.extra_path(&config.extra_path, lookup("PATH"));
        }
        for pair in &config.env {
            match pair.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    env = env.set(key.trim(), value);
                }
                _ => warn!("Ignoring malformed sidecar env entry: {}", pair),
            }
        }
        env
    }

    /// Copy the named host variables that are set.
    pub fn forward(mut self, names: &[String], lookup: impl Fn(&str) -> Option<String>) -> Self {
        for name in names {
            if let Some(value) = lookup(name) {
                self.vars.insert(name.clone(), value);
            }
        }
        self
    }

    /// Route outbound HTTP(S) through `url`.
    pub fn proxy(mut self, url: &str) -> Self {
        for key in ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"] {
            self.vars.insert(key.to_string(), url.to_string());
        }
        self
    }

    /// Prepend `dirs` to `base_path` as the sidecar's `PATH`.
    pub fn extra_path(mut self, dirs: &[String], base_path: Option<String>) -> Self {
        let mut entries: Vec<PathBuf> = dirs
            .iter()
            .map(|dir| {
                shellexpand::full(dir)
                    .map(|expanded| PathBuf::from(expanded.to_string()))
                    .unwrap_or_else(|_| PathBuf::from(dir))
            })
            .collect();
        if let Some(base) = base_path.as_ref() {
            entries.extend(std::env::split_paths(base));
        }
        match std::env::join_paths(entries) {
            Ok(joined) => {
                self.vars
                    .insert("PATH".to_string(), joined.to_string_lossy().into_owned());
            }
            Err(e) => warn!("Cannot build sidecar PATH: {}", e),
        }
        self
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
