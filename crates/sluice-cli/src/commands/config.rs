//! Config command handlers

use sluice_core::Config;

use crate::output::Output;

/// Show the effective configuration
pub fn show(config: &Config, output: &Output) {
    let or_unset = |value: Option<String>| value.unwrap_or_else(|| "(not set)".to_string());

    output.print_fields(&[
        ("url", or_unset(config.url.clone())),
        ("ping_interval_secs", config.ping_interval_secs.to_string()),
        (
            "background_grace_secs",
            config.background_grace_secs.to_string(),
        ),
        ("reconnect_floor_ms", config.reconnect_floor_ms.to_string()),
        (
            "reconnect_ceiling_ms",
            config.reconnect_ceiling_ms.to_string(),
        ),
        (
            "request_timeout_secs",
            config.request_timeout_secs.to_string(),
        ),
        (
            "token_expiry_margin_secs",
            config.token_expiry_margin_secs.to_string(),
        ),
        (
            "cache_path",
            or_unset(config.cache_path.as_ref().map(|p| p.display().to_string())),
        ),
        ("log_level", config.log_level.clone()),
        (
            "log_file",
            or_unset(config.log_file.as_ref().map(|p| p.display().to_string())),
        ),
        ("config_file", Config::config_file_path().display().to_string()),
    ]);
}

/// Print where the config file is read from
pub fn path(output: &Output) {
    output.print_fields(&[("path", Config::config_file_path().display().to_string())]);
}
