use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;

static ENV_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]+)\}").expect("env reference pattern is valid"));

const ENV_PREFIX: &str = "SESSION_TAP_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        // Try to load from various config files
        .merge(Toml::file("session-tap.toml"))
        .merge(Json::file("session-tap.json"))
        .merge(Yaml::file("session-tap.yaml"))
        .merge(Yaml::file("session-tap.yml"))
        // Override with environment variables (SESSION_TAP_RELAY__ACCESS_KEY)
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.listen_port == 0 {
        return Err(ConfigError::Validation("Listen port must be greater than 0".into()).into());
    }

    if let Some(upstream) = &config.upstream {
        if upstream.uses_gateway() && upstream.port == 0 {
            return Err(ConfigError::Validation(format!(
                "Upstream gateway '{}' has no port",
                upstream.host
            ))
            .into());
        }
    }

    if config.api_filter.path_prefix.is_empty() {
        return Err(ConfigError::Validation("API path prefix must not be empty".into()).into());
    }

    if config.api_filter.mime_type.is_empty() {
        return Err(ConfigError::Validation("API MIME type must not be empty".into()).into());
    }

    if let Some(index) = config.relay.whitelist.iter().position(|e| e.is_empty()) {
        return Err(ConfigError::Validation(format!(
            "Relay whitelist entry {} is empty",
            index
        ))
        .into());
    }

    let endpoint = &config.relay.endpoint;
    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "Relay endpoint '{}' is not an HTTP URL",
            endpoint
        ))
        .into());
    }

    if config.relay.enabled && config.relay.timeout_ms == 0 {
        return Err(ConfigError::Validation("Relay timeout must be greater than 0".into()).into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    if let Some(key) = &mut config.relay.access_key {
        *key = substitute_env_vars(key)?;
    }

    if let Some(upstream) = &mut config.upstream {
        upstream.host = substitute_env_vars(&upstream.host)?;
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in ENV_REFERENCE.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // Check if there's a default value (e.g., ${VAR:-default})
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}
