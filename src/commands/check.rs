use crate::config::Config;
use crate::error::Result;
use crate::router::format_gateway;
use tracing::{info, warn};

/// Validates `config` and logs the effective settings.
pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");

    info!("Listen port: {}", config.listen_port);
    info!(
        "API filter: path prefix {:?}, MIME type {:?}",
        config.api_filter.path_prefix, config.api_filter.mime_type
    );

    match &config.upstream {
        Some(upstream) if upstream.uses_gateway() => {
            info!(
                "Upstream gateway: {} (secure requests: {})",
                format_gateway(&upstream.host, upstream.port),
                if upstream.apply_on_secure { "routed" } else { "direct" }
            );
        }
        Some(_) => info!("Upstream gateway: configured but disabled"),
        None => info!("Upstream gateway: none"),
    }

    let has_key = config
        .relay
        .access_key
        .as_deref()
        .is_some_and(|key| !key.is_empty());
    match (config.relay.enabled, has_key) {
        (true, true) => info!(
            "Stats relay: enabled, {} endpoint(s) to {}",
            config.relay.whitelist.len(),
            config.relay.endpoint
        ),
        (true, false) => warn!("Stats relay: enabled but no access key, nothing will be sent"),
        (false, _) => info!("Stats relay: disabled"),
    }

    match &config.system_proxy.command {
        Some(command) => info!(
            "System proxy: {} {} (address {})",
            command,
            config.system_proxy.args.join(" "),
            config.system_proxy_address()
        ),
        None => info!("System proxy: unchanged"),
    }

    info!("\n✓ All checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_check_default_config() {
        run_config_check(Config::default()).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_rejects_invalid_config() {
        let mut config = Config::default();
        config.listen_port = 0;
        assert!(run_config_check(config).await.is_err());
    }
}
