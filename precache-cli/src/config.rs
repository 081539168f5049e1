use std::time::Duration;

use precache_engine::http::{UpstreamProxy, UpstreamProxyAuth, UpstreamProxyType};
use precache_engine::{ProxyConfig, ProxyConfigBuilder};
use tracing::info;
use url::Url;

use crate::cli::CliArgs;
use crate::error::AppError;
use crate::utils::{format_duration, parse_duration, parse_headers};

/// Build the engine configuration from command-line arguments
pub fn build_proxy_config(args: &CliArgs) -> Result<ProxyConfig, AppError> {
    let origin = Url::parse(&args.origin)?;
    if args.max_attempts == 0 {
        return Err(AppError::InvalidInput(
            "--max-attempts must be at least 1".to_string(),
        ));
    }

    let retry_delay = parse_duration(&args.retry_delay)?;
    let runtime_ttl = parse_duration(&args.runtime_ttl)?;
    let attempt_timeout = args
        .attempt_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()?;

    info!(
        "Retry configuration: attempts={}, delay={}, attempt timeout={}",
        args.max_attempts,
        format_duration(retry_delay),
        attempt_timeout.map_or_else(|| "none".to_string(), format_duration)
    );

    let mut builder = ProxyConfigBuilder::new()
        .with_prefix(args.prefix.clone())
        .with_version(args.version_tag.clone())
        .with_origin(origin)
        .with_max_attempts(args.max_attempts)
        .with_retry_delay(retry_delay)
        .with_attempt_timeout(attempt_timeout)
        .with_runtime_ttl(runtime_ttl)
        .with_runtime_max_entries(args.runtime_max_entries)
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_timeout(Duration::from_secs(args.timeout));

    for (name, value) in parse_headers(&args.headers) {
        builder = builder.with_header(name, value);
    }

    // Handle proxy configuration
    if args.no_proxy {
        // No proxy flag overrides everything else
        info!("All proxy settings disabled (--no-proxy flag)");
        builder = builder.with_system_proxy(false);
    } else if let Some(proxy_url) = args.proxy.as_ref() {
        let proxy_type = match args.proxy_type.as_str() {
            "http" => UpstreamProxyType::Http,
            "https" => UpstreamProxyType::Https,
            "socks5" => UpstreamProxyType::Socks5,
            "all" => UpstreamProxyType::All,
            _ => {
                return Err(AppError::InvalidInput(format!(
                    "Invalid proxy type: '{}'",
                    args.proxy_type
                )));
            }
        };

        // Configure proxy authentication if both username and password are provided
        let auth = if let (Some(username), Some(password)) = (&args.proxy_user, &args.proxy_pass) {
            Some(UpstreamProxyAuth {
                username: username.clone(),
                password: password.clone(),
            })
        } else {
            None
        };

        info!(
            proxy_url = %proxy_url,
            proxy_type = ?proxy_type,
            has_auth = auth.is_some(),
            "Using explicit proxy configuration"
        );

        builder = builder
            .with_system_proxy(false)
            .with_upstream_proxy(UpstreamProxy {
                url: proxy_url.clone(),
                proxy_type,
                auth,
            });
    } else if args.use_system_proxy {
        info!("Using system proxy settings");
        builder = builder.with_system_proxy(true);
    } else {
        builder = builder.with_system_proxy(false);
    }

    Ok(builder.build())
}
