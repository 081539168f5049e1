use reqwest::Proxy;

/// Kind of upstream proxy the origin is reached through
#[derive(Debug, Clone, PartialEq, Eq, Copy)]
pub enum UpstreamProxyType {
    Http,
    Https,
    Socks5,
    /// Route every scheme through the proxy
    All,
}

#[derive(Debug, Clone)]
pub struct UpstreamProxyAuth {
    pub username: String,
    pub password: String,
}

/// Upstream proxy used by [`HttpNetwork`](super::HttpNetwork)
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    /// Proxy server URL (e.g., "http://proxy.example.com:8080")
    pub url: String,
    pub proxy_type: UpstreamProxyType,
    pub auth: Option<UpstreamProxyAuth>,
}

impl UpstreamProxy {
    /// Build the reqwest proxy for this configuration
    pub fn to_reqwest(&self) -> Result<Proxy, String> {
        let mut proxy = match self.proxy_type {
            UpstreamProxyType::Http => {
                Proxy::http(&self.url).map_err(|e| format!("Invalid HTTP proxy URL: {e}"))?
            }
            UpstreamProxyType::Https => {
                Proxy::https(&self.url).map_err(|e| format!("Invalid HTTPS proxy URL: {e}"))?
            }
            UpstreamProxyType::Socks5 => {
                let url = if self.url.starts_with("socks5://") {
                    self.url.clone()
                } else {
                    format!("socks5://{}", self.url)
                };
                Proxy::all(&url).map_err(|e| format!("Invalid SOCKS5 proxy URL: {e}"))?
            }
            UpstreamProxyType::All => {
                Proxy::all(&self.url).map_err(|e| format!("Invalid proxy URL: {e}"))?
            }
        };

        if let Some(auth) = &self.auth {
            proxy = proxy.basic_auth(&auth.username, &auth.password);
        }

        Ok(proxy)
    }
}
