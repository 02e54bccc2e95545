use std::{sync::OnceLock, time::Duration};

use reqwest::Client;

pub(crate) fn default_http_client_builder() -> reqwest::ClientBuilder {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));

    Client::builder()
        .timeout(Duration::from_secs(120))
        // Hyper's pool exposes only max idle connections per host and an idle
        // timeout; there is no TTL on the connections themselves to force a
        // refresh when DNS records change. A short idle timeout picks up DNS
        // changes in practice, which matters for local runtimes restarting on
        // a different port mapping.
        .pool_idle_timeout(Some(Duration::from_secs(5)))
        .pool_max_idle_per_host(8)
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .default_headers(headers)
}

/// Common HTTP client, shared so upstream calls reuse connections.
pub(crate) fn http_client() -> reqwest::Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            default_http_client_builder()
                .build()
                .expect("Failed to build default HTTP client")
        })
        .clone()
}
