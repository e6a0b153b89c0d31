use std::time::Duration;

pub fn build_http_client() -> reqwest::Client {
    build_http_client_with_timeout(None)
}

/// Build a client that ignores system proxies unless
/// `MARKOVBOT_ENABLE_SYSTEM_PROXY` is set, falling back to a bare default
/// client if the configured build fails.
pub fn build_http_client_with_timeout(timeout: Option<Duration>) -> reqwest::Client {
    if system_proxy_enabled() {
        match attempt_build(timeout, false) {
            Ok(client) => return client,
            Err(e) => tracing::warn!(
                "HTTP client with system proxy discovery failed ({}); retrying with no_proxy",
                e
            ),
        }
    }

    match attempt_build(timeout, true) {
        Ok(client) => client,
        Err(e) => {
            tracing::error!("HTTP client initialization failed ({}); using defaults", e);
            reqwest::Client::new()
        }
    }
}

fn system_proxy_enabled() -> bool {
    std::env::var("MARKOVBOT_ENABLE_SYSTEM_PROXY")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn attempt_build(
    timeout: Option<Duration>,
    no_proxy: bool,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if no_proxy {
        builder = builder.no_proxy();
    }
    builder.build()
}
