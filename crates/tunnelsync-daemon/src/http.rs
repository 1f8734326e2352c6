//! Shared HTTP client construction.

/// Header that makes ngrok skip its browser interstitial page.
pub const NGROK_SKIP_WARNING_HEADER: &str = "ngrok-skip-browser-warning";

/// Build the `reqwest` client shared by the prober, discoverer and publisher.
///
/// Timeouts are set per request, so the client itself has none.
pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    // reqwest is built with rustls-no-provider. `Err` only means a provider
    // was already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    reqwest::Client::builder()
        .user_agent(concat!("tunnelsync/", env!("CARGO_PKG_VERSION")))
        .build()
}
