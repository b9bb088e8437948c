//! CORS (Cross-Origin Resource Sharing) Middleware
//!
//! Browser dashboards fetch the REST passthrough and open `/ws` from
//! their own origins, so the gateway answers preflights permissively.

use tower_http::cors::{Any, CorsLayer};

/// Create the CORS layer applied to the whole router
///
/// ## Production Note
///
/// Deployments that know their dashboard origins should narrow
/// `allow_origin()` to that list.
pub fn create_cors_layer() -> CorsLayer {
    CorsLayer::new()
        // Any origin may read market data; nothing here is authenticated
        .allow_origin(Any)
        // The surface is GET-only plus the WS upgrade, but preflights
        // may probe other methods
        .allow_methods(Any)
        .allow_headers(Any)
        // Keep preflight answers cached for an hour
        .max_age(std::time::Duration::from_secs(3600))
}
