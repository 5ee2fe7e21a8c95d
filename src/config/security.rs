use axum::http::{header, HeaderName, HeaderValue};
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

const NOSNIFF: &str = "nosniff";
const DENY: &str = "DENY";
const XSS_BLOCK: &str = "1; mode=block";
const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains";
const CSP_API_VALUE: &str = "default-src 'none'; frame-ancestors 'none'";
const REFERRER_POLICY_VALUE: &str = "strict-origin-when-cross-origin";
const PERMISSIONS_POLICY: &str = "permissions-policy";
const PERMISSIONS_POLICY_VALUE: &str = "geolocation=(), microphone=(), camera=()";
/// Ticket state changes with every scan.
const NO_STORE: &str = "no-store";

/// Response hardening for a JSON API. HSTS only applies behind TLS, so it is
/// sent in production alone.
pub fn security_headers<S>(router: Router<S>, include_hsts: bool) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    if include_hsts {
        tracing::info!("Security: HSTS header enabled (production mode)");
    } else {
        tracing::info!("Security: HSTS header disabled (development mode)");
    }

    let router = router
        .layer(overriding(header::X_CONTENT_TYPE_OPTIONS, NOSNIFF))
        .layer(overriding(header::X_FRAME_OPTIONS, DENY))
        .layer(overriding(header::X_XSS_PROTECTION, XSS_BLOCK))
        .layer(overriding(header::CONTENT_SECURITY_POLICY, CSP_API_VALUE))
        .layer(overriding(header::REFERRER_POLICY, REFERRER_POLICY_VALUE))
        .layer(overriding(
            HeaderName::from_static(PERMISSIONS_POLICY),
            PERMISSIONS_POLICY_VALUE,
        ))
        .layer(overriding(header::CACHE_CONTROL, NO_STORE));

    if include_hsts {
        router.layer(overriding(header::STRICT_TRANSPORT_SECURITY, HSTS_VALUE))
    } else {
        router
    }
}

fn overriding(name: HeaderName, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value))
}
