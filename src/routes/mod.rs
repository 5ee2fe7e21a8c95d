use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::admission::{AdmissionOrchestrator, PurchaseRegistry};
use crate::config::{create_cors_layer, security_headers};
use crate::handlers::{
    admit, generate_individual_tickets, health_check, lookup_ticket, register_purchase,
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: AdmissionOrchestrator,
    pub registry: PurchaseRegistry,
}

pub struct RouteOptions<'a> {
    pub include_hsts: bool,
    pub cors_allowed_origins: Option<&'a str>,
}

pub fn create_routes(state: AppState, options: RouteOptions<'_>) -> Router {
    let api = Router::new()
        .route("/admissions", post(admit))
        .route("/tickets/:identifier", get(lookup_ticket))
        .route("/purchases", post(register_purchase))
        .route(
            "/purchases/:purchase_id/individual-tickets",
            post(generate_individual_tickets),
        );

    let router = Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api)
        .with_state(state);

    security_headers(router, options.include_hsts)
        .layer(create_cors_layer(options.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
}
