use crate::core::Core;
use axum::routing::{get, post, put};
use std::sync::Arc;

mod error;
pub mod tx;
pub mod upload;

pub use error::ApiError;

async fn healthcheck() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

async fn info(
    axum::extract::State(core): axum::extract::State<Arc<Core>>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "addresses": { "arweave": core.wallet.address() },
        "gateway": core.config.gateway_url.as_str(),
        "height": core.height.get(),
        "limits": {
            "maxDataItemBytes": core.config.max_data_item_bytes,
            "maxBundleBytes": core.config.max_bundle_bytes,
            "maxItemsPerBundle": core.config.max_items_per_bundle,
        },
    }))
}

/// Build the ingress router.
pub fn build_router(core: Arc<Core>) -> anyhow::Result<axum::Router<()>> {
    use anyhow::Context;

    let allow_origin = if core.config.allow_origin.is_empty() {
        tower_http::cors::AllowOrigin::any()
    } else {
        let origins = core
            .config
            .allow_origin
            .iter()
            .map(|o| o.parse())
            .collect::<Result<Vec<_>, _>>()
            .context("failed to parse allowed origins")?;
        tower_http::cors::AllowOrigin::list(origins)
    };
    let cors = tower_http::cors::CorsLayer::new()
        .allow_methods(tower_http::cors::AllowMethods::mirror_request())
        .allow_origin(allow_origin);

    let router = axum::Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/v1/info", get(info))
        .route("/v1/tx", post(tx::post_tx))
        .route("/v1/tx/:id", post(tx::post_tx_external_signature))
        .route("/v1/tx/:id/status", get(tx::get_status))
        .route("/v1/tx/:id/offset", get(tx::get_offset))
        .route("/v1/upload", post(upload::create_upload))
        .route(
            "/v1/upload/:id",
            get(upload::get_progress)
                .post(upload::finalize_upload)
                .delete(upload::abort_upload),
        )
        .route("/v1/upload/:id/:chunk", put(upload::put_chunk))
        // Uploads are arbitrarily large; size policy is enforced by the
        // admission pipeline, not the extractor.
        .layer(axum::extract::DefaultBodyLimit::disable())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(cors)
        .with_state(core);

    Ok(router)
}
