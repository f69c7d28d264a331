//! The DObj server binary: command-line args, tracing setup, and the `axum` router
//! serving the `/data` websocket route plus a healthcheck fallback (spec.md §6.1, §6.3).

pub mod firestore;
pub mod resolver;
pub mod session;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{any, get};
use axum::Router;
use clap::Parser;
use color_eyre::Result;
use tracing::info;

use crate::resolver::RoomCollection;
use crate::ws::AppState;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
	/// Port to listen on (spec.md §6.3 "HTTP_PORT").
	#[clap(long, env = "HTTP_PORT", default_value = "8080")]
	pub port: u16,
}

/// Builds the router: `/data` upgrades to the DObj websocket protocol, every other
/// path answers the healthcheck (spec.md §6.1 "HTTP GET to any non-websocket path
/// returns HTTP 200 with empty body").
pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/data", any(ws::data_handler))
		.fallback(get(healthcheck))
		.layer(tower_http::trace::TraceLayer::new_for_http())
		.with_state(state)
}

async fn healthcheck() -> &'static str {
	""
}

pub async fn main(args: Args) -> Result<()> {
	let state = AppState { rooms: Arc::new(RoomCollection::new()) };
	let app = router(state);

	let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
	let listener = tokio::net::TcpListener::bind(addr).await?;
	info!(%addr, "listening");
	axum::serve(listener, app).await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::http::StatusCode;
	use tower::ServiceExt;

	#[tokio::test]
	async fn non_data_path_returns_empty_200() {
		let state = AppState { rooms: Arc::new(RoomCollection::new()) };
		let app = router(state);
		let response = app
			.oneshot(axum::http::Request::builder().uri("/anything").body(axum::body::Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
	}
}
