// Live route tracking server
// Follows one bus along its route and serves the route screen and the
// selected station's arrival board over HTTP.

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use serde::Serialize;
use std::sync::Arc;

mod arrivals;
mod bracket;
mod config;
mod directory;
mod error;
mod eta;
mod logging;
mod models;
mod orchestrator;
mod progress;
mod session;
mod stream;

use arrivals::{ArrivalBoard, ArrivalHandle};
use bracket::BracketLocator;
use config::TrackerConfig;
use directory::{HttpDirectory, RouteDirectory};
use error::TrackerError;
use eta::{CacheKey, EtaClient, HttpEtaOracle};
use models::{current_timestamp, format_timestamp_full};
use orchestrator::{RefreshOrchestrator, RouteHandle, TrackerSettings};
use session::SessionContext;
use stream::WebSocketFeed;

#[derive(Clone)]
struct AppState {
    route: Arc<RouteHandle>,
    arrivals: Arc<ArrivalHandle>,
    session: Arc<SessionContext>,
    directory: Arc<RouteDirectory<HttpDirectory>>,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        ApiResponse {
            success: true,
            data: Some(data),
            error: None,
            timestamp: current_timestamp(),
        }
    }

    fn error(message: String) -> Self {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message),
            timestamp: current_timestamp(),
        }
    }
}

fn error_response(e: &TrackerError) -> HttpResponse {
    let body = ApiResponse::<()>::error(e.to_string());
    match e {
        TrackerError::NotFound(_) => HttpResponse::NotFound().json(body),
        TrackerError::Config(_) => HttpResponse::InternalServerError().json(body),
        _ => HttpResponse::BadGateway().json(body),
    }
}

fn no_station_selected() -> HttpResponse {
    HttpResponse::NotFound().json(ApiResponse::<()>::error("No station selected".to_string()))
}

// ============================================================================
// Route screen
// ============================================================================

async fn get_route(state: web::Data<AppState>) -> HttpResponse {
    let view = state.route.view();
    tracing::debug!(
        stops = view.stops.len(),
        has_bracket = view.bracket.is_some(),
        "Route view requested"
    );
    HttpResponse::Ok().json(ApiResponse::success(view))
}

async fn get_route_stops(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.route.stops()))
}

async fn get_route_bracket(state: web::Data<AppState>) -> HttpResponse {
    let bracket = state.route.bracket().map(models::BracketView::from);
    HttpResponse::Ok().json(ApiResponse::success(bracket))
}

async fn get_route_vehicle(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(ApiResponse::success(state.route.vehicle()))
}

async fn refresh_route(state: web::Data<AppState>) -> HttpResponse {
    tracing::info!(route_id = %state.route.route_id(), "Manual refresh requested");

    if state.route.refresh().await {
        HttpResponse::Accepted().json(ApiResponse::success("Refresh scheduled"))
    } else {
        HttpResponse::ServiceUnavailable()
            .json(ApiResponse::<()>::error("Route tracker is not running".to_string()))
    }
}

async fn select_stop(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let name = path.into_inner();

    match state.directory.resolve_station(&name).await {
        Ok(station) => {
            state.session.select(station.clone());
            HttpResponse::Ok().json(ApiResponse::success(station))
        }
        Err(e) => {
            tracing::warn!(stop = %name, error = %e, "Failed to select stop");
            error_response(&e)
        }
    }
}

// ============================================================================
// Session & arrival board
// ============================================================================

async fn get_selected_station(state: web::Data<AppState>) -> HttpResponse {
    match state.session.current() {
        Some(station) => HttpResponse::Ok().json(ApiResponse::success(station)),
        None => no_station_selected(),
    }
}

async fn clear_selected_station(state: web::Data<AppState>) -> HttpResponse {
    let cleared = state.session.clear();
    HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({ "cleared": cleared })))
}

async fn get_station_arrivals(state: web::Data<AppState>) -> HttpResponse {
    let Some(station) = state.session.current() else {
        return no_station_selected();
    };

    HttpResponse::Ok().json(ApiResponse::success(serde_json::json!({
        "station": station,
        "arrivals": state.arrivals.rows(),
    })))
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let now = current_timestamp();
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "ridetrack",
        "version": env!("CARGO_PKG_VERSION"),
        "routeId": state.route.route_id(),
        "trackerRunning": state.route.is_running(),
        "arrivalBoardRunning": state.arrivals.is_running(),
        "timestamp": now,
        "localTime": format_timestamp_full(now),
    }))
}

// ============================================================================
// Server Setup
// ============================================================================

async fn run_server(config: TrackerConfig) -> std::io::Result<()> {
    let http = reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
        .map_err(std::io::Error::other)?;

    let directory_client = HttpDirectory::new(http.clone(), &config.api_base, config.token.clone());
    let oracle = HttpEtaOracle::new(http, &config.api_base, config.token.clone());

    let eta = Arc::new(EtaClient::new(
        oracle.clone(),
        CacheKey::Destination,
        config.eta_cache_ttl,
    ));
    let route = RefreshOrchestrator::new(
        TrackerSettings::from_config(&config),
        RouteDirectory::new(directory_client.clone()),
        Arc::new(BracketLocator::new(eta)),
        WebSocketFeed::new(
            &config.stream_url,
            &config.stream_topic,
            config.request_timeout,
        ),
    )
    .spawn();

    let session = Arc::new(SessionContext::new());
    let arrivals = Arc::new(ArrivalBoard::new(
        directory_client.clone(),
        oracle,
        config.eta_cache_ttl,
    ))
    .spawn(session.subscribe(), config.poll_interval);

    let app_state = AppState {
        route: Arc::new(route),
        arrivals: Arc::new(arrivals),
        session,
        directory: Arc::new(RouteDirectory::new(directory_client)),
    };

    tracing::info!(
        bind = %config.bind_addr,
        port = config.port,
        route_id = %config.route_id,
        vehicle = %config.tracked_vehicle(),
        poll_interval_secs = config.poll_interval.as_secs(),
        "Server starting"
    );

    serve(app_state, &config.bind_addr, config.port).await
}

/// Bind and run the HTTP server, then stop the trackers however it ends.
async fn serve(app_state: AppState, bind_addr: &str, port: u16) -> std::io::Result<()> {
    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .route("/health", web::get().to(health_check))
            .service(
                web::scope("/api")
                    .route("/route", web::get().to(get_route))
                    .route("/route/stops", web::get().to(get_route_stops))
                    .route("/route/bracket", web::get().to(get_route_bracket))
                    .route("/route/vehicle", web::get().to(get_route_vehicle))
                    .route("/route/refresh", web::post().to(refresh_route))
                    .route("/route/stops/{name}/select", web::post().to(select_stop))
                    .route("/session/station", web::get().to(get_selected_station))
                    .route("/session/station", web::delete().to(clear_selected_station))
                    .route("/station/arrivals", web::get().to(get_station_arrivals)),
            )
    })
    .bind((bind_addr, port));

    let result = match server {
        Ok(server) => server.run().await,
        Err(e) => {
            tracing::error!(bind = %bind_addr, port, error = %e, "Failed to bind server");
            Err(e)
        }
    };

    tracing::info!("Server stopped, tearing down trackers");
    app_state.route.shutdown().await;
    app_state.arrivals.shutdown().await;

    result
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> std::io::Result<()> {
    logging::init_logging();

    let config = match TrackerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            if let Some(path) = TrackerConfig::config_path() {
                tracing::error!(
                    path = %path.display(),
                    "Set RIDETRACK_ROUTE or add route_id to the config file"
                );
            }
            std::process::exit(1);
        }
    };

    actix_web::rt::System::new().block_on(run_server(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::MockDirectory;
    use crate::eta::tests::MockOracle;
    use crate::orchestrator::tests::ChannelSource;
    use std::time::Duration;

    fn app_state() -> AppState {
        let eta = Arc::new(EtaClient::new(
            MockOracle::default(),
            CacheKey::Destination,
            Duration::from_secs(30),
        ));
        let (source, _frames) = ChannelSource::new();
        let route = RefreshOrchestrator::new(
            TrackerSettings {
                route_id: "401".to_string(),
                tracked_vehicle: "401".to_string(),
                poll_interval: Duration::from_secs(30),
            },
            RouteDirectory::new(MockDirectory::default()),
            Arc::new(BracketLocator::new(eta)),
            source,
        )
        .spawn();

        let session = Arc::new(SessionContext::new());
        let arrivals = Arc::new(ArrivalBoard::new(
            MockDirectory::default(),
            MockOracle::default(),
            Duration::from_secs(30),
        ))
        .spawn(session.subscribe(), Duration::from_secs(30));

        // Never called: stop selection is not exercised here
        let directory = HttpDirectory::new(reqwest::Client::new(), "http://127.0.0.1:9", None);

        AppState {
            route: Arc::new(route),
            arrivals: Arc::new(arrivals),
            session,
            directory: Arc::new(RouteDirectory::new(directory)),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_stops_trackers() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let state = app_state();
        assert!(state.route.is_running());
        assert!(state.arrivals.is_running());

        let result = serve(state.clone(), "127.0.0.1", port).await;

        assert!(result.is_err());
        assert!(!state.route.is_running());
        assert!(!state.arrivals.is_running());
    }
}
