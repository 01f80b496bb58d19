mod codec;
mod config;
mod model;
mod routes;
mod state;
mod timing;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use config::ServiceConfig;
use routes::configure_routes;
use state::AppState;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = match ServiceConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid service configuration: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Configuration failed: {}", e),
            ));
        }
    };

    let state = match AppState::load(&config) {
        Ok(state) => state,
        Err(e) => {
            log::error!("Failed to load models at startup: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("Model loading failed: {}", e),
            ));
        }
    };
    state.log_bypass_warnings();
    let state = web::Data::new(state);

    let bind_address = config.bind_address();
    let payload_limit = config.max_payload_bytes;

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            // Development posture: every origin, method and header is allowed.
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .supports_credentials()
                    .max_age(3600),
            )
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .app_data(routes::json_config(payload_limit))
            .configure(configure_routes)
    })
    .bind(&bind_address)?
    .run()
    .await?;

    log::info!("Application shutting down.");
    Ok(())
}
