mod config;
mod db;
mod error;
mod recognizer;
mod routes;
mod scan;
mod types;

use crate::config::Config;
use crate::recognizer::PlateRecognizer;
use crate::scan::ScanService;
use env_logger::Env;
use log::{error, info, warn};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Starting residencial-alpr");

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };
    let conn = match db::open(&config.database_path) {
        Ok(conn) => conn,
        Err(e) => {
            error!("Unable to open db at {}: {}", config.database_path, e);
            process::exit(1);
        }
    };
    let recognizer = match PlateRecognizer::from_config(&config) {
        Ok(recognizer) => Some(recognizer),
        Err(e) => {
            warn!("{}; POST /alpr/ will answer 500 until it is set", e);
            None
        }
    };
    info!(
        "Using plate recognizer at {} with regions {:?}",
        config.plate_url, config.plate_regions
    );

    let service = Arc::new(ScanService::new(
        db::shared(conn),
        recognizer,
        config.plate_regions.clone(),
    ));
    warp::serve(routes::routes(service, config.max_upload_bytes))
        .run(([0, 0, 0, 0], config.port))
        .await;
    info!("Exiting main");
}
