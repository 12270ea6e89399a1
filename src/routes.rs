use crate::db;
use crate::error::ScanError;
use crate::scan::{self, ScanService};
use crate::types::{NewVehicle, ScanResponse};
use log::{error, info, warn};
use rusqlite::ErrorCode;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::reply::{Json, WithStatus};
use warp::{Filter, Rejection, Reply};

const DEFAULT_READINGS_LIMIT: u32 = 50;
const MAX_READINGS_LIMIT: u32 = 500;

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    limit: Option<u32>,
}

pub fn routes(
    service: Arc<ScanService>,
    max_upload_bytes: u64,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let scan = warp::path!("alpr")
        .and(warp::post())
        .and(with_service(service.clone()))
        .and(warp::multipart::form().max_length(max_upload_bytes))
        .and_then(handle_scan);

    let readings = warp::path!("alpr" / "lecturas")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and(warp::query::<ReadingsQuery>())
        .and_then(handle_list_readings);

    let list_vehicles = warp::path!("vehiculos")
        .and(warp::get())
        .and(with_service(service.clone()))
        .and_then(handle_list_vehicles);

    let create_vehicle = warp::path!("vehiculos")
        .and(warp::post())
        .and(with_service(service))
        .and(warp::body::json())
        .and_then(handle_create_vehicle);

    scan.or(readings)
        .or(list_vehicles)
        .or(create_vehicle)
        .recover(recover)
        .with(warp::log("residencial_alpr::http"))
}

fn with_service(
    service: Arc<ScanService>,
) -> impl Filter<Extract = (Arc<ScanService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

fn respond<T: serde::Serialize>(result: Result<T, ScanError>, ok: StatusCode) -> WithStatus<Json> {
    match result {
        Ok(body) => warp::reply::with_status(warp::reply::json(&body), ok),
        Err(e) => {
            if e.status().is_client_error() {
                warn!("Rejected request: {}", e);
            } else {
                error!("Request failed: {}", e);
            }
            e.into_reply()
        }
    }
}

async fn handle_scan(
    service: Arc<ScanService>,
    form: FormData,
) -> Result<WithStatus<Json>, Infallible> {
    Ok(respond(run_scan(&service, form).await, StatusCode::OK))
}

async fn run_scan(service: &ScanService, form: FormData) -> Result<ScanResponse, ScanError> {
    // Configuration problems win over anything wrong with the upload.
    service.recognizer()?;
    let request = scan::parse_upload(form).await?;
    info!(
        "Scanning {} ({} bytes) from camera '{}'",
        request.upload.file_name,
        request.upload.data.len(),
        request.camera_id
    );
    service.scan(request).await
}

async fn handle_list_readings(
    service: Arc<ScanService>,
    query: ReadingsQuery,
) -> Result<WithStatus<Json>, Infallible> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_READINGS_LIMIT)
        .min(MAX_READINGS_LIMIT);
    let conn = service.db().lock().await;
    let result = db::list_readings(&conn, limit).map_err(ScanError::from);
    Ok(respond(result, StatusCode::OK))
}

async fn handle_list_vehicles(service: Arc<ScanService>) -> Result<WithStatus<Json>, Infallible> {
    let conn = service.db().lock().await;
    let result = db::list_vehicles(&conn).map_err(ScanError::from);
    Ok(respond(result, StatusCode::OK))
}

async fn handle_create_vehicle(
    service: Arc<ScanService>,
    vehicle: NewVehicle,
) -> Result<WithStatus<Json>, Infallible> {
    if vehicle.placa.trim().is_empty() {
        return Ok(respond::<()>(
            Err(ScanError::Validation("placa is required".to_string())),
            StatusCode::CREATED,
        ));
    }
    let conn = service.db().lock().await;
    let result = db::insert_vehicle(&conn, &vehicle).map_err(|e| match e {
        rusqlite::Error::SqliteFailure(ref failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            ScanError::Validation("unknown persona".to_string())
        }
        other => ScanError::from(other),
    });
    if let Ok(stored) = &result {
        info!("Registered vehicle {} (id {})", stored.placa, stored.id);
    }
    Ok(respond(result, StatusCode::CREATED))
}

/// Turns warp's own rejections into the same JSON error shape handlers use.
pub async fn recover(err: Rejection) -> Result<WithStatus<Json>, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_string())
    } else if let Some(e) = err.find::<warp::reject::MissingHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::PayloadTooLarge>() {
        (StatusCode::PAYLOAD_TOO_LARGE, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::UnsupportedMediaType>() {
        (StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string())
    } else if let Some(e) = err.find::<warp::reject::MethodNotAllowed>() {
        (StatusCode::METHOD_NOT_ALLOWED, e.to_string())
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": message })),
        status,
    ))
}
