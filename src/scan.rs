use crate::db::{self, Db};
use crate::error::ScanError;
use crate::recognizer::PlateRecognizer;
use crate::types::{
    NewReading, PlateCandidate, ScanRequest, ScanResponse, ScanStatus, SpottedPlate, Upload,
};
use bytes::{Buf, BytesMut};
use futures::{pin_mut, StreamExt};
use log::{debug, info, warn};
use warp::multipart::FormData;

const UPLOAD_FIELD: &str = "upload";
const DEFAULT_FILE_NAME: &str = "frame.jpg";

/// Reads the multipart body of `POST /alpr/` into a validated request.
pub async fn parse_upload(form: FormData) -> Result<ScanRequest, ScanError> {
    pin_mut!(form);
    let mut upload: Option<Upload> = None;
    let mut camera_id = String::new();
    let mut regions: Option<Vec<String>> = None;

    while let Some(part) = form.next().await {
        let part = part.map_err(|e| ScanError::Validation(format!("bad multipart body: {}", e)))?;
        let name = part.name().to_string();
        debug!("Got part {}", name);
        match name.as_str() {
            UPLOAD_FIELD => {
                let file_name = part
                    .filename()
                    .filter(|f| !f.is_empty())
                    .unwrap_or(DEFAULT_FILE_NAME)
                    .to_string();
                let content_type = part.content_type().unwrap_or_default().to_string();
                let data = read_part(part).await?;
                upload = Some(Upload {
                    file_name,
                    content_type,
                    data: data.freeze(),
                });
            }
            "camera_id" => {
                let data = read_part(part).await?;
                camera_id = text(&data)?.trim().to_string();
            }
            "regions" => {
                let data = read_part(part).await?;
                let parsed = crate::config::split_regions(text(&data)?);
                if !parsed.is_empty() {
                    regions.get_or_insert_with(Vec::new).extend(parsed);
                }
            }
            _ => warn!("Ignoring part {}", name),
        }
    }

    let upload = upload.ok_or_else(|| ScanError::Validation("missing upload".to_string()))?;
    if !upload.content_type.starts_with("image/") {
        return Err(ScanError::Validation("not an image".to_string()));
    }
    Ok(ScanRequest {
        upload,
        camera_id,
        regions,
    })
}

async fn read_part(part: warp::multipart::Part) -> Result<BytesMut, ScanError> {
    let mut data = BytesMut::new();
    let stream = part.stream();
    pin_mut!(stream);
    while let Some(buf) = stream.next().await {
        let buf = buf.map_err(|e| ScanError::Validation(format!("bad multipart body: {}", e)))?;
        data.extend_from_slice(buf.chunk());
    }
    Ok(data)
}

fn text(data: &[u8]) -> Result<&str, ScanError> {
    std::str::from_utf8(data).map_err(|_| ScanError::Validation("form fields must be UTF-8".into()))
}

/// Picks the highest scoring candidate, keeping the earliest on ties, and
/// normalizes its plate to uppercase. A missing score counts as zero.
pub fn select_best(candidates: &[PlateCandidate]) -> Option<SpottedPlate> {
    let mut best: Option<(&PlateCandidate, f64)> = None;
    for candidate in candidates {
        let score = candidate.score.unwrap_or(0.0);
        match best {
            Some((_, best_score)) if score <= best_score => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(candidate, score)| SpottedPlate {
        plate: candidate
            .plate
            .as_deref()
            .unwrap_or_default()
            .to_ascii_uppercase(),
        score,
    })
}

/// The plate scan reconciliation flow behind `POST /alpr/`.
pub struct ScanService {
    db: Db,
    recognizer: Option<PlateRecognizer>,
    default_regions: Vec<String>,
}

impl ScanService {
    pub fn new(
        db: Db,
        recognizer: Option<PlateRecognizer>,
        default_regions: Vec<String>,
    ) -> ScanService {
        ScanService {
            db,
            recognizer,
            default_regions,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Fails fast when the recognizer is not configured so that no upload is
    /// read for a request that cannot succeed.
    pub fn recognizer(&self) -> Result<&PlateRecognizer, ScanError> {
        self.recognizer
            .as_ref()
            .ok_or(ScanError::Configuration("PLATE_TOKEN"))
    }

    /// Runs one scan to completion. Exactly one audit record is written when
    /// the recognizer answers successfully, and none otherwise.
    pub async fn scan(&self, request: ScanRequest) -> Result<ScanResponse, ScanError> {
        let recognizer = self.recognizer()?;
        let regions = request.regions.as_ref().unwrap_or(&self.default_regions);

        let candidates = recognizer
            .recognize(&request.upload, regions, &request.camera_id)
            .await?;

        let spotted = match select_best(&candidates) {
            Some(spotted) => spotted,
            None => {
                let lectura = {
                    let conn = self.db.lock().await;
                    db::insert_reading(
                        &conn,
                        &NewReading {
                            placa: String::new(),
                            score: 0.0,
                            camera_id: request.camera_id.clone(),
                            vehiculo: None,
                        },
                    )?
                };
                info!(
                    "No plate found in frame from camera '{}' (reading {})",
                    request.camera_id, lectura.id
                );
                return Ok(ScanResponse {
                    status: ScanStatus::NoPlateFound,
                    plate: None,
                    score: None,
                    matched: false,
                    vehiculo: None,
                    lectura,
                });
            }
        };

        let (vehiculo, lectura) = {
            let conn = self.db.lock().await;
            let vehiculo = db::find_vehicle_by_plate(&conn, &spotted.plate)?;
            let lectura = db::insert_reading(
                &conn,
                &NewReading {
                    placa: spotted.plate.clone(),
                    score: spotted.score,
                    camera_id: request.camera_id.clone(),
                    vehiculo: vehiculo.as_ref().map(|v| v.id),
                },
            )?;
            (vehiculo, lectura)
        };
        info!(
            "Spotted plate {} (score {:.3}) from camera '{}': {}",
            spotted.plate,
            spotted.score,
            request.camera_id,
            if vehiculo.is_some() { "registered" } else { "unknown" }
        );

        Ok(ScanResponse {
            status: ScanStatus::Ok,
            plate: Some(spotted.plate),
            score: Some(spotted.score),
            matched: vehiculo.is_some(),
            vehiculo,
            lectura,
        })
    }
}
