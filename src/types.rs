use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One plate guess as returned by the recognizer.
#[derive(Debug, Clone, Deserialize)]
pub struct PlateCandidate {
    #[serde(default)]
    pub plate: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct RecognizerResponse {
    #[serde(default)]
    pub results: Vec<PlateCandidate>,
}

/// The winning candidate after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct SpottedPlate {
    pub plate: String,
    pub score: f64,
}

/// A validated `POST /alpr/` request.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub upload: Upload,
    pub camera_id: String,
    pub regions: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub content_type: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Vehicle {
    pub id: i64,
    pub placa: String,
    pub marca: Option<String>,
    pub modelo: Option<String>,
    pub color: Option<String>,
    pub persona: Option<i64>,
    pub fecha_registro: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewVehicle {
    pub placa: String,
    #[serde(default)]
    pub marca: Option<String>,
    #[serde(default)]
    pub modelo: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub persona_id: Option<i64>,
}

/// Audit record of a single scan attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlateReading {
    pub id: i64,
    pub placa: String,
    pub score: f64,
    pub camera_id: String,
    pub image_url: Option<String>,
    pub vehiculo: Option<i64>,
    #[serde(rename = "match")]
    pub matched: bool,
    pub fecha_lectura: f64,
}

#[derive(Debug, Clone)]
pub struct NewReading {
    pub placa: String,
    pub score: f64,
    pub camera_id: String,
    pub vehiculo: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanStatus {
    Ok,
    NoPlateFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResponse {
    pub status: ScanStatus,
    pub plate: Option<String>,
    pub score: Option<f64>,
    #[serde(rename = "match")]
    pub matched: bool,
    pub vehiculo: Option<Vehicle>,
    pub lectura: PlateReading,
}
