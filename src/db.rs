use crate::types::{NewReading, NewVehicle, PlateReading, Vehicle};
use log::info;
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

/// Connection shared by every request handler.
pub type Db = Arc<Mutex<Connection>>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS persona (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    nombre TEXT NOT NULL,
    apellido TEXT NOT NULL DEFAULT '',
    ci TEXT UNIQUE
);
CREATE TABLE IF NOT EXISTS vehiculo (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    placa TEXT NOT NULL,
    marca TEXT,
    modelo TEXT,
    color TEXT,
    persona_id INTEGER REFERENCES persona(id),
    fecha_registro REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS vehiculo_placa ON vehiculo(placa COLLATE NOCASE);
CREATE TABLE IF NOT EXISTS lectura_placa (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    placa TEXT NOT NULL,
    score REAL NOT NULL,
    camera_id TEXT NOT NULL,
    image_url TEXT,
    vehiculo_id INTEGER REFERENCES vehiculo(id),
    matched INTEGER NOT NULL,
    fecha_lectura REAL NOT NULL
);
";

pub fn open(path: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;
    init(&conn)?;
    info!("Opened database at {}", path);
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init(&conn)?;
    Ok(conn)
}

pub fn shared(conn: Connection) -> Db {
    Arc::new(Mutex::new(conn))
}

fn init(conn: &Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch(SCHEMA)
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

const VEHICLE_COLUMNS: &str = "id, placa, marca, modelo, color, persona_id, fecha_registro";

fn vehicle_from_row(row: &Row) -> Result<Vehicle> {
    Ok(Vehicle {
        id: row.get(0)?,
        placa: row.get(1)?,
        marca: row.get(2)?,
        modelo: row.get(3)?,
        color: row.get(4)?,
        persona: row.get(5)?,
        fecha_registro: row.get(6)?,
    })
}

/// Case-insensitive exact match on the plate. Duplicates resolve to the
/// oldest entry.
pub fn find_vehicle_by_plate(conn: &Connection, plate: &str) -> Result<Option<Vehicle>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM vehiculo WHERE placa = ?1 COLLATE NOCASE ORDER BY id LIMIT 1",
            VEHICLE_COLUMNS
        ),
        params![plate],
        vehicle_from_row,
    )
    .optional()
}

pub fn insert_vehicle(conn: &Connection, vehicle: &NewVehicle) -> Result<Vehicle> {
    conn.execute(
        "INSERT INTO vehiculo(placa, marca, modelo, color, persona_id, fecha_registro) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            vehicle.placa.trim().to_ascii_uppercase(),
            vehicle.marca,
            vehicle.modelo,
            vehicle.color,
            vehicle.persona_id,
            now(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.query_row(
        &format!("SELECT {} FROM vehiculo WHERE id = ?1", VEHICLE_COLUMNS),
        params![id],
        vehicle_from_row,
    )
}

pub fn list_vehicles(conn: &Connection) -> Result<Vec<Vehicle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM vehiculo ORDER BY placa, id",
        VEHICLE_COLUMNS
    ))?;
    let rows = stmt.query_map([], vehicle_from_row)?;
    rows.collect()
}

const READING_COLUMNS: &str =
    "id, placa, score, camera_id, image_url, vehiculo_id, matched, fecha_lectura";

fn reading_from_row(row: &Row) -> Result<PlateReading> {
    Ok(PlateReading {
        id: row.get(0)?,
        placa: row.get(1)?,
        score: row.get(2)?,
        camera_id: row.get(3)?,
        image_url: row.get(4)?,
        vehiculo: row.get(5)?,
        matched: row.get(6)?,
        fecha_lectura: row.get(7)?,
    })
}

/// Inserts one audit record. The match flag is derived from the vehicle
/// reference so the two can never disagree.
pub fn insert_reading(conn: &Connection, reading: &NewReading) -> Result<PlateReading> {
    conn.execute(
        "INSERT INTO lectura_placa(placa, score, camera_id, image_url, vehiculo_id, matched, fecha_lectura) \
         VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)",
        params![
            reading.placa,
            reading.score,
            reading.camera_id,
            reading.vehiculo,
            reading.vehiculo.is_some(),
            now(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.query_row(
        &format!("SELECT {} FROM lectura_placa WHERE id = ?1", READING_COLUMNS),
        params![id],
        reading_from_row,
    )
}

/// Most recent readings first.
pub fn list_readings(conn: &Connection, limit: u32) -> Result<Vec<PlateReading>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM lectura_placa ORDER BY id DESC LIMIT ?1",
        READING_COLUMNS
    ))?;
    let rows = stmt.query_map(params![limit], reading_from_row)?;
    rows.collect()
}

#[cfg(test)]
pub fn count_readings(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM lectura_placa", [], |row| row.get(0))
}

#[cfg(test)]
pub fn insert_persona(conn: &Connection, nombre: &str, apellido: &str) -> Result<i64> {
    conn.execute(
        "INSERT INTO persona(nombre, apellido) VALUES (?1, ?2)",
        params![nombre, apellido],
    )?;
    Ok(conn.last_insert_rowid())
}
