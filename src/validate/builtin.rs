//! Range checks contributed by the built-in record classes.
//!
//! Payload prefixes these checks read (little-endian):
//!
//! | Record | Layout | Constraint |
//! |--------|--------|------------|
//! | experiment info / comment | UTF-8 text | valid UTF-8 |
//! | GPS position  | `f64 lat, f64 lon, f64 alt_m` | lat ±90, lon ±180, alt −1 km..100 km |
//! | GPS velocity  | `f32 north, f32 east, f32 down` (m/s) | each within ±600 |
//! | camera image  | `u32 width, u32 height, u32 stride, pixels…` | 1..=16384, stride ≥ width, pixels fit |
//! | LiDAR frame   | `u16 frame_id, u16 columns, u16 rows, …` | columns ∈ {512,1024,2048}, rows ∈ {16,32,64,128} |
//! | weather       | `f32 temp_c, f32 humidity_pct, f32 pressure_hpa` | −90..60, 0..100, 800..1100 |

use byteorder::{ByteOrder, LittleEndian};

use super::{ValidationError, ValidatorRegistry};
use crate::block::BlockHeader;
use crate::class_table::{
    ClassTable, CAMERA_IMAGE, CLASS_CAMERA, CLASS_EXPERIMENT, CLASS_GPS_PVT, CLASS_LIDAR,
    CLASS_WEATHER, EXPERIMENT_COMMENT, EXPERIMENT_INFO, LIDAR_FRAME, PVT_POSITION, PVT_VELOCITY,
    WEATHER_CONDITIONS,
};

const MAX_IMAGE_SIDE: u32 = 16_384;
const LIDAR_COLUMNS: [u16; 3] = [512, 1024, 2048];
const LIDAR_ROWS: [u16; 4] = [16, 32, 64, 128];

pub fn register(registry: &mut ValidatorRegistry, table: &ClassTable) {
    registry
        .register_for_class(table, CLASS_EXPERIMENT, EXPERIMENT_INFO, utf8_text)
        .register_for_class(table, CLASS_EXPERIMENT, EXPERIMENT_COMMENT, utf8_text)
        .register_for_class(table, CLASS_GPS_PVT, PVT_POSITION, gps_position)
        .register_for_class(table, CLASS_GPS_PVT, PVT_VELOCITY, gps_velocity)
        .register_for_class(table, CLASS_CAMERA, CAMERA_IMAGE, camera_image)
        .register_for_class(table, CLASS_LIDAR, LIDAR_FRAME, lidar_frame)
        .register_for_class(table, CLASS_WEATHER, WEATHER_CONDITIONS, weather);
}

fn need(payload: &[u8], needed: usize) -> Result<(), ValidationError> {
    if payload.len() < needed {
        return Err(ValidationError::TooShort { needed, actual: payload.len() });
    }
    Ok(())
}

/// NaN fails every range.
fn in_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange { field, value, min, max })
    }
}

pub fn utf8_text(_: &BlockHeader, payload: &[u8]) -> Result<(), ValidationError> {
    std::str::from_utf8(payload)
        .map(|_| ())
        .map_err(|e| ValidationError::Invalid(format!("text is not UTF-8: {e}")))
}

pub fn gps_position(_: &BlockHeader, payload: &[u8]) -> Result<(), ValidationError> {
    need(payload, 24)?;
    in_range("latitude", LittleEndian::read_f64(&payload[0..8]), -90.0, 90.0)?;
    in_range("longitude", LittleEndian::read_f64(&payload[8..16]), -180.0, 180.0)?;
    in_range("altitude_m", LittleEndian::read_f64(&payload[16..24]), -1_000.0, 100_000.0)
}

pub fn gps_velocity(_: &BlockHeader, payload: &[u8]) -> Result<(), ValidationError> {
    need(payload, 12)?;
    for (field, at) in [("velocity_north", 0), ("velocity_east", 4), ("velocity_down", 8)] {
        in_range(field, LittleEndian::read_f32(&payload[at..at + 4]) as f64, -600.0, 600.0)?;
    }
    Ok(())
}

pub fn camera_image(_: &BlockHeader, payload: &[u8]) -> Result<(), ValidationError> {
    need(payload, 12)?;
    let width  = LittleEndian::read_u32(&payload[0..4]);
    let height = LittleEndian::read_u32(&payload[4..8]);
    let stride = LittleEndian::read_u32(&payload[8..12]);
    in_range("width", width as f64, 1.0, MAX_IMAGE_SIDE as f64)?;
    in_range("height", height as f64, 1.0, MAX_IMAGE_SIDE as f64)?;
    if stride < width {
        return Err(ValidationError::Invalid(format!("stride {stride} narrower than width {width}")));
    }
    let pixels = stride as u64 * height as u64;
    if (payload.len() as u64 - 12) < pixels {
        return Err(ValidationError::TooShort {
            needed: (12 + pixels) as usize,
            actual: payload.len(),
        });
    }
    Ok(())
}

pub fn lidar_frame(_: &BlockHeader, payload: &[u8]) -> Result<(), ValidationError> {
    need(payload, 6)?;
    let columns = LittleEndian::read_u16(&payload[2..4]);
    let rows    = LittleEndian::read_u16(&payload[4..6]);
    if !LIDAR_COLUMNS.contains(&columns) {
        return Err(ValidationError::Invalid(format!("unsupported column count {columns}")));
    }
    if !LIDAR_ROWS.contains(&rows) {
        return Err(ValidationError::Invalid(format!("unsupported channel count {rows}")));
    }
    Ok(())
}

pub fn weather(_: &BlockHeader, payload: &[u8]) -> Result<(), ValidationError> {
    need(payload, 12)?;
    in_range("temperature_c", LittleEndian::read_f32(&payload[0..4]) as f64, -90.0, 60.0)?;
    in_range("humidity_pct", LittleEndian::read_f32(&payload[4..8]) as f64, 0.0, 100.0)?;
    in_range("pressure_hpa", LittleEndian::read_f32(&payload[8..12]) as f64, 800.0, 1_100.0)
}
