// Data model for live route tracking and the backend's wire types.
//
// Backend endpoints (relative to the configured API base):
// - Stop names of a route:   GET /bus/stationNames/{busNumber}
// - Station lookup by name:  GET /station?stationName={name}
// - Buses serving a station: GET /bus/stations/{stationId}
// - Pairwise ETA:            GET /kakao-api/arrival-time/single?origin=..&destination=..

use chrono::{TimeZone, Utc};
use chrono_tz::Asia::Seoul;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::eta::format_duration;

// ============================================================================
// Geometry
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// True when both axes differ by less than `epsilon` degrees.
    pub fn near(&self, other: &Coordinate, epsilon: f64) -> bool {
        (self.lat - other.lat).abs() < epsilon && (self.lon - other.lon).abs() < epsilon
    }
}

/// A coordinate with the name the ETA oracle reports it under.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedCoordinate {
    pub name: String,
    pub coordinate: Coordinate,
}

impl NamedCoordinate {
    pub fn new(name: impl Into<String>, coordinate: Coordinate) -> Self {
        Self {
            name: name.into(),
            coordinate,
        }
    }

    /// Query-string form expected by the oracle: `name,lon,lat`.
    pub fn to_query(&self) -> String {
        format!(
            "{},{},{}",
            self.name, self.coordinate.lon, self.coordinate.lat
        )
    }
}

// ============================================================================
// Route state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub sequence_index: usize,
    pub name: String,
    pub coordinate: Option<Coordinate>,
    pub is_passed: bool,
    pub is_current: bool,
    pub remaining_seconds: Option<u32>,
}

impl Stop {
    pub fn new(sequence_index: usize, name: impl Into<String>, coordinate: Coordinate) -> Self {
        Self {
            sequence_index,
            name: name.into(),
            coordinate: Some(coordinate),
            is_passed: false,
            is_current: false,
            remaining_seconds: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePosition {
    pub vehicle_id: String,
    pub coordinate: Coordinate,
    pub occupancy: Option<u32>,
}

impl VehiclePosition {
    pub fn named(&self) -> NamedCoordinate {
        NamedCoordinate::new(self.vehicle_id.clone(), self.coordinate)
    }
}

/// Renders the stream record form: `id,lon,lat[,occupancy]`.
impl fmt::Display for VehiclePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.vehicle_id, self.coordinate.lon, self.coordinate.lat
        )?;
        if let Some(occupancy) = self.occupancy {
            write!(f, ",{}", occupancy)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Bracket {
    pub current_index: usize,
    pub next_index: usize,
    pub remaining_seconds: u32,
    pub visual_progress: u8,
}

/// Everything the route screen renders, as one snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteView {
    pub route_id: String,
    pub stops: Vec<Stop>,
    pub bracket: Option<BracketView>,
    pub vehicle: Option<VehiclePosition>,
    pub stop_writes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketView {
    #[serde(flatten)]
    pub bracket: Bracket,
    pub duration_message: String,
}

impl From<Bracket> for BracketView {
    fn from(bracket: Bracket) -> Self {
        Self {
            duration_message: format_duration(bracket.remaining_seconds),
            bracket,
        }
    }
}

// ============================================================================
// Backend wire types
// ============================================================================

/// Every backend response wraps its payload in `{ "data": ... }`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: T,
}

/// Station location as the directory reports it: `x` is latitude, `y` longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StationLocation {
    pub x: f64,
    pub y: f64,
}

impl From<StationLocation> for Coordinate {
    fn from(location: StationLocation) -> Self {
        Coordinate::new(location.x, location.y)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub location: Option<StationLocation>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusAtStation {
    pub id: String,
    pub bus_number: String,
    #[serde(default)]
    pub occupied_seats: u32,
    #[serde(default)]
    pub location: Option<StationLocation>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtaReply {
    pub name: String,
    pub duration_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Arrival {
    pub bus_number: String,
    pub occupied_seats: u32,
    pub remaining_seconds: u32,
    pub duration_message: String,
}

// ============================================================================
// Time helpers
// ============================================================================

pub fn current_timestamp() -> i64 {
    Utc::now().timestamp()
}

pub fn format_timestamp_full(timestamp: i64) -> String {
    match Utc.timestamp_opt(timestamp, 0).single() {
        Some(dt) => {
            let seoul_time = dt.with_timezone(&Seoul);
            seoul_time.format("%Y-%m-%d %H:%M:%S").to_string()
        }
        None => format!("Invalid timestamp: {}", timestamp),
    }
}
