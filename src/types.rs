use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants;

/// A monitored location that is extracted as one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl Entity {
    pub fn new(key: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        Self {
            key: key.into(),
            latitude,
            longitude,
        }
    }

    pub fn default_cities() -> Vec<Entity> {
        constants::DEFAULT_CITIES
            .iter()
            .map(|(name, lat, lon)| Entity::new(*name, *lat, *lon))
            .collect()
    }
}

/// Which upstream provider produced a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    Primary,
    Fallback,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Primary => write!(f, "primary"),
            SourceKind::Fallback => write!(f, "fallback"),
        }
    }
}

/// Top-level payload shapes the transformer knows how to flatten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaVariant {
    /// `{"results": [{"measurements": [...]}, ...]}`
    OpenAqLatest,
    /// `{"hourly": {"time": [...], "pm10": [...], ...}}`
    OpenMeteoHourly,
    Unknown,
}

impl SchemaVariant {
    pub fn detect(payload: &serde_json::Value) -> Self {
        match payload.as_object() {
            Some(obj) if obj.contains_key("results") => SchemaVariant::OpenAqLatest,
            Some(obj) if obj.contains_key("hourly") => SchemaVariant::OpenMeteoHourly,
            _ => SchemaVariant::Unknown,
        }
    }
}

/// An immutable record of one successful upstream response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub entity_key: String,
    pub source: SourceKind,
    pub fetched_at: DateTime<Utc>,
    pub schema_variant: SchemaVariant,
    /// Hex SHA-256 of the serialized payload
    pub sha256: String,
    pub payload: serde_json::Value,
}

impl RawSnapshot {
    pub fn new(
        entity_key: impl Into<String>,
        source: SourceKind,
        fetched_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        let schema_variant = SchemaVariant::detect(&payload);
        let sha256 = payload_digest(&payload);
        Self {
            entity_key: entity_key.into(),
            source,
            fetched_at,
            schema_variant,
            sha256,
            payload,
        }
    }

    /// Store key: readable slug of the entity, microsecond fetch time, and a
    /// digest of the exact entity key so that keys differing only in case or
    /// punctuation never collide.
    pub fn store_key(&self) -> String {
        let slug: String = self
            .entity_key
            .chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
            .collect();
        format!(
            "{}{}_raw_{}_{}.json",
            constants::RAW_PREFIX,
            slug,
            self.fetched_at.format("%Y%m%dT%H%M%S%6fZ"),
            &key_digest(&self.entity_key)[..12]
        )
    }
}

fn key_digest(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn payload_digest(payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Pollutant measurements that take part in cleaning and scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Pollutant {
    Pm10,
    Pm2_5,
    CarbonMonoxide,
    NitrogenDioxide,
    SulphurDioxide,
    Ozone,
}

impl Pollutant {
    pub const ALL: [Pollutant; 6] = [
        Pollutant::Pm10,
        Pollutant::Pm2_5,
        Pollutant::CarbonMonoxide,
        Pollutant::NitrogenDioxide,
        Pollutant::SulphurDioxide,
        Pollutant::Ozone,
    ];

    pub fn column(self) -> &'static str {
        match self {
            Pollutant::Pm10 => constants::COL_PM10,
            Pollutant::Pm2_5 => constants::COL_PM2_5,
            Pollutant::CarbonMonoxide => constants::COL_CO,
            Pollutant::NitrogenDioxide => constants::COL_NO2,
            Pollutant::SulphurDioxide => constants::COL_SO2,
            Pollutant::Ozone => constants::COL_O3,
        }
    }

    /// Resolve a provider parameter name (canonical or OpenAQ short form)
    pub fn from_parameter(name: &str) -> Option<Pollutant> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pm10" => Some(Pollutant::Pm10),
            "pm2_5" | "pm25" | "pm2.5" => Some(Pollutant::Pm2_5),
            "carbon_monoxide" | "co" => Some(Pollutant::CarbonMonoxide),
            "nitrogen_dioxide" | "no2" => Some(Pollutant::NitrogenDioxide),
            "sulphur_dioxide" | "so2" => Some(Pollutant::SulphurDioxide),
            "ozone" | "o3" => Some(Pollutant::Ozone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    pub pm10: Option<f64>,
    pub pm2_5: Option<f64>,
    pub carbon_monoxide: Option<f64>,
    pub nitrogen_dioxide: Option<f64>,
    pub sulphur_dioxide: Option<f64>,
    pub ozone: Option<f64>,
}

impl Measurements {
    pub fn get(&self, pollutant: Pollutant) -> Option<f64> {
        match pollutant {
            Pollutant::Pm10 => self.pm10,
            Pollutant::Pm2_5 => self.pm2_5,
            Pollutant::CarbonMonoxide => self.carbon_monoxide,
            Pollutant::NitrogenDioxide => self.nitrogen_dioxide,
            Pollutant::SulphurDioxide => self.sulphur_dioxide,
            Pollutant::Ozone => self.ozone,
        }
    }

    pub fn set(&mut self, pollutant: Pollutant, value: Option<f64>) {
        let slot = match pollutant {
            Pollutant::Pm10 => &mut self.pm10,
            Pollutant::Pm2_5 => &mut self.pm2_5,
            Pollutant::CarbonMonoxide => &mut self.carbon_monoxide,
            Pollutant::NitrogenDioxide => &mut self.nitrogen_dioxide,
            Pollutant::SulphurDioxide => &mut self.sulphur_dioxide,
            Pollutant::Ozone => &mut self.ozone,
        };
        *slot = value;
    }

    pub fn all_missing(&self) -> bool {
        Pollutant::ALL.iter().all(|p| self.get(*p).is_none())
    }
}

/// Bucket derived from PM2.5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AqiCategory {
    Good,
    Moderate,
    Unhealthy,
    #[serde(rename = "Very Unhealthy")]
    VeryUnhealthy,
    Hazardous,
    Unknown,
}

impl AqiCategory {
    pub const ALL: [AqiCategory; 6] = [
        AqiCategory::Good,
        AqiCategory::Moderate,
        AqiCategory::Unhealthy,
        AqiCategory::VeryUnhealthy,
        AqiCategory::Hazardous,
        AqiCategory::Unknown,
    ];

    pub fn label(self) -> &'static str {
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::Unhealthy => "Unhealthy",
            AqiCategory::VeryUnhealthy => "Very Unhealthy",
            AqiCategory::Hazardous => "Hazardous",
            AqiCategory::Unknown => "Unknown",
        }
    }
}

/// Bucket derived from the severity score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    #[serde(rename = "Low Risk")]
    Low,
    #[serde(rename = "Moderate Risk")]
    Moderate,
    #[serde(rename = "High Risk")]
    High,
    Unknown,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 4] = [
        RiskLevel::Low,
        RiskLevel::Moderate,
        RiskLevel::High,
        RiskLevel::Unknown,
    ];

    pub fn label(self) -> &'static str {
        match self {
            RiskLevel::Low => "Low Risk",
            RiskLevel::Moderate => "Moderate Risk",
            RiskLevel::High => "High Risk",
            RiskLevel::Unknown => "Unknown",
        }
    }
}

/// The unified row shape every source variant is normalized into
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub city: String,
    pub time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub measurements: Measurements,
    pub uv_index: Option<f64>,
    pub aqi_category: AqiCategory,
    pub severity_score: Option<f64>,
    pub risk_level: RiskLevel,
    pub hour: Option<u32>,
}

/// Which snapshot contributed to a staged dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub key: String,
    pub entity_key: String,
    pub source: SourceKind,
    pub schema_variant: SchemaVariant,
    pub sha256: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformStats {
    /// Rows produced by flattening, before cleaning
    pub flattened_rows: usize,
    /// Rows dropped because every pollutant was missing
    pub dropped_empty_rows: usize,
    /// Snapshots skipped because their schema was not recognized
    pub skipped_snapshots: Vec<String>,
}

/// Output of the transformer; read-only for everything downstream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagedDataset {
    pub records: Vec<CanonicalRecord>,
    pub provenance: Vec<SnapshotRef>,
    pub stats: TransformStats,
}

impl StagedDataset {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
