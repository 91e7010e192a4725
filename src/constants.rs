/// Name constants shared between the transformer, the loader and the sinks

pub const DEFAULT_TABLE: &str = "air_quality_data";

pub const OPENAQ_LATEST_URL: &str = "https://api.openaq.org/v3/latest";
pub const OPEN_METEO_AIR_QUALITY_URL: &str = "https://air-quality-api.open-meteo.com/v1/air-quality";

/// Hourly series requested from the fallback provider
pub const OPEN_METEO_HOURLY: &str =
    "pm10,pm2_5,carbon_monoxide,nitrogen_dioxide,ozone,sulphur_dioxide,uv_index";

/// Prefix under which raw snapshots are written in the snapshot store
pub const RAW_PREFIX: &str = "raw/";

// Canonical column names (lower-case, as the sink expects them)
pub const COL_CITY: &str = "city";
pub const COL_TIME: &str = "time";
pub const COL_PM10: &str = "pm10";
pub const COL_PM2_5: &str = "pm2_5";
pub const COL_CO: &str = "carbon_monoxide";
pub const COL_NO2: &str = "nitrogen_dioxide";
pub const COL_SO2: &str = "sulphur_dioxide";
pub const COL_O3: &str = "ozone";
pub const COL_UV_INDEX: &str = "uv_index";
pub const COL_AQI_CATEGORY: &str = "aqi_category";
pub const COL_SEVERITY_SCORE: &str = "severity_score";
pub const COL_RISK_FLAG: &str = "risk_flag";
pub const COL_HOUR: &str = "hour";

/// Column order of the sink table
pub const SINK_COLUMNS: [&str; 13] = [
    COL_CITY,
    COL_TIME,
    COL_PM10,
    COL_PM2_5,
    COL_CO,
    COL_NO2,
    COL_SO2,
    COL_O3,
    COL_UV_INDEX,
    COL_AQI_CATEGORY,
    COL_SEVERITY_SCORE,
    COL_RISK_FLAG,
    COL_HOUR,
];

/// Cities extracted when the configuration does not list any: (name, lat, lon)
pub const DEFAULT_CITIES: [(&str, f64, f64); 5] = [
    ("Delhi", 28.7041, 77.1025),
    ("Bengaluru", 12.9716, 77.5946),
    ("Hyderabad", 17.3850, 78.4867),
    ("Mumbai", 19.0760, 72.8777),
    ("Kolkata", 22.5726, 88.3639),
];
