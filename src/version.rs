//! Control Protocol Version
//!
//! Build-time protocol version read from Cargo.toml metadata
//! (`package.metadata.rulescan.protocol_version`). The version travels in the
//! first response of every control stream so callers can detect a
//! mismatched peer before they rely on message shapes.

// Include the build-generated protocol version constant
include!(concat!(env!("OUT_DIR"), "/protocol_version.rs"));

/// Get the current protocol version (YYYYMMDD)
pub fn get_protocol_version() -> i64 {
    BASE_PROTOCOL_VERSION
}

/// Convert a YYYYMMDD version to a `YYYY-MM-DD` string
pub fn version_to_date_string(version: i64) -> String {
    let year = version / 10000;
    let month = (version % 10000) / 100;
    let day = version % 100;
    format!("{year:04}-{month:02}-{day:02}")
}

/// Version information as a JSON value
pub fn get_version_info() -> serde_json::Value {
    let version = get_protocol_version();
    serde_json::json!({
        "protocol_version": version,
        "release_date": version_to_date_string(version),
        "version_format": "YYYYMMDD",
    })
}

/// A peer speaking `required_version` can talk to us if we are at least as new
pub fn is_protocol_compatible(required_version: i64) -> bool {
    get_protocol_version() >= required_version
}
