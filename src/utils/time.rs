//! Wall-clock helpers for token expiry checks

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{constants, ProtocolError, Result};

/// Seconds since the unix epoch
pub fn unix_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.to_string()))
}

/// Unix timestamp `ttl_seconds` from now, for minting connect tokens
pub fn expire_after(ttl_seconds: u64) -> Result<u64> {
    Ok(unix_timestamp()?.saturating_add(ttl_seconds))
}
