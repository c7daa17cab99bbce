// Task freeze timeout sized from installed RAM
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;

use thiserror::Error;

use crate::helpers::{write_file, HelperError, GB};

#[derive(Error, Debug)]
pub enum FreezeError {
    #[error("Invalid freeze timeout curve entry '{0}'")]
    InvalidCurve(String),
    #[error("Cannot write freeze timeout: {0}")]
    Write(#[from] HelperError),
}

pub type Result<T> = std::result::Result<T, FreezeError>;

/// One `lo-hi:secs` range of the curve, bounds in GiB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurvePoint {
    pub lo_gb: u64,
    /// `None` for an open `lo-:secs` range
    pub hi_gb: Option<u64>,
    pub timeout_secs: u64,
}

impl CurvePoint {
    /// Half-open: `lo <= ram < hi`
    fn contains(&self, ram_bytes: u64) -> bool {
        let lo = self.lo_gb.saturating_mul(GB);
        ram_bytes >= lo && self.hi_gb.map_or(true, |hi| ram_bytes < hi.saturating_mul(GB))
    }
}

fn parse_point(entry: &str) -> Result<CurvePoint> {
    let invalid = || FreezeError::InvalidCurve(entry.to_string());
    let (range, secs) = entry.split_once(':').ok_or_else(invalid)?;
    let (lo, hi) = range.split_once('-').ok_or_else(invalid)?;

    let lo_gb = lo.trim().parse().map_err(|_| invalid())?;
    let hi_gb = match hi.trim() {
        "" => None,
        hi => Some(hi.parse().map_err(|_| invalid())?),
    };
    let timeout_secs = secs.trim().parse().map_err(|_| invalid())?;
    Ok(CurvePoint {
        lo_gb,
        hi_gb,
        timeout_secs,
    })
}

pub fn parse_curve(curve: &str) -> Result<Vec<CurvePoint>> {
    curve
        .split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(parse_point)
        .collect()
}

/// Timeout in seconds for this much RAM, `None` when the curve has no range for it
pub fn freeze_timeout_for(curve: &str, ram_bytes: u64) -> Result<Option<u64>> {
    Ok(parse_curve(curve)?
        .into_iter()
        .find(|p| p.contains(ram_bytes))
        .map(|p| p.timeout_secs))
}

/// Write the timeout (in milliseconds) for `ram_bytes` to `path`.
/// Returns the seconds applied, if any.
pub fn apply_freeze_timeout(curve: &str, ram_bytes: u64, path: &Path) -> Result<Option<u64>> {
    let Some(secs) = freeze_timeout_for(curve, ram_bytes)? else {
        return Ok(None);
    };
    write_file(path, &(secs * 1000).to_string())?;
    Ok(Some(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::FREEZE_TIMEOUT_CURVE;

    #[test]
    fn test_default_curve() {
        let t = |gb: u64| freeze_timeout_for(FREEZE_TIMEOUT_CURVE, gb * GB).unwrap();
        assert_eq!(t(7), Some(20));
        assert_eq!(t(8), Some(40));
        assert_eq!(t(128), Some(200));
        assert_eq!(t(500), Some(400));
    }

    #[test]
    fn test_curve_with_holes() {
        let curve = "0-8:20,16-64:60";
        let t = |gb: u64| freeze_timeout_for(curve, gb * GB).unwrap();
        assert_eq!(t(7), Some(20));
        assert_eq!(t(9), None);
        assert_eq!(t(22), Some(60));
        assert_eq!(t(70), None);
    }

    #[test]
    fn test_invalid_entries() {
        for bad in ["8:20", "0-8", "a-8:20", "0-8:x", "0-b:1"] {
            assert!(
                matches!(parse_curve(bad), Err(FreezeError::InvalidCurve(_))),
                "{} accepted",
                bad
            );
        }
        assert_eq!(parse_curve(" 0-8 : 20 , ").unwrap().len(), 1);
    }

    #[test]
    fn test_apply_writes_milliseconds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pm_freeze_timeout");
        assert_eq!(apply_freeze_timeout(FREEZE_TIMEOUT_CURVE, 4 * GB, &path).unwrap(), Some(20));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "20000");

        let other = dir.path().join("untouched");
        assert_eq!(apply_freeze_timeout("0-1:5", 4 * GB, &other).unwrap(), None);
        assert!(!other.exists());
    }
}
