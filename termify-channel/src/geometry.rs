//! Terminal geometry and its accepted bounds.

use portable_pty::PtySize;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use thiserror::Error;

pub const COLS_RANGE: RangeInclusive<u16> = 40..=500;
pub const ROWS_RANGE: RangeInclusive<u16> = 10..=200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "terminal geometry {cols}x{rows} is out of range (columns 40-500, rows 10-200)"
)]
pub struct GeometryError {
    pub cols: u16,
    pub rows: u16,
}

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
}

impl Geometry {
    /// Build a geometry, rejecting sizes outside [`COLS_RANGE`] x [`ROWS_RANGE`].
    pub fn new(cols: u16, rows: u16) -> Result<Self, GeometryError> {
        Self { cols, rows }.validate()
    }

    pub fn validate(self) -> Result<Self, GeometryError> {
        if COLS_RANGE.contains(&self.cols) && ROWS_RANGE.contains(&self.rows) {
            Ok(self)
        } else {
            Err(GeometryError {
                cols: self.cols,
                rows: self.rows,
            })
        }
    }

    pub(crate) fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_are_inclusive() {
        assert!(Geometry::new(40, 10).is_ok());
        assert!(Geometry::new(500, 200).is_ok());
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert_eq!(
            Geometry::new(39, 24),
            Err(GeometryError { cols: 39, rows: 24 })
        );
        assert!(Geometry::new(80, 9).is_err());
        assert!(Geometry::new(501, 24).is_err());
        assert!(Geometry::new(80, 201).is_err());
    }

    #[test]
    fn test_default_is_valid() {
        assert!(Geometry::default().validate().is_ok());
    }

    #[test]
    fn test_pty_size_conversion() {
        let size = Geometry::new(120, 40).unwrap().to_pty_size();
        assert_eq!((size.cols, size.rows), (120, 40));
        assert_eq!((size.pixel_width, size.pixel_height), (0, 0));
    }
}
