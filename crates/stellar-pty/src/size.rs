use portable_pty::PtySize;
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;

/// Terminal dimensions in character cells. Both fields are always positive
/// once constructed through [`Dimensions::new`] or [`Dimensions::from_signed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub rows: u16,
    pub cols: u16,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Dimensions {
    pub fn new(rows: u16, cols: u16) -> Result<Self, RegistryError> {
        Self::from_signed(i64::from(rows), i64::from(cols))
    }

    /// Validate dimensions coming from an untyped boundary.
    pub fn from_signed(rows: i64, cols: i64) -> Result<Self, RegistryError> {
        let invalid = || RegistryError::InvalidDimensions { rows, cols };
        let r = u16::try_from(rows).map_err(|_| invalid())?;
        let c = u16::try_from(cols).map_err(|_| invalid())?;
        if r == 0 || c == 0 {
            return Err(invalid());
        }
        Ok(Self { rows: r, cols: c })
    }

    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
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
