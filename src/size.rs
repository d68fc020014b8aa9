//! Window size for PTY

use serde::{Deserialize, Serialize};

use crate::error::{PtyError, PtyResult};

/// Default number of columns
pub const DEFAULT_COLS: u16 = 80;
/// Default number of rows
pub const DEFAULT_ROWS: u16 = 24;

/// Window size in characters and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size with just rows and columns
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Create a new window size with pixel dimensions
    pub fn with_pixels(cols: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// Create a window size, rejecting zero columns or rows
    pub fn checked(cols: u16, rows: u16) -> PtyResult<Self> {
        let size = Self::new(cols, rows);
        size.validate()?;
        Ok(size)
    }

    /// Create a window size from host-supplied integers, which may be negative
    pub fn from_signed(cols: i64, rows: i64) -> PtyResult<Self> {
        match (u16::try_from(cols), u16::try_from(rows)) {
            (Ok(c), Ok(r)) => Self::checked(c, r),
            _ => Err(PtyError::InvalidDimensions { cols, rows }),
        }
    }

    /// Fails with [`PtyError::InvalidDimensions`] unless both dimensions are positive
    /// and fit the platform's coordinate type.
    pub fn validate(&self) -> PtyResult<()> {
        // ConPTY takes signed 16-bit coordinates.
        let limit = if cfg!(windows) { i16::MAX as u16 } else { u16::MAX };
        if self.cols == 0 || self.rows == 0 || self.cols > limit || self.rows > limit {
            return Err(PtyError::InvalidDimensions {
                cols: i64::from(self.cols),
                rows: i64::from(self.rows),
            });
        }
        Ok(())
    }

    /// Same character geometry, ignoring pixel dimensions
    pub fn same_cells(&self, other: &WindowSize) -> bool {
        self.cols == other.cols && self.rows == other.rows
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(DEFAULT_COLS, DEFAULT_ROWS)
    }
}

#[cfg(unix)]
impl From<WindowSize> for nix::pty::Winsize {
    fn from(size: WindowSize) -> Self {
        nix::pty::Winsize {
            ws_row: size.rows,
            ws_col: size.cols,
            ws_xpixel: size.pixel_width,
            ws_ypixel: size.pixel_height,
        }
    }
}

#[cfg(unix)]
impl From<nix::pty::Winsize> for WindowSize {
    fn from(ws: nix::pty::Winsize) -> Self {
        Self::with_pixels(ws.ws_col, ws.ws_row, ws.ws_xpixel, ws.ws_ypixel)
    }
}
