//! Raw-mode handling for the local terminal. The guard restores cooked mode
//! on every exit path, including panic unwinds.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};

pub struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    pub fn enable() -> Result<Self> {
        enable_raw_mode().context("enable raw mode")?;
        Ok(Self { active: true })
    }

    pub fn restore(&mut self) {
        if self.active {
            let _ = disable_raw_mode();
            self.active = false;
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

pub fn is_terminal() -> bool {
    std::io::stdin().is_terminal()
}

/// Current size as (cols, rows).
pub fn terminal_size() -> Result<(u16, u16)> {
    size().context("query terminal size")
}
