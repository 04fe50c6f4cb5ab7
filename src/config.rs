//! Flash configuration files.
//!
//! One `[[unit]]` table per flash unit, in programming order:
//!
//! ```toml
//! [[unit]]
//! memory = "p"
//! start = 0x0000
//! end = 0x7dff
//! interface = 0x0f40
//! clk_divisor = 0x28
//! terasel = 0x0f
//! tmel = 0x3a
//! tnvsl = 0x3f
//! tpgsl = 0x7f
//! tprogl = 0xff
//! tnvhl = 0x1d7
//! tnvh1l = 0x2710
//! trcvl = 0x4
//! ```
//!
//! `duplicate = true` marks a unit that shares its cells with an earlier one.
use std::fs;
use std::path::Path;
use std::string::ToString;
use std::vec::Vec;

use log::info;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::unit::{FlashLayout, UnitConfig};

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    unit: Vec<UnitConfig>,
}

/// Parse the unit list from configuration text.
pub fn parse(text: &str) -> Result<Vec<UnitConfig>> {
    let file: ConfigFile = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
    Ok(file.unit)
}

/// Read a configuration file and build the flash layout it describes.
pub fn load(path: &Path) -> Result<FlashLayout> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::Config(std::format!("{}: {}", path.display(), e)))?;
    let units = parse(&text)?;
    let layout = FlashLayout::new(&units)?;
    info!("{} flash unit(s) configured from {}", layout.len(), path.display());
    Ok(layout)
}
