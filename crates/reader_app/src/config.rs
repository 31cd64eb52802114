use std::fs;
use std::io;
use std::path::Path;

use anyhow::Context as _;
use engine_logging::{engine_info, engine_warn};
use reader_engine::EngineConfig;

/// Reads the engine configuration from a RON file. A missing file yields the
/// defaults; an unreadable or malformed one is an error.
pub fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            engine_warn!("no config at {:?}, using defaults", path);
            return Ok(EngineConfig::default());
        }
        Err(err) => {
            return Err(err).with_context(|| format!("read config {}", path.display()));
        }
    };

    let config: EngineConfig =
        ron::from_str(&text).with_context(|| format!("parse config {}", path.display()))?;
    engine_info!("loaded config from {:?}", path);
    Ok(config)
}
