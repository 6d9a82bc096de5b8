//! Saving and loading the settings file.
//!
//! One line per stored record:
//!
//! ```text
//! <name>::<priority> = <timestamp-ns>|<raw-value>
//! ```
//!
//! Saves are atomic: the new contents are written to a temporary file in
//! the same directory, the previous file is kept as `<path>.bak`, and the
//! temporary file is renamed into place. Loading feeds every parseable
//! line through the store's regular `set()` path so the same gating and
//! merge rules apply; unparseable lines are logged and skipped.

use crate::store::SettingsStore;
use crate::SettingsError;
use fluid_settings_model::{name, Priority, Timestamp};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};

const FILE_HEADER: &str = "\
# WARNING: AUTO-GENERATED FILE, DO NOT EDIT
#          see `man fluid-settings` for details
";

/// Atomically rewrite the settings file from the store's content.
pub fn save(store: &SettingsStore, path: &Path) -> Result<(), SettingsError> {
    let mut contents = String::from(FILE_HEADER);
    for (setting, priority, record) in store.all_records() {
        contents.push_str(setting);
        contents.push_str("::");
        contents.push_str(&priority.to_string());
        contents.push_str(" = ");
        contents.push_str(&record.timestamp.to_string());
        contents.push('|');
        contents.push_str(&record.value);
        contents.push('\n');
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.flush()?;

    if path.exists() {
        let mut backup = path.as_os_str().to_owned();
        backup.push(".bak");
        std::fs::rename(path, &backup)?;
    }
    tmp.persist(path)
        .map_err(|e| SettingsError::Io(e.error))?;
    Ok(())
}

/// Load the settings file into the store. Returns the number of records
/// applied. A missing file is an empty load, not an error.
pub fn load(store: &mut SettingsStore, path: &Path) -> Result<usize, SettingsError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("no settings file at {}; starting empty", path.display());
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let mut applied = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("settings line {line:?} has no '='; skipped");
            continue;
        };
        let (key, value) = (key.trim(), value.trim_start());
        let Some((setting, priority)) = key.rsplit_once("::") else {
            warn!("settings key {key:?} has no priority section; skipped");
            continue;
        };
        let Ok(priority) = Priority::parse(priority) else {
            warn!("settings key {key:?} has an invalid priority; skipped");
            continue;
        };
        let Some((stamp, raw_value)) = value.split_once('|') else {
            warn!("settings value {value:?} has no '|' separating the timestamp; skipped");
            continue;
        };
        let Ok(stamp) = Timestamp::parse(stamp) else {
            warn!("settings value {value:?} has an invalid timestamp; skipped");
            continue;
        };
        if store
            .set(&name::canonicalize(setting), raw_value, priority, stamp)
            .mutated()
        {
            applied += 1;
        }
    }
    Ok(applied)
}
