//! Per-version Factorio data directory scaffolding.
//!
//! Each game version gets its own data directory holding a generated
//! `config.ini` (with `write-data` pointing at the directory itself), a
//! `saves/` folder that is wiped before every run, and — after a sync pass —
//! the engine-managed `mods/` folder.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{NoExpand, Regex};
use serde::Deserialize;

use crate::error::ReplayError;
use crate::save::{SaveArchive, SaveInfo};

pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Headless-friendly config: all eye candy off, no update checks.
fn config_contents(data_dir: &Path) -> String {
    format!(
        r#"; version=12
; Automatically generated
[path]
read-data=__PATH__executable__/../../data
write-data={}
[general]
locale=auto
[other]
check-updates=false
[interface]
[input]
[controls]
[controller]
[sound]
[map-view]
[debug]
[multiplayer-lobby]
[graphics]
cache-sprite-atlas-count=2
cache-sprite-atlas=true
compress-sprite-atlas-cache=true
graphics-quality=medium
show-smoke=false
show-clouds=false
show-fog=false
show-space-dust=false
show-decoratives=false
show-particles=false
show-item-shadows=false
show-inserter-shadows=false
show-animated-water=false
show-animated-ghosts=false
show-tree-distortion=false
additional-terrain-effects=false
light-occlusion=false
v-sync=false
high-quality-animations=false
show-game-simulations-in-background=false
texture-compression-level=low-quality
"#,
        data_dir.display()
    )
}

fn write_data_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?m)^write-data=.*$").expect("write-data pattern is valid"))
}

/// Create the data directory and its `config.ini` if missing; otherwise
/// rewrite the `write-data` line to the directory's absolute path. Idempotent
/// when the config is already correct.
pub fn setup_data_dir(dir: &Path) -> Result<PathBuf, ReplayError> {
    fs::create_dir_all(dir)?;
    let dir = dir.canonicalize()?;

    let config_path = dir.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        fs::write(&config_path, config_contents(&dir))?;
    } else {
        let content = fs::read_to_string(&config_path)?;
        let replacement = format!("write-data={}", dir.display());
        let updated = write_data_pattern().replace(&content, NoExpand(&replacement));
        if updated != content {
            fs::write(&config_path, updated.as_ref())?;
        }
    }
    Ok(dir)
}

/// Patch the save with the replay script, scaffold the data directory, and
/// place the patched save (read-only) in a freshly cleared `saves/` slot.
pub fn setup_data_dir_with_save(
    dir: &Path,
    save: &mut SaveArchive,
    replay_script: &str,
) -> Result<SaveInfo, ReplayError> {
    let info = save.install_replay_script(replay_script)?;
    let dir = setup_data_dir(dir)?;

    let saves_dir = dir.join("saves");
    match fs::remove_dir_all(&saves_dir) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    fs::create_dir_all(&saves_dir)?;

    let save_path = saves_dir.join(format!("{}.zip", info.save_name));
    save.write_to(&save_path, true)?;
    Ok(info)
}

#[derive(Debug, Deserialize)]
struct ModList {
    #[serde(default)]
    mods: Vec<ModEntry>,
}

#[derive(Debug, Deserialize)]
struct ModEntry {
    name: String,
    enabled: bool,
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,
}

/// Read `mods/mod-list.json` from the data directory and reduce it to the
/// names of enabled mods.
pub fn enabled_mods(data_dir: &Path) -> Result<Vec<String>, ReplayError> {
    let path = data_dir.join("mods").join("mod-list.json");
    let list: ModList = serde_json::from_str(&fs::read_to_string(path)?)?;
    Ok(list
        .mods
        .into_iter()
        .filter(|entry| entry.enabled)
        .map(|entry| entry.name)
        .collect())
}

/// Mod sets a replay is allowed to run with: vanilla, or the Space Age
/// bundle.
pub fn allowed_mod_sets() -> &'static [&'static [&'static str]] {
    &[&["base"], &["base", "space-age", "quality", "elevated-rails"]]
}

/// Whether `enabled` is exactly one of the accepted mod sets.
pub fn is_allowed_mod_set(enabled: &[String]) -> bool {
    let enabled: HashSet<&str> = enabled.iter().map(String::as_str).collect();
    allowed_mod_sets().iter().any(|allowed| {
        let allowed: HashSet<&str> = allowed.iter().copied().collect();
        enabled == allowed
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scaffolds_fresh_config_with_write_data() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("instance");

        let resolved = setup_data_dir(&data_dir).unwrap();
        let config = fs::read_to_string(resolved.join(CONFIG_FILE_NAME)).unwrap();
        assert!(config.contains(&format!("write-data={}", resolved.display())));
        assert!(config.contains("check-updates=false"));
    }

    #[test]
    fn rewrites_existing_write_data_line() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            ";hi\nwrite-data=foo\n[general]\n",
        )
        .unwrap();

        let resolved = setup_data_dir(dir.path()).unwrap();
        let config = fs::read_to_string(resolved.join(CONFIG_FILE_NAME)).unwrap();
        assert!(config.starts_with(";hi\n"));
        assert!(config.contains(&format!("write-data={}", resolved.display())));
        assert!(!config.contains("write-data=foo"));
    }

    #[test]
    fn setup_is_idempotent_when_config_is_correct() {
        let dir = TempDir::new().unwrap();
        let resolved = setup_data_dir(dir.path()).unwrap();
        let before = fs::read_to_string(resolved.join(CONFIG_FILE_NAME)).unwrap();

        setup_data_dir(dir.path()).unwrap();
        let after = fs::read_to_string(resolved.join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn clears_saves_dir_and_writes_patched_save() {
        use crate::save::FREEPLAY_CONTROL_LUA;
        use std::io::Write;
        use zip::write::FileOptions;
        use zip::ZipWriter;

        let dir = TempDir::new().unwrap();
        let saves_dir = dir.path().join("saves");
        fs::create_dir_all(&saves_dir).unwrap();
        fs::write(saves_dir.join("stale.zip"), b"old").unwrap();

        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut zip = ZipWriter::new(&mut buf);
            zip.start_file("TEST/control.lua", FileOptions::default())
                .unwrap();
            zip.write_all(FREEPLAY_CONTROL_LUA.as_bytes()).unwrap();
            zip.start_file("TEST/level-init.dat", FileOptions::default())
                .unwrap();
            zip.write_all(&[1, 0, 1, 0, 110, 0]).unwrap();
            zip.finish().unwrap();
        }
        buf.set_position(0);
        let mut save = SaveArchive::from_reader(buf).unwrap();

        let info = setup_data_dir_with_save(dir.path(), &mut save, "-- replay").unwrap();
        assert_eq!(info.save_name, "TEST");
        assert!(saves_dir.join("TEST.zip").exists());
        assert!(!saves_dir.join("stale.zip").exists());
    }

    #[test]
    fn reduces_mod_list_to_enabled_names() {
        let dir = TempDir::new().unwrap();
        let mods_dir = dir.path().join("mods");
        fs::create_dir_all(&mods_dir).unwrap();
        fs::write(
            mods_dir.join("mod-list.json"),
            r#"{"mods":[
                {"name":"base","enabled":true},
                {"name":"space-age","enabled":false,"version":"2.0.39"},
                {"name":"quality","enabled":true,"version":"2.0.39"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(enabled_mods(dir.path()).unwrap(), ["base", "quality"]);
    }

    #[test]
    fn mod_set_allow_list_is_exact() {
        let vanilla = vec!["base".to_string()];
        assert!(is_allowed_mod_set(&vanilla));

        let space_age: Vec<String> = ["base", "space-age", "quality", "elevated-rails"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(is_allowed_mod_set(&space_age));

        let partial: Vec<String> = ["base", "quality"].iter().map(|s| s.to_string()).collect();
        assert!(!is_allowed_mod_set(&partial));
        assert!(!is_allowed_mod_set(&[]));
    }
}
