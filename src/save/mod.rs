//! Save archive reading and patching.
//!
//! A Factorio save is a zip container with a single top-level directory named
//! after the save. Members are addressed by the two-segment rule
//! `<root>/<name>`; the save format guarantees there is no deeper nesting for
//! the members we care about, so this is deliberately not a general path
//! matcher.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;

use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::ReplayError;
use crate::version::GameVersion;

/// Archive member holding the scenario entry-point script.
pub const CONTROL_SCRIPT_MEMBER: &str = "control.lua";
/// Archive member whose first 6 bytes encode the game version.
pub const VERSION_MEMBER: &str = "level-init.dat";

/// Instrumentation payload appended to the save's control script.
pub const REPLAY_SCRIPT: &str = include_str!("replay_script.lua");
/// Reference control script of the standard freeplay scenario, used to detect
/// saves that replay something else.
pub const FREEPLAY_CONTROL_LUA: &str = include_str!("freeplay_control.lua");

/// Result of installing the replay script into a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveInfo {
    /// Root directory name inside the archive, i.e. the save's name.
    pub save_name: String,
    /// Control script content before patching, retained so callers can
    /// classify the scenario.
    pub original_control_lua: String,
}

/// An in-memory save archive with independently readable/writable members.
pub struct SaveArchive {
    entries: BTreeMap<String, Vec<u8>>,
}

impl SaveArchive {
    pub fn read_from(path: &Path) -> Result<Self, ReplayError> {
        Self::from_reader(File::open(path)?)
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, ReplayError> {
        let mut zip = ZipArchive::new(reader)?;
        let mut entries = BTreeMap::new();
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let mut data = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut data)?;
            entries.insert(entry.name().to_string(), data);
        }
        Ok(Self { entries })
    }

    /// Find the unique member whose path is exactly `<root>/<name>`.
    fn find_member(&self, name: &str) -> Option<&str> {
        self.entries.keys().map(String::as_str).find(|path| {
            let mut segments = path.split('/');
            matches!(
                (segments.next(), segments.next(), segments.next()),
                (Some(_), Some(file), None) if file == name
            )
        })
    }

    /// Read the save's game version from the fixed 6-byte header of
    /// `level-init.dat`: three consecutive little-endian u16s.
    pub fn replay_version(&self) -> Result<GameVersion, ReplayError> {
        let member = self
            .find_member(VERSION_MEMBER)
            .ok_or_else(|| ReplayError::MemberNotFound {
                member: VERSION_MEMBER.to_string(),
            })?;
        let data = &self.entries[member];
        if data.len() < 6 {
            return Err(ReplayError::MalformedMember {
                member: VERSION_MEMBER.to_string(),
                reason: format!("expected at least 6 bytes, got {}", data.len()),
            });
        }
        Ok(GameVersion::new(
            u16::from_le_bytes([data[0], data[1]]),
            u16::from_le_bytes([data[2], data[3]]),
            u16::from_le_bytes([data[4], data[5]]),
        ))
    }

    /// Append the replay script to the save's control script.
    ///
    /// The payload is wrapped in a `do ... end` block so it runs as an
    /// isolated scope after the original script and cannot shadow its
    /// top-level locals. Not idempotent: installing twice appends twice.
    pub fn install_replay_script(&mut self, replay_script: &str) -> Result<SaveInfo, ReplayError> {
        let member = self
            .find_member(CONTROL_SCRIPT_MEMBER)
            .ok_or_else(|| ReplayError::MemberNotFound {
                member: CONTROL_SCRIPT_MEMBER.to_string(),
            })?
            .to_string();

        let original_control_lua = String::from_utf8_lossy(&self.entries[&member]).into_owned();
        let patched = format!("{original_control_lua}do\n{replay_script}\nend\n");
        let save_name = member
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        self.entries.insert(member, patched.into_bytes());

        Ok(SaveInfo {
            save_name,
            original_control_lua,
        })
    }

    /// Deterministically re-encode every entry to `path`, optionally marking
    /// the written file read-only afterwards.
    pub fn write_to(&self, path: &Path, readonly: bool) -> Result<(), ReplayError> {
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, data) in &self.entries {
            zip.start_file(name.as_str(), options)?;
            zip.write_all(data)?;
        }
        let mut file = zip.finish()?;
        file.flush()?;
        drop(file);

        if readonly {
            let mut permissions = std::fs::metadata(path)?.permissions();
            permissions.set_readonly(true);
            std::fs::set_permissions(path, permissions)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn member_text(&self, name: &str) -> Option<String> {
        let member = self.find_member(name)?;
        Some(String::from_utf8_lossy(&self.entries[member]).into_owned())
    }
}
