//! Parsed `qm config` output.

use std::collections::BTreeMap;

/// Key/value view of a VM configuration as printed by `qm config <id>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmConfig {
    entries: BTreeMap<String, String>,
}

impl VmConfig {
    /// Parses `key: value` lines; anything else (snapshot sections, blank lines) is ignored.
    pub fn parse(output: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in output.lines() {
            if line.starts_with('[') {
                // Snapshot sections follow the current config.
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() && !key.contains(char::is_whitespace) {
                    entries.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Returns `(slot, volume)` pairs for `unusedN` entries ordered by index.
    pub fn unused_volumes(&self) -> Vec<(String, String)> {
        let mut unused: Vec<(u32, String, String)> = self
            .entries
            .iter()
            .filter_map(|(key, value)| {
                let index = key.strip_prefix("unused")?.parse::<u32>().ok()?;
                Some((index, key.clone(), value.clone()))
            })
            .collect();
        unused.sort_by_key(|(index, _, _)| *index);
        unused.into_iter().map(|(_, slot, volume)| (slot, volume)).collect()
    }

    /// Finds the unused slot holding `volume`, if any.
    pub fn unused_slot_for(&self, volume: &str) -> Option<String> {
        self.unused_volumes()
            .into_iter()
            .find(|(_, v)| v == volume)
            .map(|(slot, _)| slot)
    }
}
