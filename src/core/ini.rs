//! Minimal INI reader for the recorder configuration file

use std::collections::HashMap;
use std::path::Path;

/// Section used for keys that appear before any `[section]` header
pub const DEFAULT_SECTION: &str = "recorder";

/// Parsed INI document. Section and key lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct IniFile {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniFile {
    /// Read and parse a file from disk
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Parse INI text. Malformed lines are skipped.
    pub fn parse(text: &str) -> Self {
        let mut ini = Self::default();
        let mut current = DEFAULT_SECTION.to_string();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.len() >= 2 && line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_lowercase();
                continue;
            }

            let Some(idx) = line.find('=') else {
                continue;
            };
            if idx == 0 {
                continue;
            }

            let key = line[..idx].trim().to_lowercase();
            let value = line[idx + 1..].trim().to_string();
            ini.sections
                .entry(current.clone())
                .or_default()
                .insert(key, value);
        }

        ini
    }

    /// Borrow a section; a missing section reads as empty
    pub fn section(&self, name: &str) -> Section<'_> {
        Section {
            values: self.sections.get(&name.to_lowercase()),
        }
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(&name.to_lowercase())
    }
}

/// Read-only view of one INI section
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    values: Option<&'a HashMap<String, String>>,
}

impl<'a> Section<'a> {
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.values?.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Integer value clamped to `min`; missing or unparsable values yield `default`
    pub fn get_int(&self, key: &str, default: i64, min: i64) -> i64 {
        let value = self
            .get(key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(default);
        value.max(min)
    }

    /// `1` or `true` (any case) is true, anything else present is false
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => v == "1" || v.eq_ignore_ascii_case("true"),
            None => default,
        }
    }
}
