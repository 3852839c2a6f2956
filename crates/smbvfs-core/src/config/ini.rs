//! smb.conf-style INI parser.
//!
//! The format differs from a plain INI file in a few ways:
//! - Section and key names are case-insensitive
//! - Runs of whitespace inside key names are insignificant (`read only` == `readonly`)
//! - Comments start with `;` or `#`
//! - A trailing `\` continues the value on the next line
//! - Booleans are spelled `yes`/`no`, `true`/`false` or `1`/`0`

use std::path::Path;

use anyhow::Context;

/// A parsed configuration file. Sections keep file order.
#[derive(Debug, Clone, Default)]
pub struct IniFile {
    pub sections: Vec<IniSection>,
}

#[derive(Debug, Clone)]
pub struct IniSection {
    /// Name as written in the file (case preserved for display).
    pub name: String,
    pub entries: Vec<(String, String)>,
}

impl IniSection {
    fn new(name: &str) -> Self {
        IniSection {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }
}

impl IniFile {
    /// Parse configuration text.
    ///
    /// Keys that appear before any section header land in `[global]`.
    /// Later assignments to the same key override earlier ones.
    pub fn parse(content: &str) -> Self {
        let mut ini = IniFile::default();
        let mut current = String::from("global");
        let mut pending = String::new();

        for raw in content.lines() {
            let line = raw.trim();

            if let Some(stripped) = line.strip_suffix('\\') {
                pending.push_str(stripped);
                pending.push(' ');
                continue;
            }
            let joined;
            let line = if pending.is_empty() {
                line
            } else {
                pending.push_str(line);
                joined = std::mem::take(&mut pending);
                joined.trim()
            };

            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_string();
                ini.find_or_create_section(&current);
            } else if let Some(eq_pos) = line.find('=') {
                let key = &line[..eq_pos];
                let value = line[eq_pos + 1..].trim();
                ini.set(&current, key, value);
            } else {
                tracing::warn!("Ignoring malformed config line: {:?}", line);
            }
        }

        ini
    }

    /// Read and parse a configuration file from disk.
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        Ok(Self::parse(&content))
    }

    /// Get a raw value.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        let key = normalize_key(key);
        self.find_section(section).and_then(|s| {
            s.entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.as_str())
        })
    }

    /// Get a boolean value. Unparseable values are reported as errors rather
    /// than silently treated as `false`.
    pub fn get_bool(&self, section: &str, key: &str) -> anyhow::Result<Option<bool>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(v) => parse_bool(v)
                .map(Some)
                .with_context(|| format!("[{}] {}: expected a boolean, got {:?}", section, key, v)),
        }
    }

    /// Get an unsigned integer value.
    pub fn get_u64(&self, section: &str, key: &str) -> anyhow::Result<Option<u64>> {
        match self.get(section, key) {
            None => Ok(None),
            Some(v) => v
                .parse::<u64>()
                .map(Some)
                .with_context(|| format!("[{}] {}: expected a number, got {:?}", section, key, v)),
        }
    }

    /// Set a value, creating the section if needed.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        let key = normalize_key(key);
        let sec = self.find_or_create_section(section);
        match sec.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => sec.entries.push((key, value.to_string())),
        }
    }

    /// Names of all sections except `[global]`, in file order.
    pub fn share_names(&self) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|s| !s.name.eq_ignore_ascii_case("global"))
            .map(|s| s.name.as_str())
            .collect()
    }

    fn find_section(&self, name: &str) -> Option<&IniSection> {
        self.sections
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn find_or_create_section(&mut self, name: &str) -> &mut IniSection {
        let idx = match self
            .sections
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
        {
            Some(idx) => idx,
            None => {
                self.sections.push(IniSection::new(name));
                self.sections.len() - 1
            }
        };
        &mut self.sections[idx]
    }
}

/// Lowercase and drop all whitespace so `Read Only` and `readonly` match.
fn normalize_key(key: &str) -> String {
    key.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Some(true),
        "no" | "false" | "0" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let content = "[global]\n\toplocks = no\n[public]\n\tpath = /srv/public\n";
        let ini = IniFile::parse(content);
        assert_eq!(ini.get("global", "oplocks"), Some("no"));
        assert_eq!(ini.get("public", "path"), Some("/srv/public"));
    }

    #[test]
    fn test_keys_ignore_case_and_spaces() {
        let ini = IniFile::parse("[Docs]\nRead Only = Yes\n");
        assert_eq!(ini.get("docs", "readonly"), Some("Yes"));
        assert_eq!(ini.get_bool("DOCS", "read only").unwrap(), Some(true));
    }

    #[test]
    fn test_keys_before_section_are_global() {
        let ini = IniFile::parse("log level = debug\n[a]\npath=/a\n");
        assert_eq!(ini.get("global", "log level"), Some("debug"));
        assert_eq!(ini.share_names(), vec!["a"]);
    }

    #[test]
    fn test_comments_and_continuations() {
        let content = "; comment\n# another\n[s]\npath = /very/long/\\\n  path\n";
        let ini = IniFile::parse(content);
        assert_eq!(ini.get("s", "path"), Some("/very/long/ path"));
    }

    #[test]
    fn test_later_assignment_wins() {
        let ini = IniFile::parse("[s]\npath=/one\npath=/two\n");
        assert_eq!(ini.get("s", "path"), Some("/two"));
    }

    #[test]
    fn test_bad_bool_is_error() {
        let ini = IniFile::parse("[global]\noplocks = maybe\n");
        assert!(ini.get_bool("global", "oplocks").is_err());
        assert_eq!(ini.get_bool("global", "missing").unwrap(), None);
    }

    #[test]
    fn test_get_u64() {
        let ini = IniFile::parse("[global]\nxattr list max = 4096\nbad = x\n");
        assert_eq!(ini.get_u64("global", "xattr list max").unwrap(), Some(4096));
        assert!(ini.get_u64("global", "bad").is_err());
    }

    #[test]
    fn test_read_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("smbvfs.conf");
        std::fs::write(&path, "[s]\npath = /x\n").unwrap();
        let ini = IniFile::read(&path).unwrap();
        assert_eq!(ini.get("s", "path"), Some("/x"));
    }
}
