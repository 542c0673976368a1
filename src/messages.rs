//! Condition message catalog.
//!
//! Built-in error conditions carry a stable key (e.g. `err.arity`) plus a
//! human-readable text resolved through this table. The default catalog is
//! compiled in; operators can point `--messages` at a replacement file to
//! reword or localize without rebuilding.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

const DEFAULT_CATALOG: &str = include_str!("../messages.txt");

pub struct MessageTable {
    map: HashMap<String, String>,
}

impl MessageTable {
    /// The compiled-in catalog.
    pub fn standard() -> MessageTable {
        MessageTable::from_text(DEFAULT_CATALOG)
    }

    /// Parse a catalog: `key<TAB>text` per line, `#` comments. Malformed
    /// lines are logged and skipped rather than rejected, so a partial
    /// override file still loads.
    pub fn from_text(text: &str) -> MessageTable {
        let mut map = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.split_once('\t') {
                Some((key, text)) if !key.is_empty() && !text.is_empty() => {
                    map.insert(key.to_string(), text.to_string());
                }
                _ => {
                    log::warn!("message catalog: skipping malformed line {}", lineno + 1);
                }
            }
        }
        MessageTable { map }
    }

    /// Load an override file on top of the compiled-in defaults.
    pub fn load(path: &Path) -> io::Result<MessageTable> {
        let mut table = MessageTable::standard();
        let text = fs::read_to_string(path)?;
        for (key, value) in MessageTable::from_text(&text).map {
            table.map.insert(key, value);
        }
        Ok(table)
    }

    /// Resolve a key; unknown keys fall back to the key itself so a missing
    /// catalog entry degrades to something greppable.
    pub fn get<'a>(&'a self, key: &'a str) -> &'a str {
        self.map.get(key).map(String::as_str).unwrap_or(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_has_core_keys() {
        let t = MessageTable::standard();
        assert_ne!(t.get("err.arity"), "err.arity");
        assert_ne!(t.get("err.not-a-procedure"), "err.not-a-procedure");
        assert_ne!(t.get("err.overflow"), "err.overflow");
    }

    #[test]
    fn unknown_key_falls_back_to_itself() {
        let t = MessageTable::standard();
        assert_eq!(t.get("err.no-such-key"), "err.no-such-key");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let t = MessageTable::from_text("good\tfine\nno tab here\n\n# comment\n");
        assert_eq!(t.get("good"), "fine");
        assert_eq!(t.get("no tab here"), "no tab here");
    }
}
