use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Substitutions for the private-use glyphs some readers render text with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlyphMap {
    glyphs: HashMap<char, String>,
}

impl GlyphMap {
    /// Build from `{"<glyph>": "<replacement>"}` pairs. Keys that are not a
    /// single character are ignored.
    pub fn from_pairs(pairs: HashMap<String, String>) -> Self {
        let mut glyphs = HashMap::new();
        for (key, value) in pairs {
            let mut chars = key.chars();
            match (chars.next(), chars.next()) {
                (Some(glyph), None) => {
                    glyphs.insert(glyph, value);
                }
                _ => warn!("Ignoring glyph mapping with key {:?}", key),
            }
        }
        Self { glyphs }
    }

    /// Load a JSON mapping file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .context(format!("Failed to read glyph map: {}", path.display()))?;
        let pairs: HashMap<String, String> = serde_json::from_str(&contents)
            .context(format!("Failed to parse glyph map: {}", path.display()))?;

        let map = Self::from_pairs(pairs);
        debug!("Loaded {} glyph mappings from {}", map.len(), path.display());
        Ok(map)
    }

    pub fn len(&self) -> usize {
        self.glyphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.glyphs.is_empty()
    }

    /// Replace every mapped glyph in `text`
    pub fn apply(&self, text: &str) -> String {
        if self.glyphs.is_empty() {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        for c in text.chars() {
            match self.glyphs.get(&c) {
                Some(replacement) => out.push_str(replacement),
                None => out.push(c),
            }
        }
        out
    }
}
