/// Country name reconciliation.
///
/// Every source spells some countries its own way ("Vietnam" vs "Viet Nam",
/// "United States" vs "USA"). Joins compare canonical names by exact string
/// equality, so every country name read from any source must go through
/// `CountryAliases::normalize` before it is used as a key.
///
/// The alias table is a versioned artifact. A built-in table covers the
/// spellings known for the bundled datasets; a TOML file can replace it:
///
/// ```toml
/// version = 2
///
/// [aliases]
/// "Vietnam" = "Viet Nam"
/// "United States" = "USA"
/// ```

use crate::model::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Built-in table
// ---------------------------------------------------------------------------

/// Version of the built-in alias table.
pub const BUILTIN_VERSION: u32 = 1;

/// Source spelling → canonical spelling. Canonical names follow the
/// countries/continents file, which is the source of `location` rows.
pub static BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("Bosnia and Herzegovina", "Bosnia And Herzegovina"),
    ("Vietnam", "Viet Nam"),
    ("Czechia", "Czech Republic"),
    ("Democratic Republic of Congo", "Democratic Republic Of The Congo"),
    ("United Kingdom", "UK"),
    ("United States", "USA"),
];

// ---------------------------------------------------------------------------
// Alias table
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AliasFile {
    version: u32,
    #[serde(default)]
    aliases: HashMap<String, String>,
}

/// A validated alias table. Validation guarantees `normalize` is idempotent:
/// no canonical name is itself an alias.
#[derive(Debug, Clone)]
pub struct CountryAliases {
    version: u32,
    map: HashMap<String, String>,
}

impl CountryAliases {
    /// The table compiled into the binary.
    pub fn builtin() -> Self {
        let map = BUILTIN_ALIASES
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        Self {
            version: BUILTIN_VERSION,
            map,
        }
    }

    /// Loads and validates an alias file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: AliasFile = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::new(file.version, file.aliases)
    }

    /// The configured alias file, or the built-in table when none is set.
    pub fn load_or_builtin(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin()),
        }
    }

    /// Builds a table from raw pairs, trimming names and rejecting tables
    /// that would make normalization non-idempotent.
    pub fn new(version: u32, aliases: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut map = HashMap::with_capacity(aliases.len());
        for (from, to) in aliases {
            let from = from.trim().to_string();
            let to = to.trim().to_string();
            if from.is_empty() || to.is_empty() {
                return Err(ConfigError::Aliases(format!(
                    "empty country name in alias '{}' -> '{}'",
                    from, to
                )));
            }
            if map.insert(from.clone(), to).is_some() {
                return Err(ConfigError::Aliases(format!(
                    "alias '{}' is defined twice",
                    from
                )));
            }
        }

        // A -> B together with B -> C would give normalize(normalize(A)) != normalize(A).
        let mut chained: Vec<&String> = map.values().filter(|to| map.contains_key(*to)).collect();
        if !chained.is_empty() {
            chained.sort();
            chained.dedup();
            let names: Vec<&str> = chained.iter().map(|s| s.as_str()).collect();
            return Err(ConfigError::Aliases(format!(
                "canonical name(s) also listed as aliases: {}",
                names.join(", ")
            )));
        }

        Ok(Self { version, map })
    }

    /// Returns the canonical spelling of `name`. Unknown names pass through
    /// (trimmed).
    pub fn normalize(&self, name: &str) -> String {
        let trimmed = name.trim();
        match self.map.get(trimmed) {
            Some(canonical) => canonical.clone(),
            None => trimmed.to_string(),
        }
    }

    /// Whether `name` is a known source-specific spelling.
    pub fn is_alias(&self, name: &str) -> bool {
        self.map.contains_key(name.trim())
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for CountryAliases {
    fn default() -> Self {
        Self::builtin()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
