//! Setting definitions loaded from `.ini` files.
//!
//! Every name the store accepts must be declared in a definition file.
//! Definition files live in a colon-separated list of directories and use
//! one section per setting:
//!
//! ```ini
//! [backend::port]
//! type=integer
//! default=8080
//! help=TCP port the backend listens on
//! flags=dynamic
//! ```
//!
//! Recognized keys: `type` (`string`, `integer`, `double`, `duration`, or
//! `enum(a,b,c)`), `default`, `help`, `flags` (comma list; `dynamic` marks
//! the setting as overridable at run time) and `alias` (redirect to
//! another setting). The first declaration of a name wins; later
//! duplicates are logged and ignored. A missing or empty directory is not
//! an error: the daemon can run with an empty schema and replicate from
//! its peers.

use crate::SettingsError;
use fluid_settings_model::name;
use ini::Ini;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, warn};

/// Validator tag for a setting value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingType {
    String,
    Integer,
    Double,
    Duration,
    Enum(Vec<String>),
}

impl SettingType {
    /// Parse a `type=` specification.
    pub fn parse(spec: &str) -> Result<Self, SettingsError> {
        let spec = spec.trim();
        match spec {
            "" | "string" => return Ok(Self::String),
            "integer" => return Ok(Self::Integer),
            "double" => return Ok(Self::Double),
            "duration" => return Ok(Self::Duration),
            _ => {}
        }
        if let Some(list) = spec
            .strip_prefix("enum(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let allowed: Vec<String> = list
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect();
            if allowed.is_empty() {
                return Err(SettingsError::Definition(format!(
                    "enum type {spec:?} has no values"
                )));
            }
            return Ok(Self::Enum(allowed));
        }
        Err(SettingsError::Definition(format!(
            "unknown setting type {spec:?}"
        )))
    }

    /// Check a candidate value against this type.
    pub fn validate(&self, value: &str) -> bool {
        match self {
            Self::String => true,
            Self::Integer => value.trim().parse::<i64>().is_ok(),
            Self::Double => value.trim().parse::<f64>().is_ok(),
            Self::Duration => humantime::parse_duration(value.trim()).is_ok(),
            Self::Enum(allowed) => allowed.iter().any(|a| a == value),
        }
    }
}

/// One declared setting. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Definition {
    pub name: String,
    pub kind: SettingType,
    pub default: Option<String>,
    pub help: String,
    pub dynamic: bool,
    pub alias_of: Option<String>,
}

impl Definition {
    pub fn new(name: impl Into<String>, kind: SettingType) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            help: String::new(),
            dynamic: false,
            alias_of: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }
}

// aliases may chain, but never this deep in practice
const MAX_ALIAS_DEPTH: usize = 4;

/// The set of declared settings.
#[derive(Debug, Default)]
pub struct Schema {
    definitions: BTreeMap<String, Definition>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all `*.ini` files from a colon-separated list of directories.
    ///
    /// Never fails: unreadable directories and malformed files are logged
    /// and skipped, and an empty schema is a legal (dormant) outcome.
    pub fn load(paths: &str) -> Self {
        let mut schema = Self::new();
        let mut found = false;
        for dir in paths.split(':').filter(|p| !p.is_empty()) {
            if schema.load_dir(Path::new(dir)) {
                found = true;
            }
        }
        if !found {
            warn!("no settings definition files found anywhere; the schema is empty");
        }
        schema
    }

    fn load_dir(&mut self, dir: &Path) -> bool {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot read definitions directory {}: {e}", dir.display());
                return false;
            }
        };
        let mut files: Vec<_> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "ini"))
            .collect();
        files.sort();
        let found = !files.is_empty();
        for file in files {
            self.load_file(&file);
        }
        found
    }

    fn load_file(&mut self, path: &Path) {
        debug!("loading settings definitions from {}", path.display());
        let ini = match Ini::load_from_file(path) {
            Ok(ini) => ini,
            Err(e) => {
                warn!("cannot parse definitions file {}: {e}", path.display());
                return;
            }
        };
        for (section, properties) in ini.iter() {
            let Some(section) = section else {
                continue;
            };
            let setting_name = name::canonicalize(section);
            let kind = match SettingType::parse(properties.get("type").unwrap_or_default()) {
                Ok(kind) => kind,
                Err(e) => {
                    warn!("invalid definition for {setting_name:?} in {}: {e}", path.display());
                    continue;
                }
            };
            let flags = properties.get("flags").unwrap_or_default();
            let definition = Definition {
                name: setting_name.clone(),
                kind,
                default: properties.get("default").map(str::to_string),
                help: properties.get("help").unwrap_or_default().to_string(),
                dynamic: flags.split(',').any(|f| f.trim() == "dynamic"),
                alias_of: properties
                    .get("alias")
                    .map(|target| name::canonicalize(target)),
            };
            if !self.insert(definition) {
                warn!(
                    "duplicate definition of {setting_name:?} in {} ignored",
                    path.display()
                );
            }
        }
    }

    /// Insert a definition; the first declaration of a name wins.
    /// Returns false when the name was already declared.
    pub fn insert(&mut self, definition: Definition) -> bool {
        use std::collections::btree_map::Entry;
        match self.definitions.entry(definition.name.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(definition);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    /// Look up a definition, following `alias` redirects.
    pub fn get(&self, name: &str) -> Option<&Definition> {
        let mut current = self.definitions.get(name)?;
        for _ in 0..MAX_ALIAS_DEPTH {
            match &current.alias_of {
                Some(target) => current = self.definitions.get(target)?,
                None => return Some(current),
            }
        }
        warn!("alias chain starting at {name:?} is too deep");
        None
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sorted, comma-joined list of all declared names (for `LIST`).
    pub fn list_of_names(&self) -> String {
        let names: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        names.join(",")
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ini(dir: &Path, file: &str, contents: &str) {
        let mut f = std::fs::File::create(dir.join(file)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn loads_definitions_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_ini(
            dir.path(),
            "backend.ini",
            "[backend::port]\ntype=integer\ndefault=8080\nhelp=listen port\nflags=dynamic\n\n\
             [backend::mode]\ntype=enum(fast,safe)\ndefault=safe\n",
        );
        let schema = Schema::load(dir.path().to_str().unwrap());
        assert_eq!(schema.len(), 2);

        let port = schema.get("backend::port").unwrap();
        assert_eq!(port.kind, SettingType::Integer);
        assert_eq!(port.default.as_deref(), Some("8080"));
        assert!(port.dynamic);

        let mode = schema.get("backend::mode").unwrap();
        assert!(!mode.dynamic);
        assert!(mode.kind.validate("fast"));
        assert!(!mode.kind.validate("slow"));
    }

    #[test]
    fn first_declaration_wins() {
        let dir = tempfile::tempdir().unwrap();
        write_ini(dir.path(), "a.ini", "[dup::name]\ntype=integer\ndefault=1\n");
        write_ini(dir.path(), "b.ini", "[dup::name]\ntype=string\ndefault=two\n");
        let schema = Schema::load(dir.path().to_str().unwrap());
        // files load in sorted order, so a.ini declared it first
        assert_eq!(schema.get("dup::name").unwrap().default.as_deref(), Some("1"));
    }

    #[test]
    fn missing_directory_yields_empty_schema() {
        let schema = Schema::load("/nonexistent/definitions:/also/missing");
        assert!(schema.is_empty());
        assert_eq!(schema.list_of_names(), "");
    }

    #[test]
    fn section_names_are_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        write_ini(dir.path(), "c.ini", "[svc::serial_number]\ntype=string\n");
        let schema = Schema::load(dir.path().to_str().unwrap());
        assert!(schema.contains("svc::serial-number"));
        assert!(!schema.contains("svc::serial_number"));
    }

    #[test]
    fn aliases_redirect_to_target() {
        let mut schema = Schema::new();
        schema.insert(Definition::new("real::name", SettingType::String).with_default("x"));
        let mut alias = Definition::new("old::name", SettingType::String);
        alias.alias_of = Some("real::name".to_string());
        schema.insert(alias);

        assert_eq!(schema.get("old::name").unwrap().name, "real::name");
    }

    #[test]
    fn alias_loops_give_up() {
        let mut schema = Schema::new();
        let mut a = Definition::new("a", SettingType::String);
        a.alias_of = Some("b".to_string());
        let mut b = Definition::new("b", SettingType::String);
        b.alias_of = Some("a".to_string());
        schema.insert(a);
        schema.insert(b);
        assert!(schema.get("a").is_none());
    }

    #[test]
    fn validators_cover_the_type_set() {
        assert!(SettingType::Integer.validate("42"));
        assert!(!SettingType::Integer.validate("4.2"));
        assert!(SettingType::Double.validate("4.2"));
        assert!(SettingType::Duration.validate("5s"));
        assert!(SettingType::Duration.validate("1h 30m"));
        assert!(!SettingType::Duration.validate("soon"));
        assert!(SettingType::String.validate("anything at all"));
    }

    #[test]
    fn type_parse_rejects_unknown() {
        assert!(SettingType::parse("blob").is_err());
        assert!(SettingType::parse("enum()").is_err());
        assert_eq!(SettingType::parse("").unwrap(), SettingType::String);
    }

    #[test]
    fn list_of_names_is_sorted_csv() {
        let mut schema = Schema::new();
        schema.insert(Definition::new("z::last", SettingType::String));
        schema.insert(Definition::new("a::first", SettingType::String));
        assert_eq!(schema.list_of_names(), "a::first,z::last");
    }
}
