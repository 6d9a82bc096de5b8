//! The priority-stratified settings store.
//!
//! Combines the loaded [`Schema`] with the per-name [`ValueSet`]s. All
//! reads and writes are gated on the schema: a name without a definition
//! is `Unknown` and never creates a record. The store also produces and
//! consumes the peer-replication serialization, whose merge is commutative
//! and idempotent so peers converge no matter the message order.

use crate::schema::Schema;
use crate::value::{Record, SetResult, ValueSet};
use fluid_settings_model::{escape, timestamp, Priority, PriorityQuery, Timestamp};
use std::collections::BTreeMap;
use tracing::warn;

/// Outcome of a query against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResult {
    /// A stored value (at the requested or the highest priority).
    Value(String),
    /// All stored values, comma-joined with embedded commas escaped.
    AllValues(String),
    /// No stored value; the schema default applies.
    Default(String),
    /// Declared, but no value stored and no default defined.
    NotSet,
    /// No record at the specifically requested priority.
    PriorityNotFound,
    /// The name is not declared in the schema.
    Unknown,
}

/// Outcome of a reset (delete of one priority's record).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetResult {
    /// A record was removed.
    Removed,
    /// Nothing stored at that priority.
    Nothing,
    /// The name is not declared in the schema.
    Unknown,
}

/// The daemon's one settings table.
#[derive(Debug)]
pub struct SettingsStore {
    schema: Schema,
    values: BTreeMap<String, ValueSet>,
    timestamp_floor: Timestamp,
}

impl SettingsStore {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            values: BTreeMap::new(),
            timestamp_floor: timestamp::DEFAULT_FLOOR,
        }
    }

    /// Override the refusal floor for stored timestamps.
    pub fn with_timestamp_floor(mut self, floor: Timestamp) -> Self {
        self.timestamp_floor = floor;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Sorted, comma-joined declared names (for `LIST`).
    pub fn list_of_names(&self) -> String {
        self.schema.list_of_names()
    }

    /// Query a value. `all` returns every stored record comma-joined and
    /// ignores `priority`.
    pub fn get(&self, name: &str, priority: PriorityQuery, all: bool) -> GetResult {
        let Some(definition) = self.schema.get(name) else {
            return GetResult::Unknown;
        };
        let set = self.values.get(&definition.name);

        if all {
            return match set.filter(|s| !s.is_empty()) {
                Some(set) => GetResult::AllValues(
                    set.iter()
                        .map(|(_, record)| escape::escape_commas(&record.value))
                        .collect::<Vec<_>>()
                        .join(","),
                ),
                None => self.default_of(name),
            };
        }

        match priority {
            PriorityQuery::Highest => match set.and_then(ValueSet::highest) {
                Some(record) => GetResult::Value(record.value.clone()),
                None => self.default_of(name),
            },
            PriorityQuery::At(priority) => match set {
                Some(set) if !set.is_empty() => match set.at(priority) {
                    Some(record) => GetResult::Value(record.value.clone()),
                    None => GetResult::PriorityNotFound,
                },
                _ => self.default_of(name),
            },
        }
    }

    /// The schema default for a name.
    pub fn get_default(&self, name: &str) -> GetResult {
        if !self.schema.contains(name) {
            return GetResult::Unknown;
        }
        self.default_of(name)
    }

    fn default_of(&self, name: &str) -> GetResult {
        match self.schema.get(name).and_then(|d| d.default.clone()) {
            Some(default) => GetResult::Default(default),
            None => GetResult::NotSet,
        }
    }

    /// The value a subscriber should see right now: the highest stored
    /// record, falling back to the schema default.
    pub fn effective_value(&self, name: &str) -> Option<String> {
        match self.get(name, PriorityQuery::Highest, false) {
            GetResult::Value(v) | GetResult::Default(v) => Some(v),
            _ => None,
        }
    }

    /// Store a value, applying schema gating, validation, the timestamp
    /// floor and last-writer-wins resolution.
    pub fn set(
        &mut self,
        name: &str,
        value: &str,
        priority: Priority,
        timestamp: Timestamp,
    ) -> SetResult {
        let Some(definition) = self.schema.get(name) else {
            return SetResult::Unknown;
        };
        if !definition.kind.validate(value) {
            warn!("value {value:?} rejected by the {:?} validator of {name}", definition.kind);
            return SetResult::Error;
        }
        if timestamp < self.timestamp_floor {
            warn!(
                "timestamp {timestamp} for {name} is below the acceptable floor {}",
                self.timestamp_floor
            );
            return SetResult::Error;
        }
        let key = definition.name.clone();
        self.values
            .entry(key)
            .or_default()
            .insert(priority, timestamp, value.to_string())
    }

    /// Remove the record at one priority. The entry disappears entirely
    /// once its last record is gone.
    pub fn reset(&mut self, name: &str, priority: Priority) -> ResetResult {
        let Some(definition) = self.schema.get(name) else {
            return ResetResult::Unknown;
        };
        let key = definition.name.clone();
        let Some(set) = self.values.get_mut(&key) else {
            return ResetResult::Nothing;
        };
        if !set.remove(priority) {
            return ResetResult::Nothing;
        }
        if set.is_empty() {
            self.values.remove(&key);
        }
        ResetResult::Removed
    }

    /// Serialize every record of a name for peer replication: one
    /// `priority|timestamp|escaped-value` record per line.
    pub fn serialize(&self, name: &str) -> String {
        let Some(set) = self
            .schema
            .get(name)
            .and_then(|d| self.values.get(&d.name))
        else {
            return String::new();
        };
        let mut out = String::new();
        for (priority, record) in set.iter() {
            out.push_str(&priority.to_string());
            out.push(escape::FIELD_SEPARATOR);
            out.push_str(&record.timestamp.to_string());
            out.push(escape::FIELD_SEPARATOR);
            out.push_str(&escape::escape_field(&record.value));
            out.push(escape::VALUE_SEPARATOR);
        }
        out
    }

    /// Merge a serialized value set received from a peer. Malformed lines
    /// are logged and skipped. Returns how many records mutated the store.
    pub fn unserialize(&mut self, name: &str, blob: &str) -> usize {
        let mut applied = 0;
        for line in blob.split(escape::VALUE_SEPARATOR) {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(3, escape::FIELD_SEPARATOR);
            let (Some(priority), Some(stamp), Some(value)) =
                (fields.next(), fields.next(), fields.next())
            else {
                warn!("invalid record {line:?} in serialized values for {name}");
                continue;
            };
            let Ok(priority) = Priority::parse(priority) else {
                warn!("invalid priority {priority:?} in serialized values for {name}");
                continue;
            };
            let Ok(stamp) = Timestamp::parse(stamp) else {
                warn!("invalid timestamp {stamp:?} in serialized values for {name}");
                continue;
            };
            let value = escape::unescape_field(value);
            if self.set(name, &value, priority, stamp).mutated() {
                applied += 1;
            }
        }
        applied
    }

    /// Every stored record, for persistence.
    pub fn all_records(&self) -> impl Iterator<Item = (&str, Priority, &Record)> {
        self.values.iter().flat_map(|(name, set)| {
            set.iter()
                .map(move |(priority, record)| (name.as_str(), priority, record))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Definition, SettingType};

    fn test_schema() -> Schema {
        let mut schema = Schema::new();
        schema.insert(Definition::new("test::name", SettingType::String).dynamic());
        schema.insert(
            Definition::new("test::lang", SettingType::String)
                .with_default("en")
                .dynamic(),
        );
        schema.insert(Definition::new("test::count", SettingType::Integer).dynamic());
        schema
    }

    fn store() -> SettingsStore {
        SettingsStore::new(test_schema()).with_timestamp_floor(Timestamp::from_nanos(0))
    }

    fn p(n: i64) -> Priority {
        Priority::new(n).unwrap()
    }

    fn ts(n: i64) -> Timestamp {
        Timestamp::from_nanos(n)
    }

    #[test]
    fn put_then_get() {
        let mut store = store();
        assert_eq!(
            store.set("test::name", "hello", p(50), ts(1_700_000_000_000_000_000)),
            SetResult::New
        );
        assert_eq!(
            store.get("test::name", PriorityQuery::Highest, false),
            GetResult::Value("hello".to_string())
        );
    }

    #[test]
    fn default_fallback_and_delete() {
        let mut store = store();
        assert_eq!(
            store.get("test::lang", PriorityQuery::Highest, false),
            GetResult::Default("en".to_string())
        );

        store.set("test::lang", "fr", p(50), ts(1));
        assert_eq!(
            store.get("test::lang", PriorityQuery::Highest, false),
            GetResult::Value("fr".to_string())
        );

        assert_eq!(store.reset("test::lang", p(50)), ResetResult::Removed);
        assert_eq!(
            store.get("test::lang", PriorityQuery::Highest, false),
            GetResult::Default("en".to_string())
        );
    }

    #[test]
    fn priority_shadowing() {
        let mut store = store();
        store.set("test::name", "admin", p(50), ts(1));
        store.set("test::name", "app", p(60), ts(2));

        assert_eq!(
            store.get("test::name", PriorityQuery::Highest, false),
            GetResult::Value("app".to_string())
        );
        assert_eq!(
            store.get("test::name", PriorityQuery::At(p(50)), false),
            GetResult::Value("admin".to_string())
        );
        assert_eq!(
            store.get("test::name", PriorityQuery::Highest, true),
            GetResult::AllValues("admin,app".to_string())
        );
    }

    #[test]
    fn lww_rejects_older_write() {
        let mut store = store();
        store.set("test::name", "new", p(50), ts(2_000_000_000_000_000_000));
        assert_eq!(
            store.set("test::name", "old", p(50), ts(1_000_000_000_000_000_000)),
            SetResult::Unchanged
        );
        assert_eq!(
            store.get("test::name", PriorityQuery::Highest, false),
            GetResult::Value("new".to_string())
        );
    }

    #[test]
    fn unknown_names_never_create_records() {
        let mut store = store();
        assert_eq!(
            store.get("nope::nothing", PriorityQuery::Highest, false),
            GetResult::Unknown
        );
        assert_eq!(store.set("nope::nothing", "x", p(50), ts(1)), SetResult::Unknown);
        assert_eq!(store.reset("nope::nothing", p(50)), ResetResult::Unknown);
        assert_eq!(store.all_records().count(), 0);
    }

    #[test]
    fn validator_gates_writes() {
        let mut store = store();
        assert_eq!(store.set("test::count", "12", p(50), ts(1)), SetResult::New);
        assert_eq!(
            store.set("test::count", "twelve", p(50), ts(2)),
            SetResult::Error
        );
        assert_eq!(
            store.get("test::count", PriorityQuery::Highest, false),
            GetResult::Value("12".to_string())
        );
    }

    #[test]
    fn timestamp_floor_gates_writes() {
        let mut store =
            SettingsStore::new(test_schema()).with_timestamp_floor(ts(1_000));
        assert_eq!(store.set("test::name", "x", p(50), ts(999)), SetResult::Error);
        assert_eq!(store.set("test::name", "x", p(50), ts(1_000)), SetResult::New);
    }

    #[test]
    fn priority_not_found_vs_not_set() {
        let mut store = store();
        assert_eq!(
            store.get("test::name", PriorityQuery::At(p(50)), false),
            GetResult::NotSet
        );
        store.set("test::name", "x", p(60), ts(1));
        assert_eq!(
            store.get("test::name", PriorityQuery::At(p(50)), false),
            GetResult::PriorityNotFound
        );
    }

    #[test]
    fn all_values_escape_commas() {
        let mut store = store();
        store.set("test::name", "a,b", p(50), ts(1));
        store.set("test::name", "c", p(60), ts(2));
        assert_eq!(
            store.get("test::name", PriorityQuery::Highest, true),
            GetResult::AllValues("a\\,b,c".to_string())
        );
    }

    #[test]
    fn serialize_round_trips() {
        let mut store = store();
        store.set("test::name", "pipe|and\\slash", p(50), ts(10));
        store.set("test::name", "plain", p(60), ts(20));
        let blob = store.serialize("test::name");

        let mut other = SettingsStore::new(test_schema())
            .with_timestamp_floor(Timestamp::from_nanos(0));
        assert_eq!(other.unserialize("test::name", &blob), 2);
        assert_eq!(other.serialize("test::name"), blob);

        // merging into the originating store is a no-op
        assert_eq!(store.unserialize("test::name", &blob), 0);
    }

    #[test]
    fn unserialize_skips_malformed_lines() {
        let mut store = store();
        let blob = "50|10|good\nbad-line\nxx|20|ignored\n60|zz|ignored\n";
        assert_eq!(store.unserialize("test::name", blob), 1);
        assert_eq!(
            store.get("test::name", PriorityQuery::Highest, false),
            GetResult::Value("good".to_string())
        );
    }

    #[test]
    fn effective_value_prefers_records_over_default() {
        let mut store = store();
        assert_eq!(store.effective_value("test::lang"), Some("en".to_string()));
        store.set("test::lang", "fr", p(50), ts(1));
        assert_eq!(store.effective_value("test::lang"), Some("fr".to_string()));
        assert_eq!(store.effective_value("test::name"), None);
    }
}
