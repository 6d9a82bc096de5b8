//! Local option values and the fluid-settings overlay.
//!
//! Services keep their own option table (defaults, configuration files,
//! command line). The session layer overlays values pushed by the daemon
//! onto options declared `dynamic`, without ever beating an explicit
//! command-line value.

use std::collections::BTreeMap;

/// Where an option's current value came from, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptionSource {
    Default,
    Configuration,
    FluidSettings,
    CommandLine,
}

/// Outcome of overlaying a pushed value onto the local table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayResult {
    /// The option now carries the pushed value.
    Applied,
    /// The option is not declared locally.
    Unknown,
    /// The option is not marked `dynamic`.
    NotDynamic,
    /// A command-line value outranks the push.
    Pinned,
}

#[derive(Debug, Clone)]
struct LocalOption {
    value: Option<String>,
    source: OptionSource,
    dynamic: bool,
}

/// A service's local option table.
#[derive(Debug, Default)]
pub struct LocalOptions {
    options: BTreeMap<String, LocalOption>,
}

impl LocalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an option. `dynamic` opts it into fluid-settings overlays.
    pub fn declare(&mut self, name: impl Into<String>, default: Option<&str>, dynamic: bool) {
        self.options.insert(
            name.into(),
            LocalOption {
                value: default.map(str::to_string),
                source: OptionSource::Default,
                dynamic,
            },
        );
    }

    /// Set a value from configuration or the command line.
    pub fn set(&mut self, name: &str, value: &str, source: OptionSource) -> bool {
        match self.options.get_mut(name) {
            Some(option) => {
                option.value = Some(value.to_string());
                option.source = source;
                true
            }
            None => false,
        }
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.options.get(name)?.value.as_deref()
    }

    pub fn source(&self, name: &str) -> Option<OptionSource> {
        self.options.get(name).map(|o| o.source)
    }

    /// Overlay a value pushed by the daemon.
    pub fn overlay(&mut self, name: &str, value: &str) -> OverlayResult {
        let Some(option) = self.options.get_mut(name) else {
            return OverlayResult::Unknown;
        };
        if !option.dynamic {
            return OverlayResult::NotDynamic;
        }
        if option.source == OptionSource::CommandLine {
            return OverlayResult::Pinned;
        }
        option.value = Some(value.to_string());
        option.source = OptionSource::FluidSettings;
        OverlayResult::Applied
    }

    /// Names of every option declared `dynamic`, for automatic watch
    /// registration.
    pub fn dynamic_names(&self) -> Vec<String> {
        self.options
            .iter()
            .filter(|(_, o)| o.dynamic)
            .map(|(name, _)| name.clone())
            .collect()
    }
}
