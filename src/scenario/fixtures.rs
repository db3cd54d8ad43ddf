//! Named values captured during scenario setup and substituted into later
//! commands as `{{name}}`.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::errors::{DipError, Result};

/// Fixture every scenario gets for free: a short random hex token.
pub const RUN_ID: &str = "run_id";

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
});

/// Scenario-scoped fixture values. Created at group setup, dropped at teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fixtures {
    values: BTreeMap<String, String>,
}

impl Fixtures {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixtures seeded with a fresh random [`RUN_ID`].
    #[must_use]
    pub fn with_random_run_id() -> Self {
        let mut fixtures = Self::new();
        fixtures.insert(RUN_ID, format!("{:08x}", rand::random::<u32>()));
        fixtures
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitute every `{{name}}` in `template`.
    ///
    /// Unknown names are an error rather than being left in place, since a
    /// literal `{{...}}` reaching the remote shell is never intended.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(template) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = self
                .get(name.as_str())
                .ok_or_else(|| DipError::UnresolvedFixture {
                    name: name.as_str().to_string(),
                    command: template.to_string(),
                })?;
            out.push_str(&template[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Ok(out)
    }
}
