//! Typed environment variable parsing for `NIMBUS_*` configuration.
//!
//! Config structs read their overrides through an [`EnvReader`]. In
//! production the reader wraps the process environment; tests build one
//! from explicit pairs so they never mutate global state.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Source of configuration variables.
pub struct EnvReader<'a> {
    lookup: Box<dyn Fn(&str) -> Option<String> + 'a>,
}

impl std::fmt::Debug for EnvReader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvReader").finish_non_exhaustive()
    }
}

impl EnvReader<'static> {
    /// Reads from the process environment.
    #[must_use]
    pub fn process() -> Self {
        Self {
            lookup: Box::new(|name| std::env::var(name).ok()),
        }
    }

    /// Reads from a fixed set of pairs.
    #[must_use]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self {
            lookup: Box::new(move |name| map.get(name).cloned()),
        }
    }
}

impl<'a> EnvReader<'a> {
    /// Reads through an arbitrary lookup function.
    pub fn from_fn(lookup: impl Fn(&str) -> Option<String> + 'a) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }

    /// Returns the trimmed value, or `None` when unset or blank.
    #[must_use]
    pub fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    /// Parses an unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but not a `u64`.
    pub fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a u64: {e}")))
    }

    /// Parses a `usize`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but not a `usize`.
    pub fn usize(&self, name: &str) -> Result<Option<usize>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<usize>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a usize: {e}")))
    }

    /// Parses a float.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but not a number.
    pub fn f64(&self, name: &str) -> Result<Option<f64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<f64>()
            .map(Some)
            .map_err(|e| Error::InvalidInput(format!("{name} must be a number: {e}")))
    }

    /// Parses a boolean.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is set but not a recognised boolean.
    pub fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::InvalidInput(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
