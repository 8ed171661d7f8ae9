//! Strongly-typed identifiers for nimbus entities.
//!
//! Identifiers travel through lock records, key encodings and task
//! descriptors. Wrapping them keeps a tablet id from being passed where a
//! table id is expected.
//!
//! # Example
//!
//! ```rust
//! use nimbus_core::id::{InstanceId, TableId, TabletId};
//!
//! let instance = InstanceId::new("warehouse-1").unwrap();
//! let table = TableId::new(10001);
//! let tablet = TabletId::new(20001);
//!
//! assert_eq!(instance.as_str(), "warehouse-1");
//! assert_eq!(table.get(), 10001);
//! assert_eq!(tablet.to_string(), "20001");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Characters reserved by the key encoding.
const KEY_DELIMITER: char = '/';

/// Identifier of a cloud instance (one logical warehouse).
///
/// Instance ids must be non-empty, at most 128 characters, and must not
/// contain the key delimiter or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Creates a new instance ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the instance ID is invalid.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_component("instance", &id, 128)?;
        Ok(Self(id))
    }

    /// Returns the instance ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for InstanceId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Identifier of a rowset (one batch of segments written by a load or compaction).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowsetId(String);

impl RowsetId {
    /// Creates a new rowset ID after validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the rowset ID is empty or contains reserved characters.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_component("rowset", &id, 64)?;
        Ok(Self(id))
    }

    /// Returns the rowset ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RowsetId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

fn validate_component(kind: &str, id: &str, max_len: usize) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} id cannot be empty"),
        });
    }
    if id.len() > max_len {
        return Err(Error::InvalidId {
            message: format!("{kind} id exceeds {max_len} characters: {id}"),
        });
    }
    if id
        .chars()
        .any(|c| c == KEY_DELIMITER || c.is_whitespace() || c.is_control())
    {
        return Err(Error::InvalidId {
            message: format!("{kind} id contains reserved characters: {id:?}"),
        });
    }
    Ok(())
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $inner:ty) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name($inner);

        impl $name {
            /// Wraps a raw value.
            #[must_use]
            pub const fn new(value: $inner) -> Self {
                Self(value)
            }

            /// Returns the raw value.
            #[must_use]
            pub const fn get(self) -> $inner {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// Identifier of a table.
    TableId,
    i64
);
numeric_id!(
    /// Identifier of a tablet (one shard of a table partition).
    TabletId,
    i64
);
numeric_id!(
    /// Ordinal of a segment file within a rowset.
    SegmentId,
    u32
);
numeric_id!(
    /// A data version of a tablet.
    Version,
    i64
);
