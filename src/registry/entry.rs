use crate::RegistryError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const ENTRY_MIN_LEN: usize = 4;
pub const ENTRY_MAX_LEN: usize = 255;

/// One published endpoint: a service key and the address serving it.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistryEntry {
    pub key: String,
    pub value: String,
}

impl RegistryEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// Both key and value, trimmed, must be within 4 ~ 255 characters
    pub fn validate(&self) -> Result<(), RegistryError> {
        check_field("key", &self.key)?;
        check_field("value", &self.value)
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

fn check_field(name: &str, s: &str) -> Result<(), RegistryError> {
    let len = s.trim().chars().count();
    if len < ENTRY_MIN_LEN || len > ENTRY_MAX_LEN {
        return Err(RegistryError::Validation(format!(
            "{} {:?} length {} out of range [{}, {}]",
            name, s, len, ENTRY_MIN_LEN, ENTRY_MAX_LEN
        )));
    }
    Ok(())
}

/// The first invalid entry fails the whole list, an empty list is invalid too.
pub fn validate_entries(entries: &[RegistryEntry]) -> Result<(), RegistryError> {
    if entries.is_empty() {
        return Err(RegistryError::Validation("empty entry list".to_string()));
    }
    for entry in entries {
        entry.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_length() {
        assert!(RegistryEntry::new("abcd", "1.2.3.4:80").validate().is_ok());
        assert!(RegistryEntry::new("abc", "1.2.3.4:80").validate().is_err());
        // trimmed before counting
        assert!(RegistryEntry::new("  abc  ", "1.2.3.4:80").validate().is_err());
        assert!(RegistryEntry::new("a".repeat(255), "1.2.3.4:80").validate().is_ok());
        assert!(RegistryEntry::new("a".repeat(256), "1.2.3.4:80").validate().is_err());
        // characters, not bytes
        assert!(RegistryEntry::new("服务名称", "1.2.3.4:80").validate().is_ok());
        assert!(RegistryEntry::new("abcd", "1:2").validate().is_err());
    }

    #[test]
    fn test_validate_entries() {
        assert!(matches!(validate_entries(&[]), Err(RegistryError::Validation(_))));
        let entries = vec![RegistryEntry::new("demo.Echo", "127.0.0.1:7080"), RegistryEntry::new("x", "127.0.0.1:7080")];
        assert!(matches!(validate_entries(&entries), Err(RegistryError::Validation(_))));
        assert!(validate_entries(&entries[..1]).is_ok());
    }
}
