//! Name to factory tables used to pick pluggable implementations from
//! configuration values (`pm-type`, `root-type`, `su-type`).

use std::collections::BTreeMap;

use crate::error::Error;

pub struct Registry<F> {
    kind: &'static str,
    entries: BTreeMap<String, F>,
}

impl<F> Registry<F> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: impl Into<String>, factory: F) -> &mut Self {
        self.entries.insert(name.into(), factory);
        self
    }

    pub fn get(&self, name: &str) -> Result<&F, Error> {
        self.entries.get(name).ok_or_else(|| {
            Error::Config(format!(
                "invalid {}: {name} (known: {})",
                self.kind,
                self.names().join(", ")
            ))
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        let mut reg: Registry<fn() -> u8> = Registry::new("widget type");
        reg.register("one", || 1).register("two", || 2);
        assert_eq!((reg.get("two").unwrap())(), 2);
        let err = reg.get("three").err().unwrap();
        assert!(err.to_string().contains("invalid widget type: three"));
        assert_eq!(reg.names(), vec!["one", "two"]);
    }
}
