//! Tunables shared by the compiler and the VM, loadable from a JSON file.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::MAX_BLOB_BITS;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Options {
    /// Steps a compiler may spend evaluating constant expressions.
    pub compile_step_budget: u64,
    /// Compiled lambda and lazy bodies kept per VM.
    pub func_cache_capacity: usize,
    /// Largest value `Post` accepts, in bits.
    pub max_blob_bits: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            compile_step_budget: 1_000_000,
            func_cache_capacity: 256,
            max_blob_bits: u64::from(MAX_BLOB_BITS),
        }
    }
}

impl Options {
    pub fn from_json(text: &str) -> Result<Options> {
        serde_json::from_str(text).map_err(|err| Error::Malformed(format!("options: {err}")))
    }

    pub fn load(path: &Path) -> Result<Options> {
        Options::from_json(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() -> Result<()> {
        let opts = Options::from_json(r#"{ "func_cache_capacity": 4 }"#)?;
        assert_eq!(opts.func_cache_capacity, 4);
        assert_eq!(opts.compile_step_budget, Options::default().compile_step_budget);
        Ok(())
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(matches!(
            Options::from_json(r#"{ "budget": 1 }"#),
            Err(Error::Malformed(_))
        ));
    }
}
