use std::fmt::{self, Display, Formatter};

use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::provider::ToolProviderConfig;

/// Deterministic key of a provider set.
///
/// Two sets with the same launch descriptors map to the same fingerprint
/// whatever order they are listed in. Display names are not part of the key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of `configs`.
    pub fn of(configs: &[ToolProviderConfig]) -> Self {
        let mut sorted: Vec<_> = configs.iter().collect();
        sorted.sort_by(|a, b| a.id.cmp(&b.id));
        sorted.dedup_by(|later, earlier| later.id == earlier.id);

        let normalized: Vec<Value> = sorted
            .into_iter()
            .map(|config| {
                json!({
                    "id": config.id,
                    "command": config.command,
                    "args": config.args,
                    "env": config.env,
                })
            })
            .collect();
        let digest = Sha256::digest(Value::Array(normalized).to_string());
        Self(format!("{digest:x}"))
    }

    /// The hex digest.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent() {
        let fs = ToolProviderConfig::new("fs", "fs-server").with_args(["/tmp"]);
        let web = ToolProviderConfig::new("web", "web-server");
        assert_eq!(
            Fingerprint::of(&[fs.clone(), web.clone()]),
            Fingerprint::of(&[web.clone(), fs.clone()])
        );
        assert_eq!(Fingerprint::of(&[fs.clone()]).as_str().len(), 64);
    }

    #[test]
    fn test_launch_descriptor_matters() {
        let fs = ToolProviderConfig::new("fs", "fs-server");
        let renamed = fs.clone().with_name("Files");
        let other_args = fs.clone().with_args(["--read-only"]);
        let other_env = fs.clone().with_env("ROOT", "/srv");

        let base = Fingerprint::of(&[fs]);
        assert_eq!(base, Fingerprint::of(&[renamed]));
        assert_ne!(base, Fingerprint::of(&[other_args]));
        assert_ne!(base, Fingerprint::of(&[other_env]));
    }
}
