use anyhow::{anyhow, Context, Result};
use regex::Regex;
use std::env;
use std::fs;
use std::path::Path;

use super::types::Config;
use super::validate::validate_config;

pub fn load_config(path: &Path) -> Result<Config> {
    use serde::de::IntoDeserializer;

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let expanded = expand_env(&raw)
        .with_context(|| format!("env expansion failed for {}", path.display()))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&expanded)
        .with_context(|| format!("yaml parse failed for {}", path.display()))?;

    let mut ignored = Vec::new();
    let de = value.into_deserializer();
    let config: Config = serde_ignored::deserialize(de, |path| ignored.push(path.to_string()))
        .with_context(|| format!("failed to deserialize config: {}", path.display()))?;
    if !ignored.is_empty() {
        ignored.sort();
        ignored.dedup();
        return Err(anyhow!(
            "unknown config keys (fix typos to avoid unexpected defaults): {}",
            ignored.join(", ")
        ));
    }
    validate_config(&config)?;
    Ok(config)
}

/// Expands `${VAR}` and `${VAR:-default}` references. A reference to an unset
/// variable without a default is an error; text that does not match the
/// reference syntax passes through untouched.
fn expand_env(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-(.*?))?\}")?;
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let m = caps
            .get(0)
            .ok_or_else(|| anyhow!("env expansion capture error"))?;
        out.push_str(&input[last..m.start()]);
        let key = caps.get(1).map(|c| c.as_str()).unwrap_or_default();
        let default = caps.get(2).map(|c| c.as_str());
        match env::var(key) {
            Ok(value) => out.push_str(&value),
            Err(_) => match default {
                Some(d) => out.push_str(d),
                None => return Err(anyhow!("missing environment variable: {key}")),
            },
        }
        last = m.end();
    }
    out.push_str(&input[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_without_variables() {
        assert_eq!(expand_env("listen: host:80").unwrap(), "listen: host:80");
    }

    #[test]
    fn expands_set_variable() {
        env::set_var("GRPCGI_TEST_EXPAND_A", "alpha");
        assert_eq!(expand_env("${GRPCGI_TEST_EXPAND_A}").unwrap(), "alpha");
        env::remove_var("GRPCGI_TEST_EXPAND_A");
    }

    #[test]
    fn uses_default_when_unset() {
        env::remove_var("GRPCGI_TEST_EXPAND_UNSET");
        assert_eq!(
            expand_env("${GRPCGI_TEST_EXPAND_UNSET:-fallback}").unwrap(),
            "fallback"
        );
    }

    #[test]
    fn errors_on_missing_variable_without_default() {
        env::remove_var("GRPCGI_TEST_EXPAND_MISSING");
        assert!(expand_env("${GRPCGI_TEST_EXPAND_MISSING}").is_err());
    }

    #[test]
    fn preserves_surrounding_text() {
        env::set_var("GRPCGI_TEST_EXPAND_MID", "val");
        assert_eq!(
            expand_env("pre-${GRPCGI_TEST_EXPAND_MID}-post").unwrap(),
            "pre-val-post"
        );
        env::remove_var("GRPCGI_TEST_EXPAND_MID");
    }
}
