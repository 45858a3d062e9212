use std::{collections::BTreeMap, io::ErrorKind, path::Path};

use anyhow::{Context, Result};
use fs_err as fs;
use tracing::debug;

/// Load `KEY=VALUE` pairs from a dotenv style file.
///
/// A missing file is treated as empty. Blank lines and `#` comments are
/// skipped, keys and values are trimmed and surrounding quotes are removed
/// from values. Later assignments override earlier ones.
pub fn load_env_file(path: impl AsRef<Path>) -> Result<BTreeMap<String, String>> {
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("env file {} not found, skipping", path.display());
            return Ok(BTreeMap::new());
        }
        Err(err) => return Err(err).context("failed to read env file"),
    };
    let vars = parse_env(&content);
    // Values may hold secrets, only the keys are logged.
    debug!(keys = ?vars.keys().collect::<Vec<_>>(), "loaded env file {}", path.display());
    Ok(vars)
}

pub(crate) fn parse_env(content: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line.split_once('=').unwrap_or((line, ""));
        let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
        vars.insert(key.trim().to_string(), value.to_string());
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(content: &str) -> BTreeMap<String, String> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, content).unwrap();
        load_env_file(&path).unwrap()
    }

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn loads_plain_value() {
        assert_eq!(
            load("CLOUDFLARE_API_TOKEN=test_token_123\n"),
            map(&[("CLOUDFLARE_API_TOKEN", "test_token_123")])
        );
    }

    #[test]
    fn strips_quotes() {
        assert_eq!(
            load("CLOUDFLARE_API_TOKEN=\"test_token_123\"\nOTHER='single'\n"),
            map(&[("CLOUDFLARE_API_TOKEN", "test_token_123"), ("OTHER", "single")])
        );
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        assert_eq!(
            load("# This is a comment\n\n   \nCLOUDFLARE_API_TOKEN=test_token\n"),
            map(&[("CLOUDFLARE_API_TOKEN", "test_token")])
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = load_env_file(dir.path().join("nonexistent.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn loads_all_known_keys() {
        let vars = load(
            "CLOUDFLARE_API_TOKEN=token123\nDOMAIN=example.com\nEMAIL=admin@example.com\nSTAGING=1\nPROPAGATION_SECONDS=30\n",
        );
        assert_eq!(
            vars,
            map(&[
                ("CLOUDFLARE_API_TOKEN", "token123"),
                ("DOMAIN", "example.com"),
                ("EMAIL", "admin@example.com"),
                ("PROPAGATION_SECONDS", "30"),
                ("STAGING", "1"),
            ])
        );
    }

    #[test]
    fn splits_on_first_equals_and_trims() {
        let vars = parse_env("  KEY = a=b \nNOVALUE\n");
        assert_eq!(vars, map(&[("KEY", "a=b"), ("NOVALUE", "")]));
    }

    #[test]
    fn later_assignment_wins() {
        let vars = parse_env("DOMAIN=a.example.com\nDOMAIN=b.example.com\n");
        assert_eq!(vars, map(&[("DOMAIN", "b.example.com")]));
    }
}
