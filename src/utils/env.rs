use std::{collections::HashMap, path::Path};

use log::{debug, warn};

/// The key holding the Hugging Face access token
pub static HUGGINGFACE_TOKEN: &str = "HUGGINGFACE_TOKEN";

/// Credentials read from a `.env` file, falling back to the process environment
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    values: HashMap<String, String>,
}

/// The credentials file could not be loaded. Never fatal: features that need
/// credentials are skipped instead.
#[derive(thiserror::Error, Debug)]
pub enum EnvironmentLoadWarning {
    /// No file at the given location
    #[error("credentials file not found: {0}")]
    NotFound(String),

    /// The file exists but could not be read
    #[error("unable to read credentials file {path}: {source}")]
    Unreadable {
        /// The credentials file
        path: String,
        /// The underlying error
        source: std::io::Error,
    },
}

impl Credentials {
    /// Load a `.env` file. A missing or unreadable file yields empty credentials
    /// and a logged warning.
    pub fn load(path: impl AsRef<Path>) -> Self {
        match Self::try_load(path.as_ref()) {
            Ok(credentials) => {
                debug!("Loaded credentials from {}", path.as_ref().display());
                credentials
            }
            Err(warning) => {
                warn!("{}", warning);
                Self::default()
            }
        }
    }

    /// Load a `.env` file, reporting why it could not be read
    pub fn try_load(path: &Path) -> Result<Self, EnvironmentLoadWarning> {
        let contents = std::fs::read_to_string(path).map_err(|source| {
            let path = path.display().to_string();
            if source.kind() == std::io::ErrorKind::NotFound {
                EnvironmentLoadWarning::NotFound(path)
            } else {
                EnvironmentLoadWarning::Unreadable { path, source }
            }
        })?;

        Ok(Self::parse(&contents))
    }

    /// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped, an
    /// `export ` prefix is allowed and matching quotes around values are removed.
    pub fn parse(contents: &str) -> Self {
        let values = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let line = line.strip_prefix("export ").unwrap_or(line);
                let (key, value) = line.split_once('=')?;

                Some((key.trim().to_string(), unquote(value.trim()).to_string()))
            })
            .filter(|(key, _)| !key.is_empty())
            .collect();

        Self { values }
    }

    /// Look up a credential, preferring the file over the process environment
    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|value| !value.is_empty())
    }

    /// The Hugging Face access token, if any
    pub fn hf_token(&self) -> Option<String> {
        self.get(HUGGINGFACE_TOKEN)
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }

    value
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_env_lines() {
        let credentials = Credentials::parse(
            "# hub access\nHUGGINGFACE_TOKEN=\"hf_abc\"\nexport OTHER = 'x y'\n\nBROKEN\n",
        );

        assert_eq!(credentials.get("HUGGINGFACE_TOKEN"), Some("hf_abc".to_string()));
        assert_eq!(credentials.get("OTHER"), Some("x y".to_string()));
        assert_eq!(credentials.values.len(), 2);
    }

    #[test]
    fn missing_file_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");

        let result = Credentials::try_load(&path);

        assert!(matches!(result, Err(EnvironmentLoadWarning::NotFound(_))));
        assert!(Credentials::load(&path).values.is_empty());
    }
}
