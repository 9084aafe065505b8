//! Locale-keyed operator text.
//!
//! Tables are flat JSON objects mapping dotted keys to text. `{}` marks a
//! positional argument. Unknown keys render as the key itself.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt::Display;
use std::fs;
use std::path::Path;

const BUILTIN_EN_US: &str = include_str!("../locales/en_US.json");

#[derive(Debug, Clone, Default)]
pub struct Locale {
    texts: HashMap<String, String>,
}

impl Locale {
    /// Built-in English table.
    pub fn builtin() -> Self {
        // The embedded table is checked by `test_builtin_parses`.
        let texts = serde_json::from_str(BUILTIN_EN_US).unwrap_or_default();
        Self { texts }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let texts = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(Self { texts })
    }

    /// Built-in table unless a file is configured.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::builtin()),
        }
    }

    pub fn text<'a>(&'a self, key: &'a str) -> &'a str {
        self.texts.get(key).map(String::as_str).unwrap_or(key)
    }

    /// Text for `key` with each `{}` replaced by the next argument.
    pub fn format(&self, key: &str, args: &[&dyn Display]) -> String {
        let template = self.text(key);
        let mut out = String::with_capacity(template.len());
        let mut args = args.iter();
        let mut rest = template;
        while let Some(pos) = rest.find("{}") {
            out.push_str(&rest[..pos]);
            match args.next() {
                Some(arg) => out.push_str(&arg.to_string()),
                None => out.push_str("{}"),
            }
            rest = &rest[pos + 2..];
        }
        out.push_str(rest);
        out
    }
}
