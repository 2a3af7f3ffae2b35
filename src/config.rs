use ini::{Ini, ParseOption};
use log::debug;
use std::{
    fs, io,
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

const SECTION: &str = "Okapi";

/// Connection settings for an Okapi gateway, read from the `[Okapi]` section of an INI file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub okapi_url: String,
    pub tenant_id: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub requests_per_second: NonZeroU32,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {} not found: {source}", .path.display())]
    NotFound { path: PathBuf, source: io::Error },
    #[error("could not read config file {}: {source}", .path.display())]
    Unreadable { path: PathBuf, source: io::Error },
    #[error("config file {} has no section header before line {line}: {content:?}", .path.display())]
    MissingSectionHeader { path: PathBuf, line: usize, content: String },
    #[error("could not parse config file {}: {source}", .path.display())]
    Syntax { path: PathBuf, source: ini::ParseError },
    #[error("config file {} has no [Okapi] section", .path.display())]
    MissingSection { path: PathBuf },
    #[error("config file {} is missing the {key} key in [Okapi]", .path.display())]
    MissingKey { path: PathBuf, key: &'static str },
    #[error("invalid value {value:?} for {key} in [Okapi]")]
    InvalidValue { key: &'static str, value: String },
}

impl ConfigError {
    /// Process exit code for this kind of config problem.
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::NotFound { .. } | ConfigError::Unreadable { .. } => 1,
            ConfigError::MissingSectionHeader { .. } => 2,
            _ => 3,
        }
    }
}

impl Config {
    /// Read and validate the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| {
            let path = path.to_owned();
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound { path, source }
            } else {
                ConfigError::Unreadable { path, source }
            }
        })?;
        debug!("read config from {}", path.display());
        Self::parse(path, &contents)
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        check_section_header(path, contents)?;
        // Values are taken exactly as written: no quote stripping, no backslash escapes
        let options = ParseOption { enabled_quote: false, enabled_escape: false };
        let ini = Ini::load_from_str_opt(contents, options)
            .map_err(|source| ConfigError::Syntax { path: path.to_owned(), source })?;
        let section = ini.section(Some(SECTION)).ok_or_else(|| ConfigError::MissingSection { path: path.to_owned() })?;
        let required = |key: &'static str| {
            section
                .get(key)
                .map(str::to_owned)
                .ok_or_else(|| ConfigError::MissingKey { path: path.to_owned(), key })
        };
        Ok(Self {
            okapi_url: required("okapi_url")?,
            tenant_id: required("tenant_id")?,
            username: required("username")?,
            password: required("password")?,
            timeout: Duration::from_secs(optional(section.get("timeout_secs"), "timeout_secs", 30)?),
            max_retries: optional(section.get("max_retries"), "max_retries", 2)?,
            requests_per_second: optional(
                section.get("requests_per_second"),
                "requests_per_second",
                NonZeroU32::new(10).unwrap(),
            )?,
        })
    }

    /// Replace settings with values from the `OKAPI_*` environment variables, where set.
    /// `lookup` is normally `|key| std::env::var(key).ok()`.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let fields = [
            ("OKAPI_URL", &mut self.okapi_url),
            ("OKAPI_TENANT_ID", &mut self.tenant_id),
            ("OKAPI_USERNAME", &mut self.username),
            ("OKAPI_PASSWORD", &mut self.password),
        ];
        for (variable, field) in fields {
            if let Some(value) = lookup(variable) {
                debug!("{} overrides config file", variable);
                *field = value;
            }
        }
        self
    }
}

fn optional<T: std::str::FromStr>(value: Option<&str>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value: value.to_owned() }),
    }
}

/// The first line that is not blank or a comment has to open a section.
fn check_section_header(path: &Path, contents: &str) -> Result<(), ConfigError> {
    let first = contents.lines().enumerate().find(|(_, line)| {
        let line = line.trim();
        !line.is_empty() && !line.starts_with('#') && !line.starts_with(';')
    });
    match first {
        Some((index, line)) if !line.trim_start().starts_with('[') => Err(ConfigError::MissingSectionHeader {
            path: path.to_owned(),
            line: index + 1,
            content: line.to_owned(),
        }),
        _ => Ok(()),
    }
}
