use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::catalog::{ArchivePathPattern, Catalog};
use crate::domain::{DateRange, Granularity, VariableName};
use crate::error::XferError;
use crate::mera::MeraConvention;
use crate::transfer::TransferOptions;
use crate::transport::{FtpOptions, SshOptions, TransportKind};

pub const DEFAULT_CONFIG_FILE: &str = "mera-xfer.json";
const SUPPORTED_SCHEMA: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub index_dir: Option<String>,
    #[serde(default)]
    pub variables: Vec<VariableEntry>,
    #[serde(default)]
    pub dates: Option<String>,
    #[serde(default)]
    pub catalog: BTreeMap<String, CatalogEntry>,
    #[serde(default)]
    pub mera_defaults: Option<bool>,
    #[serde(default)]
    pub mera_streams: Option<Vec<String>>,
    #[serde(default)]
    pub transfer: TransferSection,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum VariableEntry {
    Shorthand(String),
    Detailed(VariableEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct VariableEntryObject {
    pub name: String,
    #[serde(default)]
    pub levels: Option<Vec<Level>>,
    #[serde(default)]
    pub level_unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Level {
    Number(u32),
    Name(String),
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Number(value) => write!(f, "{value}"),
            Level::Name(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CatalogEntry {
    /// A single monthly template.
    Shorthand(String),
    Detailed(CatalogEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CatalogEntryObject {
    #[serde(default)]
    pub granularity: Option<Granularity>,
    pub patterns: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TransferSection {
    #[serde(default)]
    pub transport: Option<TransportKind>,
    #[serde(default)]
    pub remote_user: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub local_root: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub transport: TransportKind,
    pub remote_user: Option<String>,
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry_delay: Duration,
    pub local_root: Option<Utf8PathBuf>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        let options = TransferOptions::default();
        Self {
            transport: TransportKind::default(),
            remote_user: None,
            max_attempts: options.max_attempts,
            attempt_timeout: options.attempt_timeout,
            connect_timeout: SshOptions::default().connect_timeout,
            retry_delay: options.retry_delay,
            local_root: None,
        }
    }
}

impl TransferSettings {
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            max_attempts: self.max_attempts,
            attempt_timeout: self.attempt_timeout,
            retry_delay: self.retry_delay,
        }
    }

    /// The password comes from `MERA_XFER_FTP_PASSWORD`, never the config file.
    pub fn ftp_options(&self) -> FtpOptions {
        FtpOptions {
            user: self.remote_user.clone(),
            connect_timeout: self.connect_timeout,
            ..FtpOptions::default()
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            user: self.remote_user.clone(),
            connect_timeout: self.connect_timeout,
            batch_mode: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub index_dir: Option<Utf8PathBuf>,
    pub variables: Vec<VariableName>,
    pub dates: Option<DateRange>,
    pub catalog: Catalog,
    pub transfer: TransferSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `mera-xfer.json` in the working directory. A missing
    /// default file means built-in defaults; a missing explicit file is an
    /// error.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, XferError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| XferError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| XferError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, XferError> {
        let schema_version = config.schema_version.unwrap_or(SUPPORTED_SCHEMA);
        if schema_version != SUPPORTED_SCHEMA {
            return Err(XferError::InvalidConfig(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let variables = config
            .variables
            .into_iter()
            .map(expand_variable)
            .collect::<Result<Vec<_>, XferError>>()?
            .into_iter()
            .flatten()
            .collect();

        let dates = config
            .dates
            .as_deref()
            .map(str::parse::<DateRange>)
            .transpose()?;

        let mut catalog = Catalog::new();
        if config.mera_defaults.unwrap_or(true) {
            catalog = catalog.with_mera(MeraConvention::new(
                config.mera_streams.unwrap_or_default(),
            ));
        }
        for (name, entry) in config.catalog {
            let variable: VariableName = name.parse()?;
            let pattern = match entry {
                CatalogEntry::Shorthand(template) => ArchivePathPattern::from_templates(
                    Granularity::Monthly,
                    &[template],
                    &BTreeMap::new(),
                )?,
                CatalogEntry::Detailed(obj) => ArchivePathPattern::from_templates(
                    obj.granularity.unwrap_or_default(),
                    &obj.patterns,
                    &obj.fields,
                )?,
            };
            catalog.insert(variable, pattern);
        }

        Ok(ResolvedConfig {
            schema_version,
            index_dir: config.index_dir.map(Utf8PathBuf::from),
            variables,
            dates,
            catalog,
            transfer: resolve_transfer(config.transfer)?,
        })
    }
}

fn expand_variable(entry: VariableEntry) -> Result<Vec<VariableName>, XferError> {
    match entry {
        VariableEntry::Shorthand(name) => Ok(vec![name.parse()?]),
        VariableEntry::Detailed(obj) => match (obj.levels, obj.level_unit) {
            (None, _) => Ok(vec![obj.name.parse()?]),
            (Some(_), None) => Err(XferError::InvalidConfig(format!(
                "variable {} lists levels without a level_unit",
                obj.name
            ))),
            (Some(levels), Some(unit)) => levels
                .iter()
                .map(|level| format!("{}_at_{level}_{unit}", obj.name).parse())
                .collect(),
        },
    }
}

fn resolve_transfer(section: TransferSection) -> Result<TransferSettings, XferError> {
    let defaults = TransferSettings::default();
    let max_attempts = section.max_attempts.unwrap_or(defaults.max_attempts);
    if max_attempts == 0 {
        return Err(XferError::InvalidConfig(
            "transfer.max_attempts must be at least 1".to_string(),
        ));
    }
    Ok(TransferSettings {
        transport: section.transport.unwrap_or(defaults.transport),
        remote_user: section.remote_user,
        max_attempts,
        attempt_timeout: section
            .attempt_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.attempt_timeout),
        connect_timeout: section
            .connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.connect_timeout),
        retry_delay: section
            .retry_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.retry_delay),
        local_root: section.local_root.map(Utf8PathBuf::from),
    })
}
