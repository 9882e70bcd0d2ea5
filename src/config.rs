use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetKey, FamilyName, FamilySelector, Layout};
use crate::error::IngestError;
use crate::snapshot::Cadence;

pub const DEFAULT_CONFIG_FILE: &str = "govdata.json";

const RCRA_BASE: &str = "https://s3.amazonaws.com/rcrainfo-ftp/Production/CSV-{date}";
const ECHO_BASE: &str = "https://echo.epa.gov/files/echodownloads";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub data_root: Option<String>,
    #[serde(default)]
    pub store_root: Option<String>,
    #[serde(default)]
    pub snapshot: Option<Cadence>,
    #[serde(default)]
    pub http: Option<HttpSettings>,
    #[serde(default)]
    pub families: Vec<FamilyEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    4 * 60 * 60
}

#[derive(Debug, Deserialize, Serialize)]
pub struct FamilyEntry {
    pub name: String,
    pub store: String,
    #[serde(default)]
    pub layout: Option<Layout>,
    pub datasets: BTreeMap<String, DatasetEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum DatasetEntry {
    Shorthand(String),
    Detailed(DatasetEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntryObject {
    pub url: String,
    #[serde(default)]
    pub layout: Option<Layout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    pub key: DatasetKey,
    pub url_template: String,
    pub layout: Layout,
}

#[derive(Debug, Clone)]
pub struct FamilyConfig {
    pub name: FamilyName,
    pub store_file: String,
    pub datasets: Vec<DatasetDescriptor>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub data_root: Utf8PathBuf,
    pub store_root: Utf8PathBuf,
    pub cadence: Cadence,
    pub http: HttpSettings,
    pub families: Vec<FamilyConfig>,
}

impl ResolvedConfig {
    pub fn family(&self, name: &FamilyName) -> Option<&FamilyConfig> {
        self.families.iter().find(|family| &family.name == name)
    }

    pub fn select(
        &self,
        selector: &FamilySelector,
        keys: &[DatasetKey],
    ) -> Result<Vec<(&FamilyConfig, Vec<&DatasetDescriptor>)>, IngestError> {
        let families: Vec<&FamilyConfig> = match selector {
            FamilySelector::All => self.families.iter().collect(),
            FamilySelector::Named(name) => vec![
                self.family(name)
                    .ok_or_else(|| IngestError::UnknownFamily(name.to_string()))?,
            ],
        };

        for key in keys {
            let known = families
                .iter()
                .any(|family| family.datasets.iter().any(|d| &d.key == key));
            if !known {
                return Err(IngestError::UnknownDataset(key.to_string()));
            }
        }

        Ok(families
            .into_iter()
            .map(|family| {
                let datasets = family
                    .datasets
                    .iter()
                    .filter(|d| keys.is_empty() || keys.contains(&d.key))
                    .collect::<Vec<_>>();
                (family, datasets)
            })
            .filter(|(_, datasets)| !datasets.is_empty())
            .collect())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            tracing::debug!("no {DEFAULT_CONFIG_FILE} found, using built-in datasets");
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| IngestError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        let schema_version = config.schema_version.unwrap_or(1);
        if schema_version != 1 {
            return Err(IngestError::Configuration(format!(
                "unsupported schema_version {schema_version}"
            )));
        }

        let data_root = expand_home(config.data_root.as_deref().unwrap_or("~/data/gov_raw"))?;
        let store_root = expand_home(config.store_root.as_deref().unwrap_or("~/db"))?;

        let entries = if config.families.is_empty() {
            default_families()
        } else {
            config.families
        };

        let mut families: Vec<FamilyConfig> = Vec::new();
        for entry in entries {
            let family = resolve_family(entry)?;
            if families.iter().any(|known| known.name == family.name) {
                return Err(IngestError::Configuration(format!(
                    "family {} is defined twice",
                    family.name
                )));
            }
            families.push(family);
        }

        Ok(ResolvedConfig {
            schema_version,
            data_root,
            store_root,
            cadence: config.snapshot.unwrap_or_default(),
            http: config.http.unwrap_or_default(),
            families,
        })
    }
}

fn resolve_family(entry: FamilyEntry) -> Result<FamilyConfig, IngestError> {
    let name = FamilyName::new(&entry.name);
    if name.as_str().is_empty() || name.as_str() == "all" {
        return Err(IngestError::Configuration(format!(
            "invalid family name: {:?}",
            entry.name
        )));
    }
    if entry.store.trim().is_empty() || entry.store.contains(['/', '\\']) {
        return Err(IngestError::Configuration(format!(
            "family {name}: store must be a plain file name"
        )));
    }
    let family_layout = entry.layout.unwrap_or(Layout::Subdirectories);

    let datasets = entry
        .datasets
        .into_iter()
        .map(|(key, dataset)| {
            let key: DatasetKey = key.parse()?;
            let (url_template, layout) = match dataset {
                DatasetEntry::Shorthand(url) => (url, family_layout),
                DatasetEntry::Detailed(obj) => (obj.url, obj.layout.unwrap_or(family_layout)),
            };
            if !(url_template.starts_with("http://") || url_template.starts_with("https://")) {
                return Err(IngestError::Configuration(format!(
                    "dataset {key}: url must be http(s): {url_template}"
                )));
            }
            Ok(DatasetDescriptor {
                key,
                url_template,
                layout,
            })
        })
        .collect::<Result<Vec<_>, IngestError>>()?;

    Ok(FamilyConfig {
        name,
        store_file: entry.store,
        datasets,
    })
}

fn expand_home(raw: &str) -> Result<Utf8PathBuf, IngestError> {
    let Some(rest) = raw.strip_prefix('~') else {
        return Ok(Utf8PathBuf::from(raw));
    };
    let home = directories::BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
        .ok_or_else(|| {
            IngestError::Configuration("unable to resolve home directory".to_string())
        })?;
    Ok(home.join(rest.trim_start_matches(['/', '\\'])))
}

pub fn default_families() -> Vec<FamilyEntry> {
    let rcra = [
        ("hd", "Handler/HD.zip"),
        ("ce", "Compliance,%20Monitoring%20and%20Enforcement/CE.zip"),
        ("ca", "Corrective%20Action/CA.zip"),
        ("br", "Biennial%20Report/BR.zip"),
        ("em", "eManifest/EM.zip"),
        ("fa", "Financial%20Assurance/FA.zip"),
        ("pm", "Permitting/PM.zip"),
    ];
    let echo = [
        ("air", format!("{ECHO_BASE}/ICIS-AIR_downloads.zip")),
        ("water", format!("{ECHO_BASE}/npdes_downloads.zip")),
        ("rcra", format!("{ECHO_BASE}/rcra_downloads.zip")),
        ("rcra_viol", format!("{ECHO_BASE}/pipeline_rcra_downloads.zip")),
        (
            "frs",
            "https://ordsext.epa.gov/FLA/www3/state_files/national_combined.zip".to_string(),
        ),
    ];

    vec![
        FamilyEntry {
            name: "rcrainfo".to_string(),
            store: "rcrainfo.duckdb".to_string(),
            layout: Some(Layout::Subdirectories),
            datasets: rcra
                .into_iter()
                .map(|(key, path)| {
                    (
                        key.to_string(),
                        DatasetEntry::Shorthand(format!("{RCRA_BASE}/{path}")),
                    )
                })
                .collect(),
        },
        FamilyEntry {
            name: "echo".to_string(),
            store: "echo.duckdb".to_string(),
            layout: Some(Layout::FilePerTable),
            datasets: echo
                .into_iter()
                .map(|(key, url)| (key.to_string(), DatasetEntry::Shorthand(url)))
                .collect(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_both_families() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.schema_version, 1);
        let names = resolved
            .families
            .iter()
            .map(|family| family.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["rcrainfo", "echo"]);
        assert_eq!(resolved.families[0].datasets.len(), 7);
        assert!(
            resolved.families[0]
                .datasets
                .iter()
                .all(|d| d.url_template.contains("{date}"))
        );
        assert!(
            resolved.families[1]
                .datasets
                .iter()
                .all(|d| d.layout == Layout::FilePerTable)
        );
    }
}
