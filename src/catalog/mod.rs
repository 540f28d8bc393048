use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::logging::{LogLevel, Logger};

pub const DEFINITION_FILE_EXTENSION: &str = "toml";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ReportParameter {
    pub name: String,
    #[serde(rename = "type", default = "default_parameter_type")]
    pub kind: String,
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default = "default_span")]
    pub span: u32,
}

fn default_parameter_type() -> String {
    "string".to_owned()
}

fn default_span() -> u32 {
    1
}

/// One deployed report. Translations map locale to original text to
/// translated text and apply to the name and parameter descriptions.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ReportDefinition {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub number_of_columns: u32,
    #[serde(default)]
    pub parameters: Vec<ReportParameter>,
    #[serde(default)]
    pub translations: BTreeMap<String, BTreeMap<String, String>>,
}

impl ReportDefinition {
    fn translations_for(&self, locale: &str) -> Option<&BTreeMap<String, String>> {
        let normalized = locale.replace('-', "_");
        self.translations.get(&normalized).or_else(|| {
            let language = normalized.split('_').next()?;
            self.translations.get(language)
        })
    }

    pub fn localized(&self, locale: &str) -> Self {
        let Some(texts) = self.translations_for(locale) else {
            return self.clone();
        };
        let translate = |raw: &str| texts.get(raw).cloned().unwrap_or_else(|| raw.to_owned());

        let mut localized = self.clone();
        localized.name = translate(&self.name);
        for parameter in &mut localized.parameters {
            parameter.description = translate(&parameter.description);
        }
        localized
    }
}

pub trait ReportCatalog: Send + Sync {
    fn list_report_ids(&self) -> Vec<Uuid>;
    fn get_definition(&self, report_id: Uuid, locale: &str) -> Option<ReportDefinition>;
}

#[derive(Debug)]
pub enum CatalogError {
    ReadDirectory {
        path: PathBuf,
        source: std::io::Error,
    },
    ReadDefinition {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseDefinition {
        path: PathBuf,
        source: toml::de::Error,
    },
    InvalidDefinition {
        path: PathBuf,
        reason: String,
    },
    DuplicateReport {
        report_id: Uuid,
        path: PathBuf,
    },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadDirectory { path, source } => write!(
                f,
                "failed to read report definitions directory '{}': {source}",
                path.display()
            ),
            Self::ReadDefinition { path, source } => write!(
                f,
                "failed to read report definition '{}': {source}",
                path.display()
            ),
            Self::ParseDefinition { path, source } => write!(
                f,
                "failed to parse report definition '{}': {source}",
                path.display()
            ),
            Self::InvalidDefinition { path, reason } => write!(
                f,
                "invalid report definition '{}': {reason}",
                path.display()
            ),
            Self::DuplicateReport { report_id, path } => write!(
                f,
                "report '{report_id}' from '{}' is already deployed",
                path.display()
            ),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Definitions deployed from `*.toml` files. A redeploy swaps the whole
/// map; readers keep the snapshot they started with.
pub struct DirectoryCatalog {
    directory: Option<PathBuf>,
    definitions: RwLock<Arc<HashMap<Uuid, ReportDefinition>>>,
}

impl DirectoryCatalog {
    pub fn load(directory: &Path, logger: &Logger) -> Result<Self, CatalogError> {
        let definitions = scan_directory(directory, logger)?;
        logger.log(
            LogLevel::Info,
            Some("catalog::load"),
            "Report catalog loaded",
            Some(json!({
                "path": directory.display().to_string(),
                "reports": definitions.len(),
            })),
        );
        Ok(Self {
            directory: Some(directory.to_path_buf()),
            definitions: RwLock::new(Arc::new(definitions)),
        })
    }

    pub fn from_definitions(definitions: Vec<ReportDefinition>) -> Self {
        Self {
            directory: None,
            definitions: RwLock::new(Arc::new(
                definitions
                    .into_iter()
                    .map(|definition| (definition.id, definition))
                    .collect(),
            )),
        }
    }

    /// Rescans the definitions directory. On any error the deployed set is
    /// left untouched. Returns the number of deployed reports.
    pub fn redeploy(&self, logger: &Logger) -> Result<usize, CatalogError> {
        let Some(directory) = &self.directory else {
            return Ok(self.snapshot().len());
        };
        let scanned = scan_directory(directory, logger)?;
        let previous = self.snapshot();
        let added = scanned.keys().filter(|id| !previous.contains_key(*id)).count();
        let removed = previous.keys().filter(|id| !scanned.contains_key(*id)).count();
        let changed = scanned
            .iter()
            .filter(|(id, definition)| previous.get(*id).is_some_and(|old| old != *definition))
            .count();
        let deployed = scanned.len();

        if added + removed + changed > 0 {
            logger.log(
                LogLevel::Info,
                Some("catalog::redeploy"),
                "Report catalog redeployed",
                Some(json!({
                    "path": directory.display().to_string(),
                    "reports": deployed,
                    "added": added,
                    "removed": removed,
                    "changed": changed,
                })),
            );
        }
        *self
            .definitions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(scanned);
        Ok(deployed)
    }

    fn snapshot(&self) -> Arc<HashMap<Uuid, ReportDefinition>> {
        let definitions = self
            .definitions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&*definitions)
    }
}

// A missing directory yields an empty set.
fn scan_directory(
    directory: &Path,
    logger: &Logger,
) -> Result<HashMap<Uuid, ReportDefinition>, CatalogError> {
    if !directory.exists() {
        logger.log(
            LogLevel::Warn,
            Some("catalog::load"),
            "Report definitions directory does not exist; catalog is empty",
            Some(json!({ "path": directory.display().to_string() })),
        );
        return Ok(HashMap::new());
    }

    let entries = fs::read_dir(directory).map_err(|source| CatalogError::ReadDirectory {
        path: directory.to_path_buf(),
        source,
    })?;
    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| CatalogError::ReadDirectory {
            path: directory.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some(DEFINITION_FILE_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut definitions = HashMap::new();
    for path in paths {
        let definition = load_definition(&path)?;
        let report_id = definition.id;
        logger.log(
            LogLevel::Debug,
            Some("catalog::load"),
            "Report definition deployed",
            Some(json!({
                "report_id": report_id.to_string(),
                "name": definition.name,
                "parameters": definition.parameters.len(),
                "path": path.display().to_string(),
            })),
        );
        if definitions.insert(report_id, definition).is_some() {
            return Err(CatalogError::DuplicateReport { report_id, path });
        }
    }
    Ok(definitions)
}

fn load_definition(path: &Path) -> Result<ReportDefinition, CatalogError> {
    let raw = fs::read_to_string(path).map_err(|source| CatalogError::ReadDefinition {
        path: path.to_path_buf(),
        source,
    })?;
    let definition: ReportDefinition =
        toml::from_str(&raw).map_err(|source| CatalogError::ParseDefinition {
            path: path.to_path_buf(),
            source,
        })?;

    if definition.name.trim().is_empty() {
        return Err(CatalogError::InvalidDefinition {
            path: path.to_path_buf(),
            reason: "name must not be empty".to_owned(),
        });
    }
    if let Some(parameter) = definition.parameters.iter().find(|p| p.span == 0) {
        return Err(CatalogError::InvalidDefinition {
            path: path.to_path_buf(),
            reason: format!("parameter '{}' must span at least one column", parameter.name),
        });
    }

    Ok(definition)
}

impl ReportCatalog for DirectoryCatalog {
    fn list_report_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.snapshot().keys().copied().collect();
        ids.sort();
        ids
    }

    fn get_definition(&self, report_id: Uuid, locale: &str) -> Option<ReportDefinition> {
        self.snapshot()
            .get(&report_id)
            .map(|definition| definition.localized(locale))
    }
}

#[cfg(test)]
pub(crate) fn sample_definition(name: &str) -> ReportDefinition {
    ReportDefinition {
        id: Uuid::new_v4(),
        name: name.to_owned(),
        number_of_columns: 2,
        parameters: vec![ReportParameter {
            name: "from".to_owned(),
            kind: "timestamp".to_owned(),
            index: 0,
            description: "Start date".to_owned(),
            default_value: None,
            depends_on: None,
            span: 1,
        }],
        translations: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use uuid::Uuid;

    use crate::logging::quiet_logger;

    use super::{CatalogError, DirectoryCatalog, ReportCatalog};

    const REPORT_ID: &str = "5a0e3c7a-0d7a-4c3e-9d55-9cb7c4bb2a01";

    fn unique_temp_dir(label: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "reportd-catalog-test-{label}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        fs::create_dir_all(&path).expect("temp dir should be created");
        path
    }

    fn write_definition(dir: &PathBuf, file: &str, body: &str) {
        fs::write(dir.join(file), body).expect("definition should be written");
    }

    fn alarm_history() -> String {
        format!(
            r#"
id = "{REPORT_ID}"
name = "Alarm history"
number_of_columns = 4

[[parameters]]
name = "from"
type = "timestamp"
index = 0
description = "Start date"

[[parameters]]
name = "object"
type = "object"
index = 1
description = "Source object"
depends_on = "from"
span = 2

[translations.de]
"Alarm history" = "Alarmverlauf"
"Start date" = "Startdatum"
"#
        )
    }

    #[test]
    fn loads_definitions_and_translates_per_locale() {
        let dir = unique_temp_dir("load");
        write_definition(&dir, "alarms.toml", &alarm_history());
        write_definition(&dir, "notes.txt", "ignored");

        let catalog = DirectoryCatalog::load(&dir, &quiet_logger()).expect("catalog should load");
        let report_id = Uuid::parse_str(REPORT_ID).expect("uuid should parse");
        assert_eq!(catalog.list_report_ids(), vec![report_id]);

        let english = catalog
            .get_definition(report_id, "en")
            .expect("definition should exist");
        assert_eq!(english.name, "Alarm history");
        assert_eq!(english.parameters[1].span, 2);
        assert_eq!(english.parameters[1].depends_on.as_deref(), Some("from"));

        let german = catalog
            .get_definition(report_id, "de_AT")
            .expect("definition should exist");
        assert_eq!(german.name, "Alarmverlauf");
        assert_eq!(german.parameters[0].description, "Startdatum");
        assert_eq!(german.parameters[1].description, "Source object");

        assert!(catalog.get_definition(Uuid::new_v4(), "en").is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn missing_directory_is_an_empty_catalog() {
        let dir = std::env::temp_dir().join(format!("reportd-catalog-missing-{}", Uuid::new_v4()));
        let catalog = DirectoryCatalog::load(&dir, &quiet_logger()).expect("catalog should load");
        assert!(catalog.list_report_ids().is_empty());
    }

    #[test]
    fn redeploy_picks_up_changes_and_keeps_old_set_on_errors() {
        let dir = unique_temp_dir("redeploy");
        let logger = quiet_logger();
        let catalog = DirectoryCatalog::load(&dir, &logger).expect("catalog should load");
        assert!(catalog.list_report_ids().is_empty());

        write_definition(&dir, "alarms.toml", &alarm_history());
        assert_eq!(catalog.redeploy(&logger).expect("redeploy should work"), 1);
        let report_id = Uuid::parse_str(REPORT_ID).expect("uuid should parse");
        assert_eq!(catalog.list_report_ids(), vec![report_id]);

        write_definition(
            &dir,
            "alarms.toml",
            &alarm_history().replace("name = \"Alarm history\"", "name = \"Alarm log\""),
        );
        catalog.redeploy(&logger).expect("redeploy should work");
        assert_eq!(
            catalog
                .get_definition(report_id, "en")
                .expect("definition should exist")
                .name,
            "Alarm log"
        );

        write_definition(&dir, "broken.toml", "id = 12");
        assert!(matches!(
            catalog.redeploy(&logger),
            Err(CatalogError::ParseDefinition { .. })
        ));
        assert_eq!(catalog.list_report_ids(), vec![report_id]);

        fs::remove_file(dir.join("broken.toml")).expect("broken definition should be removed");
        fs::remove_file(dir.join("alarms.toml")).expect("definition should be removed");
        assert_eq!(catalog.redeploy(&logger).expect("redeploy should work"), 0);
        assert!(catalog.get_definition(report_id, "en").is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn rejects_duplicate_and_invalid_definitions() {
        let dir = unique_temp_dir("duplicate");
        write_definition(&dir, "a.toml", &alarm_history());
        write_definition(&dir, "b.toml", &alarm_history());
        assert!(matches!(
            DirectoryCatalog::load(&dir, &quiet_logger()),
            Err(CatalogError::DuplicateReport { .. })
        ));
        let _ = fs::remove_dir_all(&dir);

        let dir = unique_temp_dir("invalid");
        write_definition(
            &dir,
            "zero-span.toml",
            &format!(
                "id = \"{REPORT_ID}\"\nname = \"x\"\n[[parameters]]\nname = \"p\"\nspan = 0\n"
            ),
        );
        assert!(matches!(
            DirectoryCatalog::load(&dir, &quiet_logger()),
            Err(CatalogError::InvalidDefinition { .. })
        ));
        write_definition(&dir, "zero-span.toml", "id = 12");
        assert!(matches!(
            DirectoryCatalog::load(&dir, &quiet_logger()),
            Err(CatalogError::ParseDefinition { .. })
        ));
        let _ = fs::remove_dir_all(dir);
    }
}
