use std::fmt;

use serde::Deserialize;
use serde_json::{json, Value};

use super::ConfigError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataSourceRole {
    System,
    Scheduler,
    Reporting,
}

impl DataSourceRole {
    pub const ALL: [Self; 3] = [Self::System, Self::Scheduler, Self::Reporting];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Scheduler => "scheduler",
            Self::Reporting => "reporting",
        }
    }
}

impl fmt::Display for DataSourceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection profile declared under `[[datasources]]`.
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct DataSourceConfig {
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    pub driver: String,
    pub url: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
}

impl DataSourceConfig {
    fn serves(&self, role: DataSourceRole) -> bool {
        match self.role.as_deref() {
            Some(declared) => declared.eq_ignore_ascii_case(role.as_str()),
            None => self.name.eq_ignore_ascii_case(role.as_str()),
        }
    }

    // Log-safe view; the password is never rendered.
    pub fn redacted_payload(&self) -> Value {
        json!({
            "name": self.name,
            "driver": self.driver,
            "url": self.url,
            "login": self.login,
        })
    }
}

impl fmt::Debug for DataSourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSourceConfig")
            .field("name", &self.name)
            .field("role", &self.role)
            .field("driver", &self.driver)
            .field("url", &self.url)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDataSources {
    pub system: DataSourceConfig,
    pub scheduler: DataSourceConfig,
    pub reporting: DataSourceConfig,
}

impl ResolvedDataSources {
    pub fn get(&self, role: DataSourceRole) -> &DataSourceConfig {
        match role {
            DataSourceRole::System => &self.system,
            DataSourceRole::Scheduler => &self.scheduler,
            DataSourceRole::Reporting => &self.reporting,
        }
    }

    pub fn log_payload(&self) -> Value {
        json!({
            "system": self.system.redacted_payload(),
            "scheduler": self.scheduler.redacted_payload(),
            "reporting": self.reporting.redacted_payload(),
        })
    }
}

// A single declared source serves every role; otherwise roles are matched by
// `role` (or `name`) and scheduler/reporting fall back to the system source.
pub fn resolve_data_sources(
    declared: &[DataSourceConfig],
) -> Result<ResolvedDataSources, ConfigError> {
    match declared {
        [] => Err(ConfigError::DataSource(
            "at least one data source must be declared".to_owned(),
        )),
        [only] => Ok(ResolvedDataSources {
            system: only.clone(),
            scheduler: only.clone(),
            reporting: only.clone(),
        }),
        many => {
            for role in DataSourceRole::ALL {
                let claimed = many.iter().filter(|source| source.serves(role)).count();
                if claimed > 1 {
                    return Err(ConfigError::DataSource(format!(
                        "role '{role}' is claimed by {claimed} data sources"
                    )));
                }
            }

            let find = |role: DataSourceRole| many.iter().find(|source| source.serves(role));
            let system = find(DataSourceRole::System).cloned().ok_or_else(|| {
                ConfigError::DataSource(
                    "several data sources declared but none serves the 'system' role".to_owned(),
                )
            })?;
            let scheduler = find(DataSourceRole::Scheduler)
                .cloned()
                .unwrap_or_else(|| system.clone());
            let reporting = find(DataSourceRole::Reporting)
                .cloned()
                .unwrap_or_else(|| system.clone());

            Ok(ResolvedDataSources {
                system,
                scheduler,
                reporting,
            })
        }
    }
}
