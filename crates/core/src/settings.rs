//! Process-wide settings.
//!
//! Built once at startup from defaults, a TOML file, and environment
//! overrides, then shared by `Arc`. Without an explicit path the file is
//! `cohort.toml` in the working directory, if there is one. Environment variables use the
//! uppercase field name (`ALLOTTED_TIME`, `ADMIN_PASSWORD`, ...).

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SettingsError;

/// Settings the participant's browser receives with its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublicSettings {
    pub debug_mode: bool,
    pub estimated_task_duration: String,
    pub compensation: String,
    pub experiment_title: String,
    pub experiment_name: String,
    pub version_date: String,
    pub open_tags: String,
    pub close_tags: String,
    pub stimulus_width: u32,
    pub stimulus_height: u32,
    pub num_stimuli: u32,
    pub logrocket_id: String,
    /// Milliseconds between trials.
    pub intertrial_interval: u32,
    pub slider_width: u32,
}

impl Default for PublicSettings {
    fn default() -> Self {
        Self {
            debug_mode: false,
            estimated_task_duration: "20 minutes".to_string(),
            compensation: "$3.00".to_string(),
            experiment_title: "Thesis experiment".to_string(),
            experiment_name: "thesis_experiment".to_string(),
            version_date: "2024-01-03".to_string(),
            open_tags: "[[".to_string(),
            close_tags: "]]".to_string(),
            stimulus_width: 400,
            stimulus_height: 400,
            num_stimuli: 2,
            logrocket_id: "my-cool-experiment".to_string(),
            intertrial_interval: 100,
            slider_width: 600,
        }
    }
}

/// All settings. Private fields never leave the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app_name: String,
    pub database_url: String,
    pub num_images: u32,
    pub images_per_subject: u32,
    pub shuffle: bool,
    /// Seconds a participant may stay in a working status.
    pub allotted_time: u64,
    /// Seconds between reclamation sweeps.
    pub refresh_time: u64,
    /// Condition assigned to every new participant.
    pub condition: String,
    /// `production` hides the API description endpoint.
    pub environment_type: String,
    pub admin_username: String,
    pub admin_password: String,
    #[serde(flatten)]
    pub public: PublicSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_name: "Cohort".to_string(),
            database_url: "sqlite://database.db".to_string(),
            num_images: 1,
            images_per_subject: 1,
            shuffle: true,
            allotted_time: 3600,
            refresh_time: 300,
            condition: "trustworthy".to_string(),
            environment_type: "debug".to_string(),
            admin_username: "username_to_be_set_in_cohort_toml_not_here".to_string(),
            admin_password: "password_to_be_set_in_cohort_toml_not_here".to_string(),
            public: PublicSettings::default(),
        }
    }
}

/// Where participant records live, parsed from `database_url`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    Memory,
    Sqlite(PathBuf),
}

/// Settings file picked up from the working directory when no path is given.
pub const DEFAULT_SETTINGS_FILE: &str = "cohort.toml";

impl Settings {
    /// Defaults, then `path` (or [`DEFAULT_SETTINGS_FILE`] if present), then
    /// the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let discovered = match path {
            Some(_) => None,
            None => Self::discover(Path::new(".")),
        };
        let mut settings = match path.or(discovered.as_deref()) {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// The default settings file in `dir`, if it exists.
    pub fn discover(dir: &Path) -> Option<PathBuf> {
        let candidate = dir.join(DEFAULT_SETTINGS_FILE);
        candidate.is_file().then_some(candidate)
    }

    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text).map_err(|source| SettingsError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `lookup`, which maps an uppercase field name to
    /// its value. Unset names leave the field alone.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = EnvOverrides { lookup };
        env.string("APP_NAME", &mut self.app_name);
        env.string("DATABASE_URL", &mut self.database_url);
        env.parse("NUM_IMAGES", &mut self.num_images)?;
        env.parse("IMAGES_PER_SUBJECT", &mut self.images_per_subject)?;
        env.flag("SHUFFLE", &mut self.shuffle)?;
        env.parse("ALLOTTED_TIME", &mut self.allotted_time)?;
        env.parse("REFRESH_TIME", &mut self.refresh_time)?;
        env.string("CONDITION", &mut self.condition);
        env.string("ENVIRONMENT_TYPE", &mut self.environment_type);
        env.string("ADMIN_USERNAME", &mut self.admin_username);
        env.string("ADMIN_PASSWORD", &mut self.admin_password);

        let public = &mut self.public;
        env.flag("DEBUG_MODE", &mut public.debug_mode)?;
        env.string("ESTIMATED_TASK_DURATION", &mut public.estimated_task_duration);
        env.string("COMPENSATION", &mut public.compensation);
        env.string("EXPERIMENT_TITLE", &mut public.experiment_title);
        env.string("EXPERIMENT_NAME", &mut public.experiment_name);
        env.string("VERSION_DATE", &mut public.version_date);
        env.string("OPEN_TAGS", &mut public.open_tags);
        env.string("CLOSE_TAGS", &mut public.close_tags);
        env.parse("STIMULUS_WIDTH", &mut public.stimulus_width)?;
        env.parse("STIMULUS_HEIGHT", &mut public.stimulus_height)?;
        env.parse("NUM_STIMULI", &mut public.num_stimuli)?;
        env.string("LOGROCKET_ID", &mut public.logrocket_id);
        env.parse("INTERTRIAL_INTERVAL", &mut public.intertrial_interval)?;
        env.parse("SLIDER_WIDTH", &mut public.slider_width)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.refresh_time == 0 {
            return Err(SettingsError::Invalid {
                name: "refresh_time",
                message: "must be at least 1 second".to_string(),
            });
        }
        self.storage_location()?;
        Ok(())
    }

    pub fn allotted_time(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.allotted_time).unwrap_or(i64::MAX))
    }

    pub fn refresh_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.refresh_time)
    }

    pub fn is_production(&self) -> bool {
        self.environment_type == "production"
    }

    pub fn storage_location(&self) -> Result<StorageLocation, SettingsError> {
        let url = self.database_url.trim();
        if url.is_empty() {
            return Err(SettingsError::UnsupportedDatabase(url.to_string()));
        }
        if url == "memory" || url == ":memory:" || url == "sqlite://:memory:" {
            return Ok(StorageLocation::Memory);
        }
        if let Some(path) = url.strip_prefix("sqlite://") {
            // sqlite:///abs/path keeps its leading slash.
            return Ok(StorageLocation::Sqlite(PathBuf::from(path)));
        }
        if url.contains("://") {
            return Err(SettingsError::UnsupportedDatabase(url.to_string()));
        }
        Ok(StorageLocation::Sqlite(PathBuf::from(url)))
    }
}

struct EnvOverrides<F> {
    lookup: F,
}

impl<F> EnvOverrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&mut self, name: &str, field: &mut String) {
        if let Some(value) = (self.lookup)(name) {
            *field = value;
        }
    }

    fn parse<T: FromStr>(&mut self, name: &str, field: &mut T) -> Result<(), SettingsError> {
        if let Some(value) = (self.lookup)(name) {
            *field = value
                .trim()
                .parse()
                .map_err(|_| SettingsError::InvalidEnv {
                    name: name.to_string(),
                    value,
                })?;
        }
        Ok(())
    }

    fn flag(&mut self, name: &str, field: &mut bool) -> Result<(), SettingsError> {
        if let Some(value) = (self.lookup)(name) {
            *field = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(SettingsError::InvalidEnv {
                        name: name.to_string(),
                        value,
                    })
                }
            };
        }
        Ok(())
    }
}
