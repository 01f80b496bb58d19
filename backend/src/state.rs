use crate::config::{PlaceholderConfig, ServiceConfig};
use crate::model::{self, Cleaner, Matcher, ModelError, ModelHandle};
use shared::{ModelStatus, ModelsResponse};
use std::path::PathBuf;
use std::time::Duration;

/// Everything request handlers need, built once at startup and shared
/// read-only across workers.
#[derive(Debug)]
pub struct AppState {
    pub cleaner: ModelHandle<dyn Cleaner>,
    pub matcher: ModelHandle<dyn Matcher>,
    pub cleaning_model_path: PathBuf,
    pub matching_model_path: PathBuf,
    pub match_threshold: f32,
    pub placeholder: PlaceholderConfig,
}

impl AppState {
    pub fn load(config: &ServiceConfig) -> Result<Self, ModelError> {
        let cleaner = model::load_cleaner(&config.models)?;
        let matcher = model::load_matcher(&config.models)?;
        Ok(Self::new(cleaner, matcher, config))
    }

    pub fn new(
        cleaner: ModelHandle<dyn Cleaner>,
        matcher: ModelHandle<dyn Matcher>,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            cleaner,
            matcher,
            cleaning_model_path: config.models.cleaning_model_path.clone(),
            matching_model_path: config.models.matching_model_path.clone(),
            match_threshold: config.match_threshold,
            placeholder: config.placeholder.clone(),
        }
    }

    pub fn log_bypass_warnings(&self) {
        if !self.cleaner.is_present() {
            log::warn!("Running in cleaning model bypass mode.");
        }
        if !self.matcher.is_present() {
            log::warn!("Running in matching model bypass mode.");
        }
    }

    pub fn clean_delay(&self) -> Duration {
        Duration::from_millis(self.placeholder.clean_delay_ms)
    }

    pub fn match_delay(&self) -> Duration {
        Duration::from_millis(self.placeholder.match_delay_ms)
    }

    pub fn model_status(&self) -> ModelsResponse {
        ModelsResponse {
            cleaner: ModelStatus {
                loaded: self.cleaner.is_present(),
                path: self.cleaning_model_path.display().to_string(),
            },
            matcher: ModelStatus {
                loaded: self.matcher.is_present(),
                path: self.matching_model_path.display().to_string(),
            },
        }
    }
}
