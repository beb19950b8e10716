use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::storage::KeyValueStore;
use crate::config::SETTINGS_KEY;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            model: "Llama-3.1-8B-Instruct-q4f32_1-MLC".to_string(),
            api_key: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: 1.0,
            max_tokens: None,
        }
    }
}

impl AppSettings {
    /// Apply `MURMUR_*` overrides looked up through `var`.
    pub fn with_overrides<F>(mut self, var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(base_url) = var("MURMUR_BASE_URL") {
            self.base_url = base_url;
        }
        if let Some(model) = var("MURMUR_MODEL") {
            self.model = model;
        }
        if let Some(api_key) = var("MURMUR_API_KEY") {
            self.api_key = Some(api_key);
        }
        self
    }

    /// Temperature to send, or `None` to leave the engine default in place.
    pub fn request_temperature(&self) -> Option<f32> {
        if (self.temperature - 1.0).abs() < f32::EPSILON {
            None
        } else {
            Some(self.temperature)
        }
    }
}

pub struct SettingsService;

impl SettingsService {
    pub fn load(store: &dyn KeyValueStore) -> AppSettings {
        match store.get(SETTINGS_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed settings: {}", e);
                AppSettings::default()
            }),
            Ok(None) => AppSettings::default(),
            Err(e) => {
                tracing::warn!("Failed to read settings: {}", e);
                AppSettings::default()
            }
        }
    }

    pub fn save(store: &dyn KeyValueStore, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        store.set(SETTINGS_KEY, &json)?;
        Ok(())
    }
}
