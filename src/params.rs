use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

use crate::types::{ControlNetUnit, EditMode, GenerationRequest};

/// Keys understood by the generation layer. The surrounding editor may store
/// any number of additional keys; these are the ones read here.
pub mod keys {
    pub const PROMPT: &str = "prompt";
    pub const NEGATIVE_PROMPT: &str = "negative_prompt";
    pub const WIDTH: &str = "generation_width";
    pub const HEIGHT: &str = "generation_height";
    pub const BATCH_SIZE: &str = "batch_size";
    pub const BATCH_COUNT: &str = "batch_count";
    pub const SAMPLER: &str = "sampler";
    pub const SCHEDULER: &str = "scheduler";
    pub const STEPS: &str = "sampling_steps";
    pub const GUIDANCE_SCALE: &str = "guidance_scale";
    pub const DENOISING_STRENGTH: &str = "denoising_strength";
    pub const SEED: &str = "seed";
    pub const LAST_SEED: &str = "last_seed";
    pub const EDIT_MODE: &str = "edit_mode";
    pub const MODEL: &str = "sd_model";
    pub const MODEL_CONFIG: &str = "model_config";
    pub const EXTENSION_MODELS: &str = "extension_models";
    pub const CONTROLNET_UNITS: &str = "controlnet_units";
    pub const SERVER_URL: &str = "server_url";
    pub const SERVER_USERNAME: &str = "server_username";
    pub const SERVER_PASSWORD: &str = "server_password";
}

/// Injected handle to the editor's settings store. Supplies every generation
/// parameter plus the active backend URL; generators also push discovered
/// option lists back through it so the UI can populate dropdowns.
pub trait ParameterProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn options(&self, key: &str) -> Vec<Value>;
    fn set_options(&self, key: &str, options: Vec<Value>);

    fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| match v {
            Value::String(s) => Some(s),
            other => other.as_str().map(String::from),
        })
    }

    fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)?.as_u64().map(|v| v as u32)
    }

    fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_f64()
    }

    fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key)?.as_i64()
    }
}

/// In-memory provider used by tests and headless tools.
#[derive(Default)]
pub struct MemoryParams {
    values: Mutex<HashMap<String, Value>>,
    options: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryParams {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParameterProvider for MemoryParams {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    fn options(&self, key: &str) -> Vec<Value> {
        self.options
            .lock()
            .ok()
            .and_then(|o| o.get(key).cloned())
            .unwrap_or_default()
    }

    fn set_options(&self, key: &str, options: Vec<Value>) {
        if let Ok(mut map) = self.options.lock() {
            map.insert(key.to_string(), options);
        }
    }
}

impl GenerationRequest {
    /// Capture a fresh request from the provider. Lenient: missing or
    /// malformed keys fall back to defaults so a half-configured editor
    /// still submits something sensible.
    pub fn from_provider(params: &dyn ParameterProvider) -> Self {
        let defaults = GenerationRequest::default();

        let seed = match params.get_i64(keys::SEED) {
            Some(s) if s >= 0 => Some(s),
            _ => None,
        };

        let edit_mode = params
            .get_str(keys::EDIT_MODE)
            .and_then(|m| EditMode::parse(&m))
            .unwrap_or(defaults.edit_mode);

        let extension_models = params
            .get(keys::EXTENSION_MODELS)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let control_units: Vec<ControlNetUnit> = params
            .get(keys::CONTROLNET_UNITS)
            .map(|v| match serde_json::from_value(v) {
                Ok(units) => units,
                Err(e) => {
                    warn!("ignoring malformed ControlNet units: {}", e);
                    Vec::new()
                }
            })
            .unwrap_or_default();

        GenerationRequest {
            prompt: params.get_str(keys::PROMPT).unwrap_or_default(),
            negative_prompt: params.get_str(keys::NEGATIVE_PROMPT).unwrap_or_default(),
            width: params.get_u32(keys::WIDTH).unwrap_or(defaults.width),
            height: params.get_u32(keys::HEIGHT).unwrap_or(defaults.height),
            batch_size: params
                .get_u32(keys::BATCH_SIZE)
                .unwrap_or(defaults.batch_size)
                .max(1),
            batch_count: params
                .get_u32(keys::BATCH_COUNT)
                .unwrap_or(defaults.batch_count)
                .max(1),
            sampler: params.get_str(keys::SAMPLER).unwrap_or_default(),
            scheduler: params.get_str(keys::SCHEDULER).unwrap_or_default(),
            steps: params.get_u32(keys::STEPS).unwrap_or(defaults.steps),
            guidance_scale: params
                .get_f64(keys::GUIDANCE_SCALE)
                .unwrap_or(defaults.guidance_scale),
            denoising_strength: params
                .get_f64(keys::DENOISING_STRENGTH)
                .unwrap_or(defaults.denoising_strength),
            seed,
            edit_mode,
            checkpoint: params.get_str(keys::MODEL).unwrap_or_default(),
            extension_models,
            control_units,
            model_config: params.get_str(keys::MODEL_CONFIG).filter(|s| !s.is_empty()),
        }
    }
}
