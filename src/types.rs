use serde::{Deserialize, Serialize};

/// What the generation job is allowed to do with the source content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditMode {
    Txt2Img,
    Img2Img,
    Inpaint,
}

impl EditMode {
    /// Parse the editor's mode strings. Unknown values fall back to `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "txt2img" | "text to image" | "text-to-image" => Some(Self::Txt2Img),
            "img2img" | "image to image" | "image-to-image" => Some(Self::Img2Img),
            "inpaint" | "inpainting" => Some(Self::Inpaint),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Txt2Img => "txt2img",
            Self::Img2Img => "img2img",
            Self::Inpaint => "inpaint",
        }
    }

    /// Whether the mode reads pixels from the edited image.
    pub fn uses_source(&self) -> bool {
        !matches!(self, Self::Txt2Img)
    }
}

/// Kind of auxiliary model blended into the base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtensionKind {
    Lora,
    Hypernetwork,
}

/// An extension model reference parsed from a prompt tag or picked in the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionModelRef {
    pub name: String,
    pub strength: f64,
    pub clip_strength: f64,
    pub kind: ExtensionKind,
}

fn default_strength() -> f64 {
    1.0
}

/// One ControlNet conditioning unit. The image is a base64-encoded PNG;
/// queue-and-poll backends upload it before building the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlNetUnit {
    #[serde(alias = "module")]
    pub preprocessor: String,
    pub model: String,
    #[serde(default = "default_strength", alias = "weight")]
    pub strength: f64,
    #[serde(default)]
    pub image: Option<String>,
}

/// Everything one generation job needs, captured from the parameter provider
/// at submission time. Never mutated after submission.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub batch_count: u32,
    pub sampler: String,
    pub scheduler: String,
    pub steps: u32,
    pub guidance_scale: f64,
    pub denoising_strength: f64,
    /// `None` means "let the server pick".
    pub seed: Option<i64>,
    pub edit_mode: EditMode,
    pub checkpoint: String,
    /// Extension models selected outside the prompt text.
    pub extension_models: Vec<ExtensionModelRef>,
    pub control_units: Vec<ControlNetUnit>,
    pub model_config: Option<String>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 512,
            height: 512,
            batch_size: 1,
            batch_count: 1,
            sampler: String::new(),
            scheduler: String::new(),
            steps: 20,
            guidance_scale: 7.5,
            denoising_strength: 1.0,
            seed: None,
            edit_mode: EditMode::Txt2Img,
            checkpoint: String::new(),
            extension_models: Vec::new(),
            control_units: Vec::new(),
            model_config: None,
        }
    }
}

/// Reference to an image stored server-side by a queue-and-poll backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// Identity of a submitted job, used for all later status/interrupt calls.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    pub task_id: String,
    pub task_number: u64,
    pub seed: i64,
}

/// Where a submitted job currently sits, as read from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    /// Waiting in the queue; `queue_index` counts only earlier-submitted jobs.
    Pending { queue_index: usize },
    Active,
    Finished { outputs: Vec<ImageRef> },
    Failed { error: String },
    NotFound,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished { .. } | JobStatus::Failed { .. } | JobStatus::NotFound
        )
    }
}

/// Per-backend option lists discovered on connect and cleared on disconnect.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySet {
    pub checkpoints: Vec<String>,
    pub configs: Vec<String>,
    pub samplers: Vec<String>,
    pub schedulers: Vec<String>,
    pub loras: Vec<String>,
    pub hypernetworks: Vec<String>,
    pub controlnet_preprocessors: Vec<String>,
    pub controlnet_models: Vec<String>,
}

impl CapabilitySet {
    pub fn clear(&mut self) {
        *self = CapabilitySet::default();
    }

    pub fn is_empty(&self) -> bool {
        *self == CapabilitySet::default()
    }
}

/// Incremental progress reported over a backend's streaming channel.
/// Advisory only — never used for completion detection.
#[derive(Debug, Clone, Copy)]
pub struct ProgressUpdate {
    pub value: u32,
    pub max: u32,
}

impl ProgressUpdate {
    /// Fraction complete in `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        if self.max == 0 {
            0.0
        } else {
            (self.value as f32 / self.max as f32).clamp(0.0, 1.0)
        }
    }
}
