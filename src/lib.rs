//! # inpaint-pipeline
//!
//! Generation job orchestration for an AI image-inpainting editor.
//!
//! The editor delegates diffusion work to interchangeable external services —
//! a ComfyUI server, an A1111/WebUI-compatible server, a GLID-3-XL process,
//! or nothing at all. This crate owns everything between "the user pressed
//! Generate" and "finished pixels land back on the canvas":
//!
//! - a uniform [`Generator`] contract over the pluggable backends
//! - protocol adapters and a node-graph workflow builder per backend family
//! - an async task runner that keeps jobs off the UI context
//! - polling/streaming completion tracking with bounded retry/backoff
//! - mask-aware compositing of results over the edited region
//! - cooperative cancellation
//!
//! Canvas rendering, undo stacks, settings UI, and file I/O live in the
//! surrounding editor and are reached only through the narrow traits in
//! [`params`] and [`orchestrator`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use inpaint_pipeline::{
//!     Generator, GenerationController, MemoryParams, MockGenerator, MockScript,
//! };
//! # use inpaint_pipeline::{EditedImageProvider, ResultSink, UrlPrompter};
//! # struct Editor;
//! # impl EditedImageProvider for Editor {
//! #     fn generation_area_image(&self) -> anyhow::Result<image::RgbaImage> {
//! #         Ok(image::RgbaImage::new(512, 512))
//! #     }
//! #     fn generation_area_mask(&self) -> anyhow::Result<image::RgbaImage> {
//! #         Ok(image::RgbaImage::from_pixel(512, 512, image::Rgba([255, 255, 255, 255])))
//! #     }
//! # }
//! # struct Ui;
//! # impl ResultSink for Ui {
//! #     fn on_image_ready(&self, _image: image::RgbaImage, _batch_index: usize) {}
//! #     fn on_status(&self, _text: &str) {}
//! #     fn on_error(&self, _message: &str) {}
//! #     fn on_finished(&self) {}
//! # }
//! # struct NoPrompt;
//! # impl UrlPrompter for NoPrompt {
//! #     fn request_url(&self, _previous: &str, _error: Option<&str>) -> Option<String> { None }
//! # }
//!
//! # async fn example() -> inpaint_pipeline::Result<()> {
//! let params = Arc::new(MemoryParams::new());
//! let generator = Arc::new(Generator::Mock(MockGenerator::with_script(
//!     params.clone(),
//!     MockScript::with_images(1, 512, 512),
//! )));
//! generator.connect(&NoPrompt).await?;
//!
//! let controller = GenerationController::new(
//!     generator,
//!     params,
//!     Arc::new(Editor),
//!     Arc::new(Ui),
//! );
//! controller.start_and_manage_image_generation().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod comfy;
pub mod compose;
pub mod error;
pub mod generator;
pub mod http;
pub mod orchestrator;
pub mod params;
pub mod prompt;
pub mod runner;
pub mod types;
pub mod webui;

pub use error::{GenError, Result};
pub use generator::{
    ComfyUiGenerator, Generator, GeneratorState, Glid3XlGenerator, GlidMode, MockGenerator,
    MockScript, NullGenerator, UrlPrompter, WebUiGenerator,
};
pub use http::WebClient;
pub use orchestrator::{EditedImageProvider, GenerationController, ResultSink};
pub use params::{keys, MemoryParams, ParameterProvider};
pub use runner::{spawn_generation, EventEmitter, GenerationEvent, GenerationTask};
pub use types::{
    CapabilitySet, ControlNetUnit, EditMode, ExtensionKind, ExtensionModelRef, GenerationRequest,
    ImageRef, JobStatus, ProgressUpdate, QueuedJob,
};
