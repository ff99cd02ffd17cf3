use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::RgbaImage;
use tracing::debug;

use crate::compose::{self, MASK_FEATHER_SIGMA};
use crate::error::{GenError, Result};
use crate::generator::Generator;
use crate::params::ParameterProvider;
use crate::runner::{spawn_generation, GenerationEvent};
use crate::types::{EditMode, GenerationRequest};

/// Pixel access into the (excluded) image-editing collaborator.
pub trait EditedImageProvider: Send + Sync {
    /// RGBA8 content of the generation area.
    fn generation_area_image(&self) -> anyhow::Result<RgbaImage>;
    /// RGBA8 inpainting mask for the generation area (opaque = editable).
    fn generation_area_mask(&self) -> anyhow::Result<RgbaImage>;
}

/// Where finished images and user-visible status land. Every call happens on
/// the context driving [`GenerationController::start_and_manage_image_generation`],
/// never on a worker task.
pub trait ResultSink: Send + Sync {
    fn on_image_ready(&self, image: RgbaImage, batch_index: usize);
    fn on_status(&self, text: &str);
    fn on_error(&self, message: &str);
    /// The single completion transition back to idle, fired exactly once per
    /// job whether it succeeded, failed, or was cancelled.
    fn on_finished(&self);
}

/// Wires editor state, the active generator, the async runner, and result
/// compositing into one job lifecycle.
pub struct GenerationController {
    generator: Arc<Generator>,
    params: Arc<dyn ParameterProvider>,
    images: Arc<dyn EditedImageProvider>,
    sink: Arc<dyn ResultSink>,
    job_active: AtomicBool,
}

impl GenerationController {
    pub fn new(
        generator: Arc<Generator>,
        params: Arc<dyn ParameterProvider>,
        images: Arc<dyn EditedImageProvider>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            generator,
            params,
            images,
            sink,
            job_active: AtomicBool::new(false),
        }
    }

    pub fn generator(&self) -> &Arc<Generator> {
        &self.generator
    }

    pub fn is_generating(&self) -> bool {
        self.job_active.load(Ordering::SeqCst)
    }

    /// Run one generation job end-to-end.
    ///
    /// Builds inputs from the providers, runs the active generator on a
    /// worker task, composites each result against the original through the
    /// feathered mask, and forwards everything to the result sink. However
    /// the job ends, the sink sees its errors and exactly one `on_finished`,
    /// and the controller returns to the idle state.
    pub async fn start_and_manage_image_generation(&self) -> Result<()> {
        if self.job_active.swap(true, Ordering::SeqCst) {
            return Err(GenError::JobAlreadyRunning);
        }
        let result = self.run_job().await;
        self.job_active.store(false, Ordering::SeqCst);
        if let Err(ref e) = result {
            self.sink.on_error(&e.to_string());
        }
        self.sink.on_finished();
        result
    }

    /// Best-effort cancellation of the in-flight job, if any.
    pub async fn cancel_generation(&self) {
        if self.is_generating() {
            self.sink.on_status("Cancelling generation");
            self.generator.cancel().await;
        }
    }

    async fn run_job(&self) -> Result<()> {
        let req = GenerationRequest::from_provider(&*self.params);

        let source = if req.edit_mode.uses_source() {
            let img = self
                .images
                .generation_area_image()
                .map_err(|e| GenError::GenerationFailed(e.to_string()))?;
            Some(compose::scale_to(&img, req.width, req.height))
        } else {
            None
        };

        let (mask, compositing_base) = if req.edit_mode == EditMode::Inpaint {
            let raw = self
                .images
                .generation_area_mask()
                .map_err(|e| GenError::GenerationFailed(e.to_string()))?;
            if compose::mask_is_empty(&raw) {
                return Err(GenError::EmptyMask);
            }
            let mask = compose::scale_to(&raw, req.width, req.height);
            // Cut the feathered selection out of the source: what's left is
            // painted back over each generated image so mask edges blend
            // instead of seaming.
            let base = source.as_ref().map(|src| {
                compose::carve_out(src, &compose::feather_mask(&mask, MASK_FEATHER_SIGMA))
            });
            (Some(mask), base)
        } else {
            (None, None)
        };

        self.sink.on_status("Starting image generation");

        let mut task = spawn_generation({
            let generator = Arc::clone(&self.generator);
            let source = source.clone();
            let mask = mask.clone();
            move |emitter| async move {
                generator
                    .generate(&emitter, source.as_ref(), mask.as_ref())
                    .await
            }
        });

        // Drain events here, on the caller's own context. The worker only
        // ever touches the channel.
        while let Some(event) = task.next_event().await {
            match event {
                GenerationEvent::Status { text, .. } => self.sink.on_status(&text),
                GenerationEvent::Image { image, index } => {
                    let finished = match compositing_base.as_ref() {
                        Some(base) => {
                            let image = if image.dimensions() != base.dimensions() {
                                compose::scale_to(&image, base.width(), base.height())
                            } else {
                                image
                            };
                            compose::paint_over(base, &image)
                        }
                        None => image,
                    };
                    self.sink.on_image_ready(finished, index);
                }
                GenerationEvent::Error { message } => self.sink.on_error(&message),
                GenerationEvent::Done { success } => {
                    debug!("generation task finished, success={}", success);
                    break;
                }
            }
        }
        Ok(())
    }
}
