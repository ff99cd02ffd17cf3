use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::RgbaImage;
use tokio::time::sleep;

use crate::error::{GenError, Result};
use crate::params::ParameterProvider;
use crate::runner::EventEmitter;
use crate::types::CapabilitySet;

use super::{clear_options, publish_options, GeneratorShared, GeneratorState, UrlPrompter};

/// Scripted behavior for a [`MockGenerator`] run.
#[derive(Clone)]
pub struct MockScript {
    /// Status lines emitted before any image.
    pub statuses: Vec<String>,
    /// Images emitted in order, with indices 0..n.
    pub images: Vec<RgbaImage>,
    /// When set, the run fails with this message after the images.
    pub fail_with: Option<String>,
    /// Pause between scripted steps; keeps cancellation observable.
    pub step_delay: Duration,
}

impl Default for MockScript {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            images: Vec::new(),
            fail_with: None,
            step_delay: Duration::from_millis(2),
        }
    }
}

impl MockScript {
    /// A script producing `count` solid-color images of the given size.
    pub fn with_images(count: usize, width: u32, height: u32) -> Self {
        Self {
            images: (0..count)
                .map(|i| {
                    RgbaImage::from_pixel(
                        width,
                        height,
                        image::Rgba([(i * 40 % 255) as u8, 120, 200, 255]),
                    )
                })
                .collect(),
            ..Self::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Test double implementing the full generator contract without a network.
/// Used by the integration tests and by UI smoke testing.
pub struct MockGenerator {
    shared: Arc<GeneratorShared>,
    script: Mutex<MockScript>,
}

impl MockGenerator {
    pub fn new(params: Arc<dyn ParameterProvider>) -> Self {
        Self {
            shared: GeneratorShared::new(params),
            script: Mutex::new(MockScript::default()),
        }
    }

    pub fn with_script(params: Arc<dyn ParameterProvider>, script: MockScript) -> Self {
        let generator = Self::new(params);
        generator.set_script(script);
        generator
    }

    pub fn set_script(&self, script: MockScript) {
        if let Ok(mut s) = self.script.lock() {
            *s = script;
        }
    }

    fn script(&self) -> MockScript {
        self.script
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub(crate) fn shared(&self) -> &GeneratorShared {
        &self.shared
    }

    pub async fn is_available(&self) -> (bool, Option<String>) {
        (true, None)
    }

    pub async fn connect(&self, _prompter: &dyn UrlPrompter) -> Result<bool> {
        let caps = CapabilitySet {
            checkpoints: vec!["mock-model.safetensors".into()],
            samplers: vec!["euler".into(), "dpmpp_2m".into()],
            schedulers: vec!["normal".into(), "karras".into()],
            ..CapabilitySet::default()
        };
        publish_options(&*self.shared.params, &caps);
        self.shared.set_caps(caps);
        self.shared.set_state(GeneratorState::Ready);
        Ok(true)
    }

    pub async fn disconnect(&self) {
        self.shared.clear_caps();
        clear_options(&*self.shared.params);
        self.shared.set_state(GeneratorState::Disconnected);
    }

    pub async fn generate(
        &self,
        emitter: &EventEmitter,
        _source: Option<&RgbaImage>,
        _mask: Option<&RgbaImage>,
    ) -> Result<()> {
        let _guard = self.shared.begin_job()?;
        let script = self.script();

        for status in &script.statuses {
            if self.shared.cancel_requested() {
                return Err(GenError::Cancelled);
            }
            emitter.status(status.clone(), None);
            sleep(script.step_delay).await;
        }
        for (index, img) in script.images.iter().enumerate() {
            if self.shared.cancel_requested() {
                return Err(GenError::Cancelled);
            }
            emitter.image(img.clone(), index);
            sleep(script.step_delay).await;
        }
        if self.shared.cancel_requested() {
            return Err(GenError::Cancelled);
        }
        match script.fail_with {
            Some(message) => Err(GenError::GenerationFailed(message)),
            None => Ok(()),
        }
    }

    pub async fn cancel(&self) {
        self.shared.request_cancel();
    }
}
