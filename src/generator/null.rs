use std::sync::Arc;

use image::RgbaImage;

use crate::error::{GenError, Result};
use crate::params::ParameterProvider;
use crate::runner::EventEmitter;

use super::{GeneratorShared, GeneratorState, UrlPrompter};

/// The "no service" generator. Always connectable, never generates —
/// selecting it turns the editor's generation features off cleanly while
/// leaving everything else usable.
pub struct NullGenerator {
    shared: Arc<GeneratorShared>,
}

impl NullGenerator {
    pub fn new(params: Arc<dyn ParameterProvider>) -> Self {
        Self {
            shared: GeneratorShared::new(params),
        }
    }

    pub(crate) fn shared(&self) -> &GeneratorShared {
        &self.shared
    }

    pub async fn is_available(&self) -> (bool, Option<String>) {
        (true, None)
    }

    pub async fn connect(&self, _prompter: &dyn UrlPrompter) -> Result<bool> {
        self.shared.set_state(GeneratorState::Ready);
        Ok(true)
    }

    pub async fn disconnect(&self) {
        self.shared.clear_caps();
        self.shared.set_state(GeneratorState::Disconnected);
    }

    pub async fn generate(
        &self,
        _emitter: &EventEmitter,
        _source: Option<&RgbaImage>,
        _mask: Option<&RgbaImage>,
    ) -> Result<()> {
        Err(GenError::UnsupportedOperation(
            "image generation (no backend is configured)".into(),
        ))
    }

    pub async fn cancel(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::MemoryParams;

    struct NeverPrompt;
    impl UrlPrompter for NeverPrompt {
        fn request_url(&self, _previous: &str, _error: Option<&str>) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_always_available() {
        let generator = NullGenerator::new(Arc::new(MemoryParams::new()));
        assert_eq!(generator.is_available().await, (true, None));
    }

    #[tokio::test]
    async fn test_generate_is_unsupported() {
        let generator = Arc::new(NullGenerator::new(Arc::new(MemoryParams::new())));
        generator.connect(&NeverPrompt).await.unwrap();

        let mut task = crate::runner::spawn_generation({
            let generator = Arc::clone(&generator);
            move |emitter| async move { generator.generate(&emitter, None, None).await }
        });
        let mut error = None;
        while let Some(ev) = task.next_event().await {
            match ev {
                crate::runner::GenerationEvent::Error { message } => error = Some(message),
                crate::runner::GenerationEvent::Done { .. } => break,
                _ => {}
            }
        }
        assert!(error.unwrap().contains("not supported"));
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_safe() {
        let generator = NullGenerator::new(Arc::new(MemoryParams::new()));
        generator.connect(&NeverPrompt).await.unwrap();
        generator.disconnect().await;
        generator.disconnect().await;
        assert_eq!(generator.shared().state(), GeneratorState::Disconnected);
        assert!(generator.shared().caps().is_empty());
    }
}
