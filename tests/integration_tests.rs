use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgba, RgbaImage};
use serde_json::json;

use inpaint_pipeline::*;

// -- Fixtures --

struct TestEditor {
    source: RgbaImage,
    mask: RgbaImage,
}

impl TestEditor {
    fn new(source: RgbaImage, mask: RgbaImage) -> Self {
        Self { source, mask }
    }
}

impl EditedImageProvider for TestEditor {
    fn generation_area_image(&self) -> anyhow::Result<RgbaImage> {
        Ok(self.source.clone())
    }

    fn generation_area_mask(&self) -> anyhow::Result<RgbaImage> {
        Ok(self.mask.clone())
    }
}

#[derive(Default)]
struct RecordingSink {
    images: Mutex<Vec<(usize, RgbaImage)>>,
    statuses: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    finished: AtomicUsize,
}

impl RecordingSink {
    fn image_indices(&self) -> Vec<usize> {
        self.images
            .lock()
            .unwrap()
            .iter()
            .map(|(i, _)| *i)
            .collect()
    }

    fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    fn finished_count(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ResultSink for RecordingSink {
    fn on_image_ready(&self, image: RgbaImage, batch_index: usize) {
        self.images.lock().unwrap().push((batch_index, image));
    }

    fn on_status(&self, text: &str) {
        self.statuses.lock().unwrap().push(text.to_string());
    }

    fn on_error(&self, message: &str) {
        self.errors.lock().unwrap().push(message.to_string());
    }

    fn on_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

struct NeverPrompt;

impl UrlPrompter for NeverPrompt {
    fn request_url(&self, _previous: &str, _error: Option<&str>) -> Option<String> {
        None
    }
}

fn solid(w: u32, h: u32, rgba: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(w, h, Rgba(rgba))
}

fn left_half_mask(w: u32, h: u32) -> RgbaImage {
    let mut mask = solid(w, h, [255, 255, 255, 0]);
    for y in 0..h {
        for x in 0..w / 2 {
            mask.put_pixel(x, y, Rgba([255, 255, 255, 255]));
        }
    }
    mask
}

fn inpaint_params(width: u32, height: u32, batch_count: u32) -> Arc<MemoryParams> {
    let params = Arc::new(MemoryParams::new());
    params.set(keys::PROMPT, json!("a test subject"));
    params.set(keys::EDIT_MODE, json!("inpaint"));
    params.set(keys::WIDTH, json!(width));
    params.set(keys::HEIGHT, json!(height));
    params.set(keys::BATCH_COUNT, json!(batch_count));
    params
}

async fn connected_mock(
    params: Arc<MemoryParams>,
    script: MockScript,
) -> Arc<Generator> {
    let generator = Arc::new(Generator::Mock(MockGenerator::with_script(params, script)));
    assert!(generator.connect(&NeverPrompt).await.unwrap());
    generator
}

fn controller(
    generator: Arc<Generator>,
    params: Arc<MemoryParams>,
    editor: TestEditor,
    sink: Arc<RecordingSink>,
) -> Arc<GenerationController> {
    Arc::new(GenerationController::new(
        generator,
        params,
        Arc::new(editor),
        sink,
    ))
}

// -- End-to-end inpaint scenario --

#[tokio::test]
async fn test_three_batch_inpaint_emits_indices_in_order() {
    let params = inpaint_params(32, 32, 3);
    let generator = connected_mock(params.clone(), MockScript::with_images(3, 32, 32)).await;
    let sink = Arc::new(RecordingSink::default());
    let editor = TestEditor::new(solid(32, 32, [0, 0, 200, 255]), left_half_mask(32, 32));
    let controller = controller(generator, params, editor, sink.clone());

    controller.start_and_manage_image_generation().await.unwrap();

    assert_eq!(sink.image_indices(), vec![0, 1, 2]);
    assert_eq!(sink.finished_count(), 1);
    assert_eq!(sink.error_count(), 0);
    assert!(!controller.is_generating());
}

#[tokio::test]
async fn test_inpaint_composites_original_outside_mask() {
    // Blue source, red generated output, left half selected: the right half
    // must come back blue, the left half red.
    let params = inpaint_params(64, 64, 1);
    let mut script = MockScript::default();
    script.images = vec![solid(64, 64, [200, 0, 0, 255])];
    let generator = connected_mock(params.clone(), script).await;
    let sink = Arc::new(RecordingSink::default());
    let editor = TestEditor::new(solid(64, 64, [0, 0, 200, 255]), left_half_mask(64, 64));
    let controller = controller(generator, params, editor, sink.clone());

    controller.start_and_manage_image_generation().await.unwrap();

    let images = sink.images.lock().unwrap();
    assert_eq!(images.len(), 1);
    let out = &images[0].1;
    // Sample far from the feathered seam at x=32; the blur makes edge pixels
    // fractional, so check channel dominance rather than exact values.
    let masked = out.get_pixel(4, 32).0;
    assert!(masked[0] > 150 && masked[2] < 50, "masked side: {:?}", masked);
    let preserved = out.get_pixel(60, 32).0;
    assert!(
        preserved[2] > 150 && preserved[0] < 50,
        "preserved side: {:?}",
        preserved
    );
    assert_eq!(masked[3], 255);
    assert_eq!(preserved[3], 255);
}

#[tokio::test]
async fn test_txt2img_passes_images_through_unchanged() {
    let params = Arc::new(MemoryParams::new());
    params.set(keys::EDIT_MODE, json!("txt2img"));
    params.set(keys::WIDTH, json!(16));
    params.set(keys::HEIGHT, json!(16));
    let generator = connected_mock(params.clone(), MockScript::with_images(1, 16, 16)).await;
    let sink = Arc::new(RecordingSink::default());
    let editor = TestEditor::new(solid(16, 16, [0, 0, 0, 255]), solid(16, 16, [0, 0, 0, 0]));
    let controller = controller(generator, params, editor, sink.clone());

    controller.start_and_manage_image_generation().await.unwrap();
    assert_eq!(sink.image_indices(), vec![0]);
    assert_eq!(sink.finished_count(), 1);
}

// -- Failure paths --

#[tokio::test]
async fn test_empty_mask_rejected_before_submission() {
    let params = inpaint_params(16, 16, 1);
    let generator = connected_mock(params.clone(), MockScript::with_images(1, 16, 16)).await;
    let sink = Arc::new(RecordingSink::default());
    // Fully transparent mask: nothing selected.
    let editor = TestEditor::new(solid(16, 16, [0, 0, 200, 255]), solid(16, 16, [255, 255, 255, 0]));
    let controller = controller(generator, params, editor, sink.clone());

    let result = controller.start_and_manage_image_generation().await;
    assert!(matches!(result, Err(GenError::EmptyMask)));
    assert_eq!(sink.error_count(), 1);
    assert_eq!(sink.finished_count(), 1);
    assert!(sink.image_indices().is_empty());
    assert!(!controller.is_generating());
}

#[tokio::test]
async fn test_backend_failure_surfaces_and_clears_loading() {
    let params = Arc::new(MemoryParams::new());
    params.set(keys::EDIT_MODE, json!("txt2img"));
    let generator = connected_mock(params.clone(), MockScript::failing("out of VRAM")).await;
    let sink = Arc::new(RecordingSink::default());
    let editor = TestEditor::new(solid(8, 8, [0, 0, 0, 255]), solid(8, 8, [0, 0, 0, 0]));
    let controller = controller(generator.clone(), params, editor, sink.clone());

    controller.start_and_manage_image_generation().await.unwrap();

    let errors = sink.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("out of VRAM"));
    assert_eq!(sink.finished_count(), 1);
    assert!(!controller.is_generating());
    // The generator returns to Ready, usable for the next job.
    assert_eq!(generator.state(), GeneratorState::Ready);
}

// -- One job at a time --

#[tokio::test]
async fn test_second_start_is_rejected_while_running() {
    let params = Arc::new(MemoryParams::new());
    params.set(keys::EDIT_MODE, json!("txt2img"));
    let mut script = MockScript::with_images(2, 8, 8);
    script.step_delay = Duration::from_millis(40);
    let generator = connected_mock(params.clone(), script).await;
    let sink = Arc::new(RecordingSink::default());
    let editor = TestEditor::new(solid(8, 8, [0, 0, 0, 255]), solid(8, 8, [0, 0, 0, 0]));
    let controller = controller(generator, params, editor, sink.clone());

    let first = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.start_and_manage_image_generation().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = controller.start_and_manage_image_generation().await;
    assert!(matches!(second, Err(GenError::JobAlreadyRunning)));

    first.await.unwrap().unwrap();
    // The rejected second call produced no extra completion transition.
    assert_eq!(sink.finished_count(), 1);
}

// -- Cancellation --

#[tokio::test]
async fn test_cancellation_reaches_terminal_state() {
    let params = Arc::new(MemoryParams::new());
    params.set(keys::EDIT_MODE, json!("txt2img"));
    let mut script = MockScript::with_images(100, 8, 8);
    script.step_delay = Duration::from_millis(10);
    let generator = connected_mock(params.clone(), script).await;
    let sink = Arc::new(RecordingSink::default());
    let editor = TestEditor::new(solid(8, 8, [0, 0, 0, 255]), solid(8, 8, [0, 0, 0, 0]));
    let controller = controller(generator.clone(), params, editor, sink.clone());

    let job = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.start_and_manage_image_generation().await })
    };
    tokio::time::sleep(Duration::from_millis(35)).await;
    controller.cancel_generation().await;

    // The worker observes the flag and terminates on its own; nothing hangs.
    job.await.unwrap().unwrap();
    assert_eq!(sink.finished_count(), 1);
    let errors = sink.errors.lock().unwrap().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("cancelled"));
    assert!(sink.images.lock().unwrap().len() < 100);
    assert!(!controller.is_generating());
    assert_eq!(generator.state(), GeneratorState::Ready);
}

// -- Connection lifecycle --

#[tokio::test]
async fn test_disconnect_twice_leaves_caches_empty() {
    let params = Arc::new(MemoryParams::new());
    let generator = connected_mock(params.clone(), MockScript::default()).await;
    assert!(!generator.capabilities().is_empty());
    assert!(!params.options(keys::MODEL).is_empty());

    generator.disconnect().await;
    assert!(generator.capabilities().is_empty());
    assert!(params.options(keys::MODEL).is_empty());
    assert_eq!(generator.state(), GeneratorState::Disconnected);

    generator.disconnect().await;
    assert!(generator.capabilities().is_empty());
    assert_eq!(generator.state(), GeneratorState::Disconnected);
}

#[tokio::test]
async fn test_connect_populates_provider_options() {
    let params = Arc::new(MemoryParams::new());
    let _generator = connected_mock(params.clone(), MockScript::default()).await;
    let models = params.options(keys::MODEL);
    assert!(models.contains(&json!("mock-model.safetensors")));
    assert!(!params.options(keys::SAMPLER).is_empty());
    assert!(!params.options(keys::SCHEDULER).is_empty());
}

// -- Status flow --

#[tokio::test]
async fn test_statuses_are_forwarded_in_order() {
    let params = Arc::new(MemoryParams::new());
    params.set(keys::EDIT_MODE, json!("txt2img"));
    let mut script = MockScript::default();
    script.statuses = vec!["Batch 1 of 2, 0%".into(), "Batch 2 of 2, 50%".into()];
    let generator = connected_mock(params.clone(), script).await;
    let sink = Arc::new(RecordingSink::default());
    let editor = TestEditor::new(solid(8, 8, [0, 0, 0, 255]), solid(8, 8, [0, 0, 0, 0]));
    let controller = controller(generator, params, editor, sink.clone());

    controller.start_and_manage_image_generation().await.unwrap();

    let statuses = sink.statuses.lock().unwrap().clone();
    let batch_lines: Vec<&String> = statuses.iter().filter(|s| s.starts_with("Batch")).collect();
    assert_eq!(batch_lines.len(), 2);
    assert_eq!(batch_lines[0], "Batch 1 of 2, 0%");
    assert_eq!(batch_lines[1], "Batch 2 of 2, 50%");
}
