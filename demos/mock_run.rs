//! Drive a full inpaint job through the controller with the mock backend.
//!
//! No server required; useful for checking the event flow end-to-end.
//!
//! ```sh
//! cargo run --example mock_run
//! ```

use std::sync::Arc;

use image::{Rgba, RgbaImage};
use serde_json::json;

use inpaint_pipeline::{
    keys, EditedImageProvider, GenerationController, Generator, MemoryParams, MockGenerator,
    MockScript, ParameterProvider, ResultSink, UrlPrompter,
};

struct DemoEditor;

impl EditedImageProvider for DemoEditor {
    fn generation_area_image(&self) -> anyhow::Result<RgbaImage> {
        Ok(RgbaImage::from_pixel(64, 64, Rgba([0, 0, 200, 255])))
    }

    fn generation_area_mask(&self) -> anyhow::Result<RgbaImage> {
        let mut mask = RgbaImage::new(64, 64);
        for y in 16..48 {
            for x in 16..48 {
                mask.put_pixel(x, y, Rgba([255, 255, 255, 255]));
            }
        }
        Ok(mask)
    }
}

struct StdoutSink;

impl ResultSink for StdoutSink {
    fn on_image_ready(&self, image: RgbaImage, batch_index: usize) {
        println!("image {} ready: {}x{}", batch_index, image.width(), image.height());
    }

    fn on_status(&self, text: &str) {
        println!("status: {}", text);
    }

    fn on_error(&self, message: &str) {
        eprintln!("error: {}", message);
    }

    fn on_finished(&self) {
        println!("job finished, back to idle");
    }
}

struct NoPrompt;

impl UrlPrompter for NoPrompt {
    fn request_url(&self, _previous: &str, _error: Option<&str>) -> Option<String> {
        None
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let params = Arc::new(MemoryParams::new());
    params.set(keys::PROMPT, json!("a stone bridge over a river"));
    params.set(keys::EDIT_MODE, json!("inpaint"));
    params.set(keys::WIDTH, json!(64));
    params.set(keys::HEIGHT, json!(64));

    let mut script = MockScript::with_images(3, 64, 64);
    script.statuses = vec!["Batch 1 of 3, 0%".into(), "Batch 2 of 3, 33%".into()];

    let generator = Arc::new(Generator::Mock(MockGenerator::with_script(
        params.clone(),
        script,
    )));
    generator.connect(&NoPrompt).await?;
    println!("connected, models: {:?}", generator.capabilities().checkpoints);

    let controller = GenerationController::new(
        generator,
        params,
        Arc::new(DemoEditor),
        Arc::new(StdoutSink),
    );
    controller.start_and_manage_image_generation().await?;
    Ok(())
}
