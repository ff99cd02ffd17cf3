use std::future::Future;

use image::RgbaImage;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Notification produced by a generation job.
///
/// `Status` and `Image` may arrive any number of times, in the order the
/// worker produced them. `Error` carries the failure message when the job's
/// future returns an error. Exactly one `Done` is delivered per task, always,
/// after every other event.
#[derive(Debug)]
pub enum GenerationEvent {
    Status { text: String, percent: Option<f32> },
    Image { image: RgbaImage, index: usize },
    Error { message: String },
    Done { success: bool },
}

/// Handle the worker uses to report progress and results. Events are queued
/// on a channel and drained by the caller's own context — worker code never
/// touches UI state directly.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::UnboundedSender<GenerationEvent>,
}

impl EventEmitter {
    pub fn status(&self, text: impl Into<String>, percent: Option<f32>) {
        let _ = self.tx.send(GenerationEvent::Status {
            text: text.into(),
            percent,
        });
    }

    pub fn image(&self, image: RgbaImage, index: usize) {
        let _ = self.tx.send(GenerationEvent::Image { image, index });
    }
}

/// A running generation job and its event stream.
pub struct GenerationTask {
    events: mpsc::UnboundedReceiver<GenerationEvent>,
    handle: JoinHandle<()>,
}

impl GenerationTask {
    /// Receive the next event. `None` after `Done` has been consumed and the
    /// channel closed.
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run a generation job on a worker task.
///
/// The job receives an [`EventEmitter`] for incremental status/image
/// notifications. Whatever happens inside — success, error return, any number
/// of emitted events — the task finishes with exactly one `Done` event,
/// preceded by an `Error` event when the job failed.
pub fn spawn_generation<F, Fut>(job: F) -> GenerationTask
where
    F: FnOnce(EventEmitter) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let emitter = EventEmitter { tx: tx.clone() };

    let handle = tokio::spawn(async move {
        let success = match job(emitter).await {
            Ok(()) => true,
            Err(e) => {
                let _ = tx.send(GenerationEvent::Error {
                    message: e.to_string(),
                });
                false
            }
        };
        let _ = tx.send(GenerationEvent::Done { success });
    });

    GenerationTask { events: rx, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenError;

    async fn collect(mut task: GenerationTask) -> Vec<GenerationEvent> {
        let mut events = Vec::new();
        while let Some(ev) = task.next_event().await {
            let done = matches!(ev, GenerationEvent::Done { .. });
            events.push(ev);
            if done {
                break;
            }
        }
        events
    }

    #[tokio::test]
    async fn test_successful_job_emits_done() {
        let task = spawn_generation(|emitter| async move {
            emitter.status("working", Some(50.0));
            Ok(())
        });
        let events = collect(task).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], GenerationEvent::Status { .. }));
        assert!(matches!(events[1], GenerationEvent::Done { success: true }));
    }

    #[tokio::test]
    async fn test_failed_job_emits_error_then_done() {
        let task = spawn_generation(|_| async move { Err(GenError::EmptyMask) });
        let events = collect(task).await;
        assert_eq!(events.len(), 2);
        match &events[0] {
            GenerationEvent::Error { message } => {
                assert!(message.contains("mask"), "unexpected message: {}", message)
            }
            other => panic!("expected Error, got {:?}", other),
        }
        assert!(matches!(events[1], GenerationEvent::Done { success: false }));
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let task = spawn_generation(|emitter| async move {
            for i in 0..5 {
                emitter.status(format!("step {}", i), Some(i as f32 * 20.0));
            }
            emitter.image(RgbaImage::new(2, 2), 0);
            Ok(())
        });
        let events = collect(task).await;
        assert_eq!(events.len(), 7);
        for (i, ev) in events.iter().take(5).enumerate() {
            match ev {
                GenerationEvent::Status { text, .. } => {
                    assert_eq!(text, &format!("step {}", i))
                }
                other => panic!("expected Status, got {:?}", other),
            }
        }
        assert!(matches!(events[5], GenerationEvent::Image { index: 0, .. }));
        assert!(matches!(events[6], GenerationEvent::Done { success: true }));
    }

    #[tokio::test]
    async fn test_exactly_one_done_per_task() {
        let task = spawn_generation(|emitter| async move {
            emitter.status("a", None);
            emitter.status("b", None);
            Ok(())
        });
        let events = collect(task).await;
        let done_count = events
            .iter()
            .filter(|e| matches!(e, GenerationEvent::Done { .. }))
            .count();
        assert_eq!(done_count, 1);
    }
}
