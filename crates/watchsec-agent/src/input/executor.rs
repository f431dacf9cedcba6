//! Replays viewer commands against the OS input subsystem
//!
//! Commands are consumed in arrival order on a dedicated blocking thread,
//! so a stalled network send never delays input and vice versa.
//! Coordinates are denormalized against the display size read at execution
//! time.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use watchsec_protocol::{ConnectionId, ControlCommand};

use super::keys::NamedKey;
use crate::error::InputError;
use crate::platform::{Backend, InputSink};

/// A command queued for execution
#[derive(Debug, Clone)]
pub struct InputRequest {
    /// Viewer that issued the command
    pub viewer_id: ConnectionId,
    pub command: ControlCommand,
}

/// Map a normalized position onto a display of the given size.
///
/// Values outside `[0, 1]` are clamped to the display edge; NaN and
/// infinities are rejected.
pub fn denormalize(x: f64, y: f64, (width, height): (u32, u32)) -> Result<(i32, i32), InputError> {
    if !x.is_finite() || !y.is_finite() {
        return Err(InputError::InvalidCoordinate { x, y });
    }

    let axis = |v: f64, size: u32| -> i32 {
        let max = size.saturating_sub(1) as f64;
        (v.clamp(0.0, 1.0) * size as f64).floor().min(max) as i32
    };
    Ok((axis(x, width), axis(y, height)))
}

/// Execute one input command on a sink
pub fn execute(sink: &mut dyn InputSink, command: &ControlCommand) -> Result<(), InputError> {
    match command {
        ControlCommand::PointerMove { x, y } => {
            let (px, py) = denormalize(*x, *y, sink.display_size()?)?;
            sink.move_pointer(px, py)
        }
        ControlCommand::Click { x, y, button } => {
            let (px, py) = denormalize(*x, *y, sink.display_size()?)?;
            sink.move_pointer(px, py)?;
            sink.click(*button)
        }
        ControlCommand::KeyPress { key } => sink.key_press(NamedKey::parse(key)?),
        ControlCommand::TypeText { text } => sink.type_text(text),
        ControlCommand::Scroll { dy } => {
            if !dy.is_finite() {
                return Err(InputError::InvalidCoordinate { x: 0.0, y: *dy });
            }
            let notches = dy.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32;
            if notches == 0 {
                return Ok(());
            }
            sink.scroll(notches)
        }
        ControlCommand::Lock | ControlCommand::StartRecording | ControlCommand::StopRecording => {
            Ok(())
        }
    }
}

/// Owns the input thread
pub struct InputExecutor {
    backend: Arc<dyn Backend>,
}

impl InputExecutor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Spawn the executor on a blocking thread. It runs until every sender
    /// of `rx` is dropped.
    pub fn spawn(self, rx: mpsc::Receiver<InputRequest>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run(rx))
    }

    fn run(self, mut rx: mpsc::Receiver<InputRequest>) {
        let mut sink: Option<Box<dyn InputSink>> = None;

        while let Some(request) = rx.blocking_recv() {
            let kind = request.command.kind();
            match &request.command {
                ControlCommand::Lock => match self.backend.lock_session() {
                    Ok(()) => tracing::info!("Session locked at request of {}", request.viewer_id),
                    Err(e) => tracing::warn!("Lock requested by {} failed: {}", request.viewer_id, e),
                },
                ControlCommand::StartRecording | ControlCommand::StopRecording => {
                    tracing::debug!("Ignoring {} on the input thread", kind);
                }
                command => {
                    if sink.is_none() {
                        match self.backend.open_input() {
                            Ok(opened) => sink = Some(opened),
                            Err(e) => {
                                tracing::warn!("Skipping {}: {}", kind, e);
                                continue;
                            }
                        }
                    }
                    let Some(active) = sink.as_mut() else {
                        continue;
                    };
                    match execute(active.as_mut(), command) {
                        Ok(()) => tracing::trace!("Executed {} from {}", kind, request.viewer_id),
                        Err(e @ InputError::Backend(_)) => {
                            tracing::warn!("{} failed, reopening input: {}", kind, e);
                            sink = None;
                        }
                        Err(e) => tracing::warn!("Skipping {} from {}: {}", kind, request.viewer_id, e),
                    }
                }
            }
        }

        tracing::debug!("Input executor exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, FakeDisplay, InputEvent};
    use watchsec_protocol::MouseButton;

    fn request(command: ControlCommand) -> InputRequest {
        InputRequest {
            viewer_id: ConnectionId::new(1),
            command,
        }
    }

    #[test]
    fn test_center_maps_to_center_pixel() {
        assert_eq!(denormalize(0.5, 0.5, (1920, 1080)).unwrap(), (960, 540));
        assert_eq!(denormalize(0.5, 0.5, (1280, 720)).unwrap(), (640, 360));
    }

    #[test]
    fn test_edges_are_clamped_onto_the_display() {
        assert_eq!(denormalize(0.0, 0.0, (1920, 1080)).unwrap(), (0, 0));
        assert_eq!(denormalize(1.0, 1.0, (1920, 1080)).unwrap(), (1919, 1079));
        assert_eq!(denormalize(-0.5, 7.0, (1920, 1080)).unwrap(), (0, 1079));
    }

    #[test]
    fn test_non_finite_coordinates_rejected() {
        assert!(matches!(
            denormalize(f64::NAN, 0.5, (1920, 1080)),
            Err(InputError::InvalidCoordinate { .. })
        ));
        assert!(denormalize(0.5, f64::INFINITY, (1920, 1080)).is_err());
    }

    #[test]
    fn test_execute_click_moves_then_clicks() {
        let display = FakeDisplay::new(800, 600);
        let mut sink = FakeBackend(Arc::clone(&display)).open_input().unwrap();

        execute(
            sink.as_mut(),
            &ControlCommand::Click {
                x: 0.25,
                y: 0.5,
                button: MouseButton::Right,
            },
        )
        .unwrap();

        assert_eq!(
            display.events(),
            vec![InputEvent::Move(200, 300), InputEvent::Click(MouseButton::Right)]
        );
    }

    #[test]
    fn test_execute_keyboard_and_scroll() {
        let display = FakeDisplay::new(800, 600);
        let mut sink = FakeBackend(Arc::clone(&display)).open_input().unwrap();

        execute(sink.as_mut(), &ControlCommand::KeyPress { key: "enter".into() }).unwrap();
        execute(sink.as_mut(), &ControlCommand::TypeText { text: "hi".into() }).unwrap();
        execute(sink.as_mut(), &ControlCommand::Scroll { dy: -2.4 }).unwrap();
        execute(sink.as_mut(), &ControlCommand::Scroll { dy: 0.2 }).unwrap();

        assert_eq!(
            display.events(),
            vec![
                InputEvent::Key(NamedKey::Enter),
                InputEvent::Text("hi".to_string()),
                InputEvent::Scroll(-2),
            ]
        );

        assert!(matches!(
            execute(sink.as_mut(), &ControlCommand::KeyPress { key: "hyper".into() }),
            Err(InputError::UnknownKey(_))
        ));
    }

    #[tokio::test]
    async fn test_resolution_read_at_execution_time() {
        let display = FakeDisplay::new(1920, 1080);
        let (tx, rx) = mpsc::channel(8);
        let handle = InputExecutor::new(Arc::new(FakeBackend(Arc::clone(&display)))).spawn(rx);

        tx.send(request(ControlCommand::PointerMove { x: 0.5, y: 0.5 }))
            .await
            .unwrap();
        // Wait for the first command before changing resolution
        while display.events().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        display.resize(1280, 720);
        tx.send(request(ControlCommand::PointerMove { x: 0.5, y: 0.5 }))
            .await
            .unwrap();

        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            display.events(),
            vec![InputEvent::Move(960, 540), InputEvent::Move(640, 360)]
        );
    }

    #[tokio::test]
    async fn test_bad_commands_are_skipped() {
        let display = FakeDisplay::new(100, 100);
        display.fail_locks();
        let (tx, rx) = mpsc::channel(8);
        let handle = InputExecutor::new(Arc::new(FakeBackend(Arc::clone(&display)))).spawn(rx);

        tx.send(request(ControlCommand::PointerMove { x: f64::NAN, y: 0.1 }))
            .await
            .unwrap();
        tx.send(request(ControlCommand::Lock)).await.unwrap();
        tx.send(request(ControlCommand::KeyPress { key: "a".into() }))
            .await
            .unwrap();

        drop(tx);
        handle.await.unwrap();

        assert_eq!(display.events(), vec![InputEvent::Key(NamedKey::Char('a'))]);
        assert_eq!(display.locks(), 0);
    }

    #[tokio::test]
    async fn test_lock_goes_to_backend() {
        let display = FakeDisplay::new(100, 100);
        let (tx, rx) = mpsc::channel(8);
        let handle = InputExecutor::new(Arc::new(FakeBackend(Arc::clone(&display)))).spawn(rx);

        tx.send(request(ControlCommand::Lock)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(display.locks(), 1);
        assert!(display.events().is_empty());
    }
}
