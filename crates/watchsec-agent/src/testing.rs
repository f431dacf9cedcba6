//! In-memory platform backend for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use image::{Rgba, RgbaImage};

use watchsec_protocol::MouseButton;

use crate::error::{CaptureError, InputError};
use crate::input::NamedKey;
use crate::platform::{Backend, InputSink, ScreenSource};

/// Input event recorded by the fake sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Move(i32, i32),
    Click(MouseButton),
    Key(NamedKey),
    Text(String),
    Scroll(i32),
}

/// Fake display shared between the backend and the test
#[derive(Debug)]
pub struct FakeDisplay {
    size: Mutex<(u32, u32)>,
    events: Mutex<Vec<InputEvent>>,
    captures: AtomicUsize,
    failing_captures: AtomicUsize,
    locks: AtomicUsize,
    lock_fails: AtomicBool,
}

impl FakeDisplay {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            size: Mutex::new((width, height)),
            events: Mutex::new(Vec::new()),
            captures: AtomicUsize::new(0),
            failing_captures: AtomicUsize::new(0),
            locks: AtomicUsize::new(0),
            lock_fails: AtomicBool::new(false),
        })
    }

    pub fn resize(&self, width: u32, height: u32) {
        *self.size.lock().unwrap() = (width, height);
    }

    pub fn events(&self) -> Vec<InputEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn fail_next_captures(&self, n: usize) {
        self.failing_captures.store(n, Ordering::SeqCst);
    }

    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn fail_locks(&self) {
        self.lock_fails.store(true, Ordering::SeqCst);
    }

    fn record(&self, event: InputEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Backend over a [`FakeDisplay`]
pub struct FakeBackend(pub Arc<FakeDisplay>);

struct FakeScreen(Arc<FakeDisplay>);
struct FakeInput(Arc<FakeDisplay>);

impl Backend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open_screen(&self) -> Result<Box<dyn ScreenSource>, CaptureError> {
        Ok(Box::new(FakeScreen(Arc::clone(&self.0))))
    }

    fn open_input(&self) -> Result<Box<dyn InputSink>, InputError> {
        Ok(Box::new(FakeInput(Arc::clone(&self.0))))
    }

    fn lock_session(&self) -> Result<(), InputError> {
        if self.0.lock_fails.load(Ordering::SeqCst) {
            return Err(InputError::LockFailed("not supported".to_string()));
        }
        self.0.locks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl ScreenSource for FakeScreen {
    fn capture(&mut self) -> Result<RgbaImage, CaptureError> {
        let failing = self.0.failing_captures.load(Ordering::SeqCst);
        if failing > 0 {
            self.0.failing_captures.store(failing - 1, Ordering::SeqCst);
            return Err(CaptureError::Capture("display asleep".to_string()));
        }
        self.0.captures.fetch_add(1, Ordering::SeqCst);
        let (w, h) = *self.0.size.lock().unwrap();
        Ok(RgbaImage::from_pixel(w, h, Rgba([20, 40, 60, 255])))
    }
}

impl InputSink for FakeInput {
    fn display_size(&mut self) -> Result<(u32, u32), InputError> {
        Ok(*self.0.size.lock().unwrap())
    }

    fn move_pointer(&mut self, x: i32, y: i32) -> Result<(), InputError> {
        self.0.record(InputEvent::Move(x, y));
        Ok(())
    }

    fn click(&mut self, button: MouseButton) -> Result<(), InputError> {
        self.0.record(InputEvent::Click(button));
        Ok(())
    }

    fn key_press(&mut self, key: NamedKey) -> Result<(), InputError> {
        self.0.record(InputEvent::Key(key));
        Ok(())
    }

    fn type_text(&mut self, text: &str) -> Result<(), InputError> {
        self.0.record(InputEvent::Text(text.to_string()));
        Ok(())
    }

    fn scroll(&mut self, notches: i32) -> Result<(), InputError> {
        self.0.record(InputEvent::Scroll(notches));
        Ok(())
    }
}
