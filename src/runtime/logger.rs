//! Loggers available to interceptors and native methods.

use std::sync::{Arc, Mutex, RwLock};

/// Diagnostic sink with a plain and a one-argument form.
///
/// In the one-argument form, `{0}` in `text` is replaced by `arg`.
pub trait Logger: Send + Sync {
    fn write_line(&self, text: &str);

    fn write_line_with(&self, text: &str, arg: &str) {
        self.write_line(&text.replace("{0}", arg));
    }
}

/// Forwards to the `log` facade at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogLogger;

impl Logger for LogLogger {
    fn write_line(&self, text: &str) {
        log::info!("From Logger: {}", text);
    }
}

/// Keeps every line in memory.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Logger for MemoryLogger {
    fn write_line(&self, text: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.to_string());
    }
}

/// Holder of the logger handed to native methods.
pub struct LoggerRegistry {
    current: RwLock<Arc<dyn Logger>>,
}

impl LoggerRegistry {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            current: RwLock::new(logger),
        }
    }

    pub fn current(&self) -> Arc<dyn Logger> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn install(&self, logger: Arc<dyn Logger>) -> Arc<dyn Logger> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, logger)
    }
}

impl Default for LoggerRegistry {
    fn default() -> Self {
        Self::new(Arc::new(LogLogger))
    }
}
