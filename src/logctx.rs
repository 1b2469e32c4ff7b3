//! Logging context handed to each pipeline component at construction.
//!
//! Components log through `log` with the target carried here, so a single region can be
//! filtered with e.g. `RUST_LOG=roi_recorder::roi1=debug`.

#[derive(Clone, Debug)]
pub struct LogContext {
    target: String,
}

impl LogContext {
    /// Context for session-wide components (dispatcher, sources).
    pub fn session() -> Self {
        Self {
            target: "roi_recorder::session".to_string(),
        }
    }

    /// Context for everything owned by region `idx`.
    pub fn for_region(idx: usize) -> Self {
        Self {
            target: format!("roi_recorder::roi{}", idx),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl Default for LogContext {
    fn default() -> Self {
        Self::session()
    }
}
