//! Write-queue flow control policy

use serde::Deserialize;

/// Thresholds on the client write queue, in queued buffers.
///
/// Backend reads are paused once the queue grows past `start` and resumed
/// after it drains to `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FlowControlConfig {
    #[serde(default)]
    pub enabled: bool,
    /// High-water mark
    #[serde(default = "default_start")]
    pub start: usize,
    /// Low-water mark
    #[serde(default = "default_end")]
    pub end: usize,
}

fn default_start() -> usize {
    256
}

fn default_end() -> usize {
    64
}

impl FlowControlConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_marks(start: usize, end: usize) -> Self {
        Self {
            enabled: true,
            start,
            end,
        }
    }

    /// Whether a queue of `queue_len` buffers is past the high-water mark
    pub fn should_pause(&self, queue_len: usize) -> bool {
        self.enabled && queue_len > self.start
    }

    /// Whether paused readers may continue at `queue_len`
    pub fn should_resume(&self, queue_len: usize) -> bool {
        queue_len <= self.end
    }
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: default_start(),
            end: default_end(),
        }
    }
}
