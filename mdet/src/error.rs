//! # Engine errors

use crate::frame::FrameShape;

/// Reasons the engine could not analyse a stream.
///
/// Any of these means no event list is produced. An empty event list is never an error.
#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("invalid frame rate {0:?}, cannot derive timestamps")]
    InvalidFrameRate(Option<f64>),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("frame {index} has shape {found}, expected {expected}")]
    DimensionMismatch {
        index: u64,
        expected: FrameShape,
        found: FrameShape,
    },
    #[error("failed to read frame {index}")]
    Source {
        index: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("gave up after {count} consecutive unreadable frames at frame {index}")]
    TooManySkipped { index: u64, count: usize },
    #[error("failed to build worker pool")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl DetectError {
    /// Whether the error stems from configuration rather than the input stream.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidFrameRate(_)
                | Self::Config(_)
                | Self::DimensionMismatch { .. }
                | Self::ThreadPool(_)
        )
    }
}
