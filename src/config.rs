use std::time::Duration;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Queue an asynchronous dispatch is submitted to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum QueueType {
    #[default]
    Default,
    Background,
    Urgent,
}

/// Pipeline stage the fence of an asynchronous dispatch waits for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SyncStage {
    VertexProcessing,
    PixelProcessing,
    #[default]
    ComputeProcessing,
    AllGpuOperations,
}

/// Settings of a [`ComputeContext`](crate::context::ComputeContext).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ContextConfig {
    pub queue: QueueType,
    pub stage: SyncStage,
    /// Deadline of every fence or transfer wait. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl ContextConfig {
    pub fn queue(mut self, queue: QueueType) -> Self {
        self.queue = queue;
        self
    }

    pub fn stage(mut self, stage: SyncStage) -> Self {
        self.stage = stage;
        self
    }

    pub fn timeout(mut self, timeout: impl Into<Option<Duration>>) -> Self {
        self.timeout = timeout.into();
        self
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use std::time::Duration;

    use super::{ContextConfig, QueueType};

    #[test]
    fn test_serde() -> Result<(), Box<dyn std::error::Error>> {
        let config = ContextConfig::default()
            .queue(QueueType::Urgent)
            .timeout(Duration::from_millis(250));
        let json = serde_json::to_string(&config)?;
        let back: ContextConfig = serde_json::from_str(&json)?;
        assert_eq!(config, back);
        Ok(())
    }
}
