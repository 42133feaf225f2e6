//! A configured stage with its position in the pipeline.

use super::Stage;
use std::sync::Arc;

/// Holds a stage together with its configuration index and the precomputed
/// name of the stage that follows it.
#[derive(Debug, Clone)]
pub struct StageWrapper {
    stage: Arc<dyn Stage>,
    index: usize,
    next_stage_name: Option<String>,
}

impl StageWrapper {
    /// Wraps a stage.
    #[must_use]
    pub fn new(stage: Arc<dyn Stage>, index: usize, next_stage_name: Option<String>) -> Self {
        Self {
            stage,
            index,
            next_stage_name,
        }
    }

    /// Builds wrappers for an ordered stage list, linking each to its successor.
    #[must_use]
    pub fn chain(stages: &[Arc<dyn Stage>]) -> Vec<Self> {
        stages
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                let next = stages.get(index + 1).map(|s| s.name().to_string());
                Self::new(stage.clone(), index, next)
            })
            .collect()
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.stage.name()
    }

    /// Returns the wrapped stage.
    #[must_use]
    pub fn stage(&self) -> &Arc<dyn Stage> {
        &self.stage
    }

    /// Returns the configuration index.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the name of the following stage, if any.
    #[must_use]
    pub fn next_stage_name(&self) -> Option<&str> {
        self.next_stage_name.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::NoOpStage;

    #[test]
    fn test_chain_links_next_stage() {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(NoOpStage::new("a")),
            Arc::new(NoOpStage::new("b")),
            Arc::new(NoOpStage::new("c")),
        ];

        let chain = StageWrapper::chain(&stages);

        assert_eq!(chain[0].next_stage_name(), Some("b"));
        assert_eq!(chain[1].next_stage_name(), Some("c"));
        assert_eq!(chain[2].next_stage_name(), None);
        assert_eq!(chain[2].index(), 2);
        assert_eq!(chain[1].name(), "b");
    }
}
