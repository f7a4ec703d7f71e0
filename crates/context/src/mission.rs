//! Standing mission objective

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStage {
    Initializing,
    Takeoff,
    Transit,
    Surveillance,
    Following,
    Returning,
    Landing,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MissionObjective {
    pub goal: String,
    pub stage: MissionStage,
    /// Ordered plan steps, e.g. "takeoff to 20m"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

impl MissionObjective {
    pub fn new(goal: impl Into<String>, stage: MissionStage) -> Self {
        Self {
            goal: goal.into(),
            stage,
            steps: Vec::new(),
        }
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }
}

impl Default for MissionObjective {
    fn default() -> Self {
        Self::new("No specific mission objective set.", MissionStage::Initializing)
    }
}
