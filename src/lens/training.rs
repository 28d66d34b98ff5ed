//! # Training Scenarios
//!
//! Step-by-step validation of AR object interactions against a scripted
//! training scenario.
//!
//! ## Matching rule:
//! An interaction matches a step when, after lowercasing and trimming, the
//! object name contains one of the step's expected objects or is contained in
//! one ("Fire Extinguisher (red)" and "extinguisher" both match
//! "fire extinguisher").

use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TrainingStep {
    pub step: u32,
    pub expected_objects: Vec<String>,
    pub action: String,
    pub description: String,
}

impl TrainingStep {
    fn new(step: u32, expected_objects: &[&str], action: &str, description: &str) -> Self {
        Self {
            step,
            expected_objects: expected_objects.iter().map(|o| o.to_string()).collect(),
            action: action.to_string(),
            description: description.to_string(),
        }
    }

    /// Case-insensitive substring match in either direction.
    pub fn matches(&self, object_name: &str) -> bool {
        let object = object_name.trim().to_lowercase();
        self.expected_objects.iter().any(|expected| {
            let expected = expected.to_lowercase();
            expected.contains(&object) || object.contains(&expected)
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingScenario {
    pub name: String,
    pub steps: Vec<TrainingStep>,
}

impl TrainingScenario {
    /// Fire emergency drill: extinguisher, pin, aim, extinguish, alarm.
    pub fn fire_emergency() -> Self {
        Self {
            name: "fire_emergency".to_string(),
            steps: vec![
                TrainingStep::new(1, &["fire extinguisher"], "grab", "Find and grab the fire extinguisher"),
                TrainingStep::new(2, &["fire extinguisher"], "pull_pin", "Pull the pin from the fire extinguisher"),
                TrainingStep::new(3, &["fire extinguisher"], "aim", "Aim the extinguisher at the base of the fire"),
                TrainingStep::new(4, &["fire", "flame"], "extinguish", "Spray the fire to extinguish it"),
                TrainingStep::new(5, &["fire alarm"], "pull", "Pull the fire alarm to alert others"),
            ],
        }
    }

    pub fn step(&self, number: u32) -> Option<&TrainingStep> {
        self.steps.iter().find(|s| s.step == number)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Result of checking an interaction against the current step.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Correct {
        step: u32,
        expected_action: String,
        description: String,
    },
    Incorrect {
        reason: String,
        /// Empty when there is no current step (scenario finished)
        expected_objects: Vec<String>,
        current_description: String,
    },
}

impl Validation {
    pub fn is_correct(&self) -> bool {
        matches!(self, Validation::Correct { .. })
    }
}

/// Progress through a scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingProgress {
    pub scenario: TrainingScenario,
    pub current_step: u32,
    pub completed_steps: Vec<u32>,
    pub consecutive_errors: u32,
    pub last_correct_action: Option<String>,
}

impl TrainingProgress {
    pub fn new(scenario: TrainingScenario) -> Self {
        Self {
            scenario,
            current_step: 1,
            completed_steps: Vec::new(),
            consecutive_errors: 0,
            last_correct_action: None,
        }
    }

    pub fn current_step_info(&self) -> Option<&TrainingStep> {
        self.scenario.step(self.current_step)
    }

    pub fn is_complete(&self) -> bool {
        self.current_step as usize > self.scenario.step_count()
    }

    pub fn validate(&self, object_name: &str) -> Validation {
        let Some(step) = self.current_step_info() else {
            return Validation::Incorrect {
                reason: "Invalid training step".to_string(),
                expected_objects: Vec::new(),
                current_description: String::new(),
            };
        };

        if step.matches(object_name) {
            Validation::Correct {
                step: step.step,
                expected_action: step.action.clone(),
                description: step.description.clone(),
            }
        } else {
            Validation::Incorrect {
                reason: format!("Wrong object for step {}", self.current_step),
                expected_objects: step.expected_objects.clone(),
                current_description: step.description.clone(),
            }
        }
    }

    /// Mark the current step done and move on. Returns true once the scenario is complete.
    pub fn advance(&mut self) -> bool {
        self.last_correct_action = self.current_step_info().map(|s| s.action.clone());
        self.completed_steps.push(self.current_step);
        self.current_step += 1;
        self.consecutive_errors = 0;

        info!(step = self.current_step, "Advanced to training step");

        let complete = self.is_complete();
        if complete {
            info!(scenario = %self.scenario.name, "Training scenario completed");
        }
        complete
    }

    /// Count an incorrect interaction; returns the new consecutive error count.
    pub fn record_error(&mut self) -> u32 {
        self.consecutive_errors += 1;
        warn!(consecutive_errors = self.consecutive_errors, "Training error recorded");
        self.consecutive_errors
    }
}

impl Default for TrainingProgress {
    fn default() -> Self {
        Self::new(TrainingScenario::fire_emergency())
    }
}
