//! # AR Event Messages
//!
//! Builds the control messages that inform the upstream assistant about what
//! the trainee did in AR, and the line the assistant should speak in reply.
//!
//! ## Upstream messages:
//! - `{"type":"add-message","message":{"role":"system","content":"AR_EVENT: ..."}}`
//!   is always sent and silently updates the assistant's context
//! - `{"type":"say","message":"..."}` is sent only when the event asks to be spoken

use serde_json::json;

/// Training context appended to an AR event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ArContext {
    pub step: Option<u32>,
    pub expected_action: Option<String>,
    pub expected_objects: Option<Vec<String>>,
    pub consecutive_errors: Option<u32>,
    pub current_description: Option<String>,
}

/// An AR interaction to report upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct ArEvent {
    pub event_type: String,
    pub object_name: String,
    pub result: String,
    pub context: ArContext,
}

impl ArEvent {
    pub fn new(event_type: &str, object_name: &str, result: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            object_name: object_name.to_string(),
            result: result.to_string(),
            context: ArContext::default(),
        }
    }

    pub fn with_context(mut self, context: ArContext) -> Self {
        self.context = context;
        self
    }

    /// System-message content, stamped with the local `HH:MM` time `at`.
    pub fn system_content(&self, at: &str) -> String {
        let mut content = format!(
            "AR_EVENT: {} object='{}' result={} at {}",
            self.event_type, self.object_name, self.result, at
        );

        let ctx = &self.context;
        if let Some(step) = ctx.step {
            content.push_str(&format!(" step={}", step));
        }
        if let Some(action) = &ctx.expected_action {
            content.push_str(&format!(" expected_action='{}'", action));
        }
        if let Some(objects) = &ctx.expected_objects {
            let quoted: Vec<String> = objects.iter().map(|o| format!("'{}'", o)).collect();
            content.push_str(&format!(" expected_objects=[{}]", quoted.join(", ")));
        }
        if let Some(errors) = ctx.consecutive_errors {
            content.push_str(&format!(" consecutive_errors={}", errors));
        }
        if let Some(description) = &ctx.current_description {
            content.push_str(&format!(" current_instruction='{}'", description));
        }
        content
    }

    pub fn add_message(&self, at: &str) -> String {
        json!({
            "type": "add-message",
            "message": {
                "role": "system",
                "content": self.system_content(at),
            }
        })
        .to_string()
    }

    /// The `say` message for this event, if it has a spoken line.
    pub fn say_message(&self) -> Option<String> {
        spoken_response(self).map(|line| json!({"type": "say", "message": line}).to_string())
    }
}

/// Pick the line the assistant should speak for an event.
///
/// Incorrect interactions escalate with the consecutive error count. Correct
/// interactions get step-specific praise. Legacy event types from older lens
/// builds keep their fixed lines.
pub fn spoken_response(event: &ArEvent) -> Option<String> {
    let object = event.object_name.to_lowercase();
    let ctx = &event.context;

    if event.event_type == "incorrect_interaction" {
        let line = match &ctx.expected_objects {
            Some(expected) => {
                let expected = expected.join(", ");
                match ctx.consecutive_errors.unwrap_or(0) {
                    1 => format!("That's not quite right. You need to find the {} for this step.", expected),
                    2 => format!(
                        "Remember, for this step you should be looking for the {}. Take your time and look around.",
                        expected
                    ),
                    _ => format!(
                        "Let me help you. You're currently on step {}. You need to {}.",
                        ctx.step.map(|s| s.to_string()).unwrap_or_else(|| "?".to_string()),
                        ctx.current_description
                            .as_deref()
                            .unwrap_or("continue with the training")
                    ),
                }
            }
            None => "That's not the correct object for this step. Look around for the right item to continue."
                .to_string(),
        };
        return Some(line);
    }

    if event.event_type == "correct_interaction" && event.result == "success" {
        let step = ctx.step.unwrap_or(1);
        let line = match step {
            1 if object.contains("fire extinguisher") => {
                "Excellent! You found the fire extinguisher. Now pull the pin and aim at the base of the fire.".to_string()
            }
            2 if object.contains("fire extinguisher") => {
                "Perfect! Pin removed. Now aim the extinguisher at the base of the fire and squeeze the handle.".to_string()
            }
            3 if object.contains("fire extinguisher") => {
                "Good aim! Now squeeze the handle and sweep side to side to extinguish the flames.".to_string()
            }
            4 if object.contains("fire") || object.contains("flame") => {
                "Outstanding! The fire is extinguished. Now pull the fire alarm to alert others in the building."
                    .to_string()
            }
            5 if object.contains("fire alarm") => {
                "Perfect! You've pulled the fire alarm. Everyone will now be alerted to evacuate safely.".to_string()
            }
            _ => format!(
                "Great job with the {}! Keep following the emergency procedures.",
                event.object_name
            ),
        };
        return Some(line);
    }

    if event.result != "success" {
        return Some(format!(
            "I noticed you had trouble with the {}. Let me help guide you.",
            event.object_name
        ));
    }

    let line = match event.event_type.as_str() {
        "object_interaction" | "object_pinched" => {
            if object.contains("fire extinguisher") {
                "Great job grabbing the fire extinguisher! Now pull the pin and aim at the base of the fire.".to_string()
            } else if object.contains("fire alarm") {
                "Good work activating the fire alarm! Now let's focus on the fire extinguisher.".to_string()
            } else if object.contains("flame") {
                "I see you're near the fire. Remember to stay at a safe distance and use the extinguisher.".to_string()
            } else {
                format!(
                    "Nice work interacting with the {}. Keep following the safety procedures.",
                    event.object_name
                )
            }
        }
        "pull_extinguisher" => {
            "Perfect! You've got the fire extinguisher. Now pull the pin and aim at the base of the fire.".to_string()
        }
        "pull_pin" => "Excellent! Pin removed. Now aim the nozzle at the base of the fire and squeeze the handle.".to_string(),
        "aim_extinguisher" => "Good positioning! Now squeeze the handle to discharge the extinguisher.".to_string(),
        "extinguish_fire" => {
            "Outstanding! You've successfully extinguished the fire. Great job following proper fire safety procedures."
                .to_string()
        }
        "task_complete" => "Congratulations! You've completed the fire safety training successfully.".to_string(),
        other => format!("I see you completed the {} step. Keep up the good work!", other),
    };
    Some(line)
}
