//! Scenario selection and canned-response templating.
//!
//! Scenarios are a test fixture: an immutable mapping from the client's
//! greeting identity to replacement replies for MAIL, RCPT, DATA and
//! STARTTLS. Replies injected this way do not count against the session
//! error limit.

use crate::config::ScenarioConfig;
use crate::smtp::transaction::SmtpVerb;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only scenario table shared across sessions.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMatcher {
    scenarios: Arc<Vec<ScenarioConfig>>,
}

impl ScenarioMatcher {
    pub fn new(scenarios: &HashMap<String, ScenarioConfig>) -> Self {
        Self {
            scenarios: Arc::new(scenarios.values().cloned().collect()),
        }
    }

    /// Selects the scenario keyed by the greeting verb and its argument.
    pub fn select(&self, verb: SmtpVerb, identity: &str) -> Option<&ScenarioConfig> {
        self.scenarios.iter().find(|s| {
            let key = match verb {
                SmtpVerb::Helo => s.helo.as_deref(),
                SmtpVerb::Lhlo => s.lhlo.as_deref(),
                SmtpVerb::Ehlo => s.ehlo.as_deref(),
                _ => None,
            };
            key == Some(identity)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

/// Per-recipient override lookup within a selected scenario.
pub fn rcpt_override<'a>(scenario: &'a ScenarioConfig, address: &str) -> Option<&'a str> {
    scenario
        .rcpt
        .iter()
        .find(|r| r.value == address)
        .map(|r| r.response.as_str())
}

/// Substitutes literal `{$name}` tokens from the environment. Unknown
/// tokens are left in place.
pub fn render(template: &str, env: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in env {
        out = out.replace(&format!("{{${}}}", name), value);
    }
    out
}
