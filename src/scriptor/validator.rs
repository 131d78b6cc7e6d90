//! Structural script validation.
//!
//! Candidate scripts are checked before every execution attempt, including
//! repairs.  The default policy is a denial list of forbidden substrings;
//! hosts with stronger requirements plug in their own [`ScriptValidator`].

/// Pre-execution check on a candidate script.
pub trait ScriptValidator: Send + Sync {
    /// Returns `None` when the script is accepted, or a short human error
    /// that is fed back into the repair loop.
    fn validate(&self, script: &str) -> Option<String>;
}

/// Keywords denied by default: reflection and process spawning have no place
/// in generated scripts.
pub const DEFAULT_FORBIDDEN_KEYWORDS: [&str; 4] = [
    "System.Reflection",
    "Process.Start",
    "Environment.Exit",
    "GetType(",
];

/// Rejects scripts containing any of a configured set of substrings.
pub struct KeywordValidator {
    forbidden: Vec<String>,
}

impl KeywordValidator {
    /// Build a validator from an explicit denial list.
    pub fn new(forbidden: Vec<String>) -> Self {
        KeywordValidator { forbidden }
    }

    /// The default denial list.
    pub fn default_keywords() -> Self {
        Self::new(
            DEFAULT_FORBIDDEN_KEYWORDS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }
}

impl ScriptValidator for KeywordValidator {
    fn validate(&self, script: &str) -> Option<String> {
        for keyword in &self.forbidden {
            if !keyword.is_empty() && script.contains(keyword.as_str()) {
                // Deliberately not phrased as a policy refusal: keyword
                // rejections are repairable and must stay retryable.
                return Some(format!(
                    "Script uses the forbidden keyword '{}'.",
                    keyword
                ));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_clean_scripts() {
        let validator = KeywordValidator::default_keywords();
        assert_eq!(validator.validate("return 1 + 1;"), None);
    }

    #[test]
    fn rejects_configured_keywords() {
        let validator = KeywordValidator::new(vec!["BAD".to_string()]);
        let error = validator.validate("BAD return 1;").unwrap();
        assert!(error.contains("BAD"));
        assert!(!error.starts_with("Cannot"));
    }

    #[test]
    fn empty_denial_list_accepts_everything() {
        let validator = KeywordValidator::new(Vec::new());
        assert_eq!(validator.validate("Process.Start(\"rm\")"), None);
    }
}
