//! Identifier generation for runs and scheduled jobs.
//!
//! Ids are timestamped for human scanning (`run_20250807_141502_1a2b3c`)
//! with a random suffix for uniqueness under concurrent submission.

use chrono::Utc;
use uuid::Uuid;

/// Generates run and job identifiers.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// A fresh run identifier.
    #[must_use]
    pub fn generate_run_id(&self) -> String {
        self.generate("run")
    }

    /// A fresh scheduled-job identifier.
    #[must_use]
    pub fn generate_job_id(&self) -> String {
        self.generate("job")
    }

    fn generate(&self, prefix: &str) -> String {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{prefix}_{stamp}_{}", &suffix[..6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let generator = IdGenerator::new();
        let a = generator.generate_run_id();
        let b = generator.generate_run_id();
        assert!(a.starts_with("run_"));
        assert!(generator.generate_job_id().starts_with("job_"));
        assert_ne!(a, b);
    }
}
