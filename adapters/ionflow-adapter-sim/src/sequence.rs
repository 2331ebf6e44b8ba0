//! Text-template sequence generator.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use ionflow_hal::{ExperimentRef, HalError, HalResult, ParameterMap, SequenceGenerator};

/// Renders a program as a header line followed by one `key = value` line
/// per parameter, in key order.
///
/// Output is deterministic, so equal snapshots yield equal programs.
#[derive(Debug, Default)]
pub struct TemplateSequenceGenerator {
    generated: AtomicUsize,
    fail_on: Option<String>,
}

impl TemplateSequenceGenerator {
    /// Create a generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail generation for the experiment with identifier `experiment`.
    pub fn failing_for(mut self, experiment: impl Into<String>) -> Self {
        self.fail_on = Some(experiment.into());
        self
    }

    /// Number of programs generated so far.
    pub fn generated_count(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}

impl SequenceGenerator for TemplateSequenceGenerator {
    fn generate(&self, experiment: &ExperimentRef, parameters: &ParameterMap) -> HalResult<String> {
        if self.fail_on.as_deref() == Some(experiment.id.as_str()) {
            return Err(HalError::SequenceGeneration(format!(
                "no template for {experiment}"
            )));
        }

        let mut program = format!("# experiment {experiment}\n");
        for (key, value) in parameters {
            let _ = writeln!(program, "{key} = {value}");
        }
        self.generated.fetch_add(1, Ordering::SeqCst);
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionflow_hal::ParameterValue;

    #[test]
    fn test_program_lists_sorted_parameters() {
        let generator = TemplateSequenceGenerator::new();
        let mut params = ParameterMap::new();
        params.insert("rf:freq".to_string(), ParameterValue::Float(1.5));
        params.insert("amp".to_string(), ParameterValue::Int(3));

        let program = generator
            .generate(&ExperimentRef::new("experiments.Rabi"), &params)
            .unwrap();
        assert_eq!(program, "# experiment experiments.Rabi\namp = 3\nrf:freq = 1.5\n");
        assert_eq!(generator.generated_count(), 1);
    }

    #[test]
    fn test_failing_experiment() {
        let generator = TemplateSequenceGenerator::new().failing_for("experiments.Broken");
        let err = generator
            .generate(&ExperimentRef::new("experiments.Broken"), &ParameterMap::new())
            .unwrap_err();
        assert!(matches!(err, HalError::SequenceGeneration(_)));
        assert_eq!(generator.generated_count(), 0);
    }
}
