use crate::error::{OrchestratorError, Result};

pub const MIN_MEMORY_MIB: i64 = 512;
pub const MAX_NAME_LEN: usize = 50;
pub const MAX_DURATION_MINUTES: i64 = 9_999_999_999;

/// Core count and memory limits shared by create and update.
pub fn validate_resources(core_count: i64, memory: i64) -> Result<()> {
    if core_count <= 0 {
        return Err(OrchestratorError::Validation(format!(
            "core count must be positive, got {core_count}"
        )));
    }
    if memory < MIN_MEMORY_MIB {
        return Err(OrchestratorError::Validation(format!(
            "memory must be at least {MIN_MEMORY_MIB} MiB, got {memory}"
        )));
    }
    Ok(())
}

pub fn validate_duration(duration_minutes: i64) -> Result<()> {
    if !(0..=MAX_DURATION_MINUTES).contains(&duration_minutes) {
        return Err(OrchestratorError::Validation(format!(
            "duration must be between 0 and {MAX_DURATION_MINUTES} minutes, got {duration_minutes}"
        )));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(OrchestratorError::Validation(
            "name must not be empty".to_string(),
        ));
    }
    let len = name.chars().count();
    if len > MAX_NAME_LEN {
        return Err(OrchestratorError::Validation(format!(
            "name must be at most {MAX_NAME_LEN} characters, got {len}"
        )));
    }
    Ok(())
}

/// Checks a create request before anything touches a backend.
pub fn validate_specs(name: &str, core_count: i64, memory: i64, duration_minutes: i64) -> Result<()> {
    validate_resources(core_count, memory)?;
    validate_duration(duration_minutes)?;
    validate_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_validation(result: Result<()>) -> bool {
        matches!(result, Err(OrchestratorError::Validation(_)))
    }

    #[test]
    fn accepts_minimal_spec() {
        assert!(validate_specs("lab-1", 1, 512, 0).is_ok());
    }

    #[test]
    fn rejects_small_memory() {
        assert!(is_validation(validate_specs("lab-1", 1, 511, 60)));
    }

    #[test]
    fn rejects_non_positive_cores() {
        assert!(is_validation(validate_specs("lab-1", 0, 1024, 60)));
        assert!(is_validation(validate_specs("lab-1", -2, 1024, 60)));
    }

    #[test]
    fn rejects_long_names() {
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(is_validation(validate_specs(&name, 1, 1024, 60)));
        assert!(validate_specs(&"x".repeat(MAX_NAME_LEN), 1, 1024, 60).is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        assert!(is_validation(validate_specs("  ", 1, 1024, 60)));
    }

    #[test]
    fn duration_bounds() {
        assert!(is_validation(validate_specs("lab-1", 1, 1024, -1)));
        assert!(validate_specs("lab-1", 1, 1024, MAX_DURATION_MINUTES).is_ok());
        assert!(is_validation(validate_specs(
            "lab-1",
            1,
            1024,
            MAX_DURATION_MINUTES + 1
        )));
    }
}
