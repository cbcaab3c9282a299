//! Structural validation of a single worker's options (spec §4.7 step 1).

use miniflare_core::{OptionError, ValidationPath, WorkerOptions};

/// `YYYY-MM-DD`, checked structurally rather than parsed as a real date: the
/// simulator never needs to reason about calendar arithmetic over it, only to
/// reject garbage (spec §3 "Worker" attributes: "compatibility date").
pub fn validate_compatibility_date(date: &str, path: ValidationPath) -> Result<(), OptionError> {
    let bytes = date.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[8..10].iter().all(u8::is_ascii_digit);

    if shape_ok {
        Ok(())
    } else {
        Err(OptionError::Validation {
            path,
            message: format!("compatibility date {date:?} is not in YYYY-MM-DD form"),
        })
    }
}

fn validate_route(pattern: &str, path: ValidationPath) -> Result<(), OptionError> {
    if pattern.is_empty() {
        return Err(OptionError::Validation {
            path,
            message: "route pattern must not be empty".to_string(),
        });
    }
    if pattern.matches('/').count() == 0 {
        return Err(OptionError::Validation {
            path,
            message: format!("route {pattern:?} must contain a host/pathname separator"),
        });
    }
    Ok(())
}

/// Validate a single worker's own fields (not its mounts or cross-worker state).
pub fn validate_worker(worker: &WorkerOptions, worker_path: &str) -> Result<(), OptionError> {
    validate_compatibility_date(
        &worker.compatibility_date,
        format!("{worker_path}.compatibilityDate"),
    )?;

    for (i, route) in worker.routes.iter().enumerate() {
        validate_route(&route.0, format!("{worker_path}.routes[{i}]"))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_date() {
        assert!(validate_compatibility_date("2024-01-15", "x".into()).is_ok());
    }

    #[test]
    fn rejects_malformed_date() {
        assert!(validate_compatibility_date("2024-1-15", "x".into()).is_err());
        assert!(validate_compatibility_date("not-a-date", "x".into()).is_err());
    }

    #[test]
    fn rejects_route_without_separator() {
        assert!(validate_route("hostonly", "x".into()).is_err());
        assert!(validate_route("host/path*", "x".into()).is_ok());
    }
}
