//! Whitespace-separated numeric trajectory files.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::{Result, SysIdError};
use crate::trajectory::StateLayout;

/// Parses every whitespace-separated token of `text` as a number.
pub fn parse_values(text: &str, source_name: &str) -> Result<Vec<f64>> {
    text.split_whitespace()
        .enumerate()
        .map(|(index, token)| {
            token.parse::<f64>().map_err(|_| SysIdError::Parse {
                source_name: source_name.to_string(),
                index,
                token: token.to_string(),
            })
        })
        .collect()
}

/// Takes the first `expected` values of `text`.
///
/// Fewer values is a missing-data error; extra values are dropped with a warning.
pub fn read_values(text: &str, source_name: &str, expected: usize) -> Result<Vec<f64>> {
    let mut values = parse_values(text, source_name)?;
    if values.len() < expected {
        return Err(SysIdError::MissingData(format!(
            "{source_name} holds {} values, {expected} are needed",
            values.len()
        )));
    }
    if values.len() > expected {
        warn!(
            source = source_name,
            expected,
            found = values.len(),
            "ignoring surplus trajectory values"
        );
        values.truncate(expected);
    }
    Ok(values)
}

/// Nominal controls, `steps` vectors of `layout.actuators` values, step-major.
pub fn read_controls(text: &str, layout: &StateLayout, steps: usize) -> Result<Vec<f64>> {
    read_values(text, "control sequence", steps * layout.actuators)
}

/// Nominal states, `steps + 1` reduced states, step-major.
pub fn read_states(text: &str, layout: &StateLayout, steps: usize) -> Result<Vec<f64>> {
    read_values(text, "state sequence", (steps + 1) * layout.state_dim())
}

pub fn load_controls(path: &Path, layout: &StateLayout, steps: usize) -> Result<Vec<f64>> {
    read_controls(&fs::read_to_string(path)?, layout, steps)
}

pub fn load_states(path: &Path, layout: &StateLayout, steps: usize) -> Result<Vec<f64>> {
    read_states(&fs::read_to_string(path)?, layout, steps)
}

#[cfg(test)]
mod tests {
    use super::{load_controls, parse_values, read_controls, read_states};
    use crate::error::SysIdError;
    use crate::trajectory::StateLayout;

    #[test]
    fn values_may_span_lines_and_use_exponents() {
        let values = parse_values("0.5 -1\n2e-3\t\n 4.0 ", "controls").unwrap();
        assert_eq!(values, vec![0.5, -1.0, 0.002, 4.0]);
    }

    #[test]
    fn bad_token_reports_its_position() {
        let err = parse_values("1.0 2.0 abc", "controls").unwrap_err();
        match err {
            SysIdError::Parse { index, token, .. } => {
                assert_eq!(index, 2);
                assert_eq!(token, "abc");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn short_sources_are_missing_data() {
        let layout = StateLayout::new(1, 0, 2);
        let err = read_controls("1 2 3", &layout, 2).unwrap_err();
        assert!(matches!(err, SysIdError::MissingData(_)));
        assert!(err.to_string().contains("4 are needed"));
    }

    #[test]
    fn surplus_values_are_dropped() {
        let layout = StateLayout::new(1, 0, 1);
        assert_eq!(read_controls("1 2 3 4", &layout, 2).unwrap(), vec![1.0, 2.0]);
        assert_eq!(read_states("1 2 3 4 5 6 7", &layout, 2).unwrap().len(), 6);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let layout = StateLayout::new(1, 0, 1);
        let err = load_controls(
            std::path::Path::new("/nonexistent/sysid/result0.txt"),
            &layout,
            1,
        )
        .unwrap_err();
        assert!(matches!(err, SysIdError::Io(_)));
    }
}
