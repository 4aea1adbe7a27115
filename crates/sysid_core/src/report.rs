//! Plain-text transition report (`lnr.txt`).
//!
//! Layout: for every step, one line per matrix row with each entry printed `%.8f` and
//! cut or space-padded to 10 characters plus a separating space; a blank line closes each
//! matrix. Two labelled lines follow, `sysiderr: ` and `ptb_coef: `, each value printed
//! `%.4f` in 6 characters. The file does not end with a newline.

use std::io::Write;

use nalgebra::DMatrix;

use crate::error::{Result, SysIdError};
use crate::trajectory::{StateLayout, TransitionSet};

pub const ENTRY_PRECISION: usize = 8;
pub const ENTRY_WIDTH: usize = 10;
pub const SUMMARY_PRECISION: usize = 4;
pub const SUMMARY_WIDTH: usize = 6;

const ERROR_LABEL: &str = "sysiderr:";
const COEFFICIENT_LABEL: &str = "ptb_coef:";

/// Formats `value` with `precision` decimals, then cuts or right-pads it to `width`.
pub fn format_fixed(value: f64, precision: usize, width: usize) -> String {
    let mut text = format!("{value:.precision$}");
    if text.len() > width {
        text.truncate(width);
    } else {
        text.extend(std::iter::repeat(' ').take(width - text.len()));
    }
    text
}

pub fn render_report(
    transitions: &TransitionSet,
    validation_error: f64,
    noise_coefficient: f64,
) -> String {
    let layout = transitions.layout();
    let mut out = String::with_capacity(
        transitions.len() * (layout.state_dim() * (layout.input_dim() * 11 + 1) + 1) + 40,
    );
    for matrix in transitions.iter() {
        for row in matrix.row_iter() {
            for value in row.iter() {
                out.push_str(&format_fixed(*value, ENTRY_PRECISION, ENTRY_WIDTH));
                out.push(' ');
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str(ERROR_LABEL);
    out.push(' ');
    out.push_str(&format_fixed(validation_error, SUMMARY_PRECISION, SUMMARY_WIDTH));
    out.push('\n');
    out.push_str(COEFFICIENT_LABEL);
    out.push(' ');
    out.push_str(&format_fixed(noise_coefficient, SUMMARY_PRECISION, SUMMARY_WIDTH));
    out
}

pub fn write_report<W: Write>(
    mut writer: W,
    transitions: &TransitionSet,
    validation_error: f64,
    noise_coefficient: f64,
) -> Result<()> {
    let text = render_report(transitions, validation_error, noise_coefficient);
    writer.write_all(text.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// A report read back from text. Entries carry the precision they were printed with.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionReport {
    pub matrices: Vec<DMatrix<f64>>,
    pub validation_error: f64,
    pub noise_coefficient: f64,
}

impl TransitionReport {
    pub fn parse(text: &str) -> Result<Self> {
        let mut matrices = Vec::new();
        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut validation_error = None;
        let mut noise_coefficient = None;
        let mut last_line = 0;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            last_line = line;
            let trimmed = raw.trim();
            if let Some(rest) = trimmed.strip_prefix(ERROR_LABEL) {
                flush_matrix(&mut rows, &mut matrices, line)?;
                validation_error = Some(parse_value(rest, line)?);
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix(COEFFICIENT_LABEL) {
                flush_matrix(&mut rows, &mut matrices, line)?;
                noise_coefficient = Some(parse_value(rest, line)?);
                continue;
            }
            if trimmed.is_empty() {
                flush_matrix(&mut rows, &mut matrices, line)?;
                continue;
            }
            if validation_error.is_some() || noise_coefficient.is_some() {
                return Err(report_error(line, "matrix data after the summary lines"));
            }
            let row = trimmed
                .split_whitespace()
                .map(|token| parse_value(token, line))
                .collect::<Result<Vec<_>>>()?;
            rows.push(row);
        }
        flush_matrix(&mut rows, &mut matrices, last_line)?;

        let validation_error = validation_error
            .ok_or_else(|| report_error(last_line, "missing `sysiderr:` line"))?;
        let noise_coefficient = noise_coefficient
            .ok_or_else(|| report_error(last_line, "missing `ptb_coef:` line"))?;
        Ok(Self {
            matrices,
            validation_error,
            noise_coefficient,
        })
    }

    /// Checks every matrix against `layout` and wraps them in a [`TransitionSet`].
    pub fn into_transitions(self, layout: StateLayout) -> Result<TransitionSet> {
        TransitionSet::from_matrices(layout, self.matrices)
    }
}

fn flush_matrix(
    rows: &mut Vec<Vec<f64>>,
    matrices: &mut Vec<DMatrix<f64>>,
    line: usize,
) -> Result<()> {
    if rows.is_empty() {
        return Ok(());
    }
    let width = rows[0].len();
    if let Some(ragged) = rows.iter().find(|row| row.len() != width) {
        return Err(report_error(
            line,
            format!("matrix rows have {} and {} entries", width, ragged.len()),
        ));
    }
    let entries: Vec<f64> = rows.drain(..).flatten().collect();
    matrices.push(DMatrix::from_row_slice(entries.len() / width, width, &entries));
    Ok(())
}

fn parse_value(token: &str, line: usize) -> Result<f64> {
    let token = token.trim();
    token
        .parse::<f64>()
        .map_err(|_| report_error(line, format!("{token:?} is not a number")))
}

fn report_error(line: usize, message: impl Into<String>) -> SysIdError {
    SysIdError::Report {
        line,
        message: message.into(),
    }
}
