//! Source-context rendering for runtime faults.
//!
//! When a module carries a debug line map, an unhandled fault can be shown
//! with a window of source around the faulting line:
//!
//! ```text
//! error: ArithmeticError: division by zero
//!   |
//! 2 |   var y: 10;
//! 3 |   var z: x / 0;
//!   |   ^^^^^^^^^^^^^
//! 4 |   os.console.print(z);
//!   |
//! ```

use std::fmt;

use crate::vm::VmError;

/// Lines of context shown on each side of the fault line.
const CONTEXT_LINES: u32 = 5;

/// A runtime fault paired with the source it came from, rendered via
/// [`fmt::Display`].
#[derive(Debug, Clone)]
pub struct FaultReport<'a> {
    source: &'a str,
    error: &'a VmError,
}

impl<'a> FaultReport<'a> {
    pub fn new(source: &'a str, error: &'a VmError) -> Self {
        Self { source, error }
    }
}

impl fmt::Display for FaultReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.error.message)?;

        let Some(fault_line) = self.error.line else {
            return writeln!(f, "  = at pc 0x{:04X} (no debug info)", self.error.pc);
        };

        let lines: Vec<&str> = self.source.lines().collect();
        let first = fault_line.saturating_sub(CONTEXT_LINES).max(1);
        let last = (fault_line + CONTEXT_LINES).min(lines.len() as u32);
        let width = last.to_string().len();

        writeln!(f, "{:width$} |", "")?;
        for line_no in first..=last {
            let text = lines.get(line_no as usize - 1).copied().unwrap_or("");
            writeln!(f, "{line_no:width$} | {text}")?;
            if line_no == fault_line {
                let marker = "^".repeat(text.trim_end().len().max(1));
                writeln!(f, "{:width$} | {marker}", "")?;
            }
        }
        writeln!(f, "{:width$} |", "")
    }
}

/// Convenience wrapper producing the rendered report as a `String`.
pub fn render_fault(source: &str, error: &VmError) -> String {
    FaultReport::new(source, error).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_is_centered_on_the_fault_line() {
        let source = (1..=20)
            .map(|i| format!("var l{i}: {i};"))
            .collect::<Vec<_>>()
            .join("\n");
        let error = VmError {
            message: "ArithmeticError: division by zero".to_string(),
            pc: 99,
            line: Some(10),
        };
        let report = render_fault(&source, &error);
        assert!(report.contains("error: ArithmeticError: division by zero"));
        // ±5 lines around line 10.
        assert!(report.contains(" 5 | var l5: 5;"));
        assert!(report.contains("15 | var l15: 15;"));
        assert!(!report.contains("var l4: 4;"));
        assert!(!report.contains("var l16: 16;"));
        // The fault line is underlined.
        assert!(report.contains("^^^"));
    }

    #[test]
    fn missing_debug_info_falls_back_to_pc() {
        let error = VmError {
            message: "TypeError: boom".to_string(),
            pc: 0x2A,
            line: None,
        };
        let report = render_fault("var x: 1;", &error);
        assert!(report.contains("at pc 0x002A"));
    }

    #[test]
    fn window_clamps_at_file_start() {
        let error = VmError {
            message: "boom".to_string(),
            pc: 0,
            line: Some(1),
        };
        let report = render_fault("var a: 1;\nvar b: 2;", &error);
        assert!(report.contains("1 | var a: 1;"));
        assert!(report.contains("2 | var b: 2;"));
    }
}
