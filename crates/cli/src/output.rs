// Output rendering for CLI commands
//
// Text output is written by each command with the helpers below; json output
// is one pretty-printed document per command on stdout.

use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

const LABEL_WIDTH: usize = 14;
const COLUMN_GAP: &str = "  ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_text(self) -> bool {
        self == OutputFormat::Text
    }

    /// Write `value` as a json document; a no-op for text output
    pub fn print_value<T: Serialize>(self, value: &T) -> Result<()> {
        if self.is_text() {
            return Ok(());
        }
        let mut stdout = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut stdout, value)?;
        writeln!(stdout)?;
        Ok(())
    }
}

/// Print a `label: value` line
pub fn print_field(label: &str, value: &str) {
    println!("{:<LABEL_WIDTH$} {value}", format!("{label}:"));
}

/// Fixed-width text table; the header is printed on creation
pub struct Table {
    widths: Vec<usize>,
}

impl Table {
    pub fn new(columns: &[(&str, usize)]) -> Self {
        let widths: Vec<usize> = columns.iter().map(|(_, width)| *width).collect();
        let table = Self { widths };
        let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
        table.row(&names);
        table
    }

    /// Print one row; cells beyond the last column are ignored
    pub fn row(&self, cells: &[&str]) {
        println!("{}", self.render(cells));
    }

    fn render(&self, cells: &[&str]) -> String {
        cells
            .iter()
            .zip(&self.widths)
            .map(|(cell, width)| format!("{:<width$}", fit(cell, *width), width = *width))
            .collect::<Vec<_>>()
            .join(COLUMN_GAP)
            .trim_end()
            .to_string()
    }
}

/// Shorten `cell` to `width` characters, marking the cut with "..."
fn fit(cell: &str, width: usize) -> String {
    if cell.chars().count() <= width || width <= 3 {
        return cell.to_string();
    }
    let kept: String = cell.chars().take(width - 3).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_truncates_long_cells() {
        assert_eq!(fit("orders", 8), "orders");
        assert_eq!(fit("showdown-0190a1b2c3", 10), "showdow...");
        assert_eq!(fit("abcdef", 3), "abcdef");
    }

    #[test]
    fn test_render_pads_columns() {
        let table = Table {
            widths: vec![6, 4],
        };
        assert_eq!(table.render(&["q", "12"]), "q       12");
        assert_eq!(table.render(&["queue-long", "1", "extra"]), "que...  1");
    }
}
