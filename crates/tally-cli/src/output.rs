use serde::Serialize;
use std::fmt::Write as _;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Plain-text table for the human output of `queue` and `score`.
///
/// Columns whose every body cell parses as an integer are right-aligned.
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    /// Append a row. Missing cells render blank; extra cells are dropped.
    pub fn row<I, S>(&mut self, cells: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut row: Vec<String> = cells
            .into_iter()
            .map(Into::into)
            .take(self.headers.len())
            .collect();
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
        self
    }

    pub fn render(&self) -> String {
        let widths: Vec<usize> = (0..self.headers.len())
            .map(|col| {
                self.rows
                    .iter()
                    .map(|r| r[col].chars().count())
                    .chain(std::iter::once(self.headers[col].chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();
        let numeric: Vec<bool> = (0..self.headers.len())
            .map(|col| {
                !self.rows.is_empty() && self.rows.iter().all(|r| r[col].parse::<i64>().is_ok())
            })
            .collect();

        let mut out = String::new();
        let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
        push_line(&mut out, &self.headers, &widths, &numeric);
        push_line(&mut out, &rule, &widths, &numeric);
        for row in &self.rows {
            push_line(&mut out, row, &widths, &numeric);
        }
        out
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

fn push_line(out: &mut String, cells: &[String], widths: &[usize], numeric: &[bool]) {
    let mut line = String::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        let width = widths[i];
        let _ = if numeric[i] {
            write!(line, "{cell:>width$}")
        } else {
            write!(line, "{cell:<width$}")
        };
    }
    out.push_str(line.trim_end());
    out.push('\n');
}

/// Render an optional id, `-` when absent.
pub fn opt_id(id: Option<u64>) -> String {
    id.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn columns_size_to_widest_cell() {
        let mut table = Table::new(&["ACTION", "ACTOR"]);
        table.row(["answer.accept", "7"]).row(["view", "-"]);
        let text = table.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "ACTION         ACTOR");
        assert_eq!(lines[1], "-------------  -----");
        assert_eq!(lines[2], "answer.accept  7");
        assert_eq!(lines[3], "view           -");
    }

    #[test]
    fn integer_columns_align_right() {
        let mut table = Table::new(&["REGION", "CACHED"]);
        table.row(["1", "5"]).row(["12", "-40"]);
        let text = table.render();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[2], "     1       5");
        assert_eq!(lines[3], "    12     -40");
    }

    #[test]
    fn short_rows_are_padded() {
        let mut table = Table::new(&["A", "B", "C"]);
        table.row(vec!["x".to_string()]);
        assert_eq!(table.render().lines().nth(2), Some("x"));
    }

    #[test]
    fn header_only_table() {
        let table = Table::new(&["DEPTH"]);
        assert_eq!(table.render(), "DEPTH\n-----\n");
    }
}
