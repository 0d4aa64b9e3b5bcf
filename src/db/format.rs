//! Plain-text table rendering for result sets.

use super::QueryRows;

/// Renders `rows` as a padded text table:
///
/// ```text
/// id | name
/// ---+------
/// 1  | alice
/// ```
pub fn render_table(rows: &QueryRows) -> String {
    let mut widths: Vec<usize> = rows.columns.iter().map(|c| c.chars().count()).collect();
    for row in &rows.rows {
        for (i, value) in row.iter().enumerate() {
            let len = value.chars().count();
            match widths.get_mut(i) {
                Some(w) => *w = (*w).max(len),
                None => widths.push(len),
            }
        }
    }

    let mut lines = Vec::with_capacity(rows.rows.len() + 2);
    lines.push(render_line(&rows.columns, &widths));
    lines.push(
        widths
            .iter()
            .map(|w| "-".repeat(*w))
            .collect::<Vec<_>>()
            .join("-+-"),
    );
    for row in &rows.rows {
        lines.push(render_line(row, &widths));
    }
    lines.join("\n")
}

fn render_line(values: &[String], widths: &[usize]) -> String {
    let cells: Vec<String> = widths
        .iter()
        .enumerate()
        .map(|(i, width)| {
            let value = values.get(i).map(String::as_str).unwrap_or("");
            format!("{value:<width$}")
        })
        .collect();
    cells.join(" | ").trim_end().to_string()
}
