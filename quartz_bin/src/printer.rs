//! Textual result tables: `|`-separated cells, dash rule lines and a
//! record-count trailer. The same rendering feeds client replies and
//! the `output.txt` audit mirror.

/// Renders a result table:
///
/// ```text
/// ----------------
/// | id | name |
/// ----------------
/// | 1 | alice |
/// ----------------
/// Total record(s): 1
/// ```
pub fn render_table(captions: &[String], rows: &[Vec<String>]) -> String {
    let header = render_row(captions);
    let rule = "-".repeat(header.len().max(8));
    let mut out = String::new();
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&header);
    out.push('\n');
    out.push_str(&rule);
    out.push('\n');
    for row in rows {
        out.push_str(&render_row(row));
        out.push('\n');
    }
    out.push_str(&rule);
    out.push('\n');
    out.push_str(&format!("Total record(s): {}\n", rows.len()));
    out
}

fn render_row(cells: &[impl AsRef<str>]) -> String {
    let mut out = String::from("|");
    for cell in cells {
        out.push(' ');
        out.push_str(cell.as_ref());
        out.push_str(" |");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_rows_and_count() {
        let text = render_table(
            &["id".to_string(), "name".to_string()],
            &[
                vec!["1".to_string(), "a".to_string()],
                vec!["2".to_string(), "b".to_string()],
            ],
        );
        assert!(text.contains("| id | name |"));
        assert!(text.contains("| 1 | a |"));
        assert!(text.contains("| 2 | b |"));
        assert!(text.ends_with("Total record(s): 2\n"));
    }
}
