use std::{fs, path::Path};

pub fn format_markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut table = format!("| {} |\n", headers.join(" | "));
    table.push_str(&format!(
        "| {} |\n",
        headers.iter().map(|_| "---").collect::<Vec<_>>().join(" | ")
    ));
    for row in rows {
        table.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    table
}

/// Replaces the marked `section` of the results file, appending it if absent.
pub fn update_results(section: &str, content: &str) -> std::io::Result<()> {
    let tag = section.to_uppercase();
    let start_marker = format!("<!-- {tag}_START -->");
    let end_marker = format!("<!-- {tag}_END -->");

    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("benchmarks/RESULTS.md");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut body = if path.exists() {
        fs::read_to_string(&path)?
    } else {
        "# Multi-Head Attention Benchmarks\n\n".to_string()
    };

    let block = format!("{start_marker}\n{content}\n{end_marker}\n");
    match (body.find(&start_marker), body.find(&end_marker)) {
        (Some(start), Some(end)) => {
            let stop = (end + end_marker.len() + 1).min(body.len());
            body.replace_range(start..stop, &block);
        }
        _ => {
            if !body.ends_with('\n') {
                body.push('\n');
            }
            body.push_str(&block);
        }
    }
    fs::write(&path, body)
}
