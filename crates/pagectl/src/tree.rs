//! Renders the control tree with the contents of every readable file.

use std::fmt::Write;

use pagealloc::software::EmulatedProcFs;

pub fn render(fs: &EmulatedProcFs, root: &str) -> String {
    let mut out = String::new();
    if fs.exists(root) {
        render_node(fs, root, root, 0, &mut out);
    }
    out
}

fn render_node(fs: &EmulatedProcFs, path: &str, name: &str, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let Some(mode) = fs.mode(path) else {
        let _ = writeln!(out, "{indent}{name}/");
        for child in fs.list(path) {
            render_node(fs, &format!("{path}/{child}"), &child, depth + 1, out);
        }
        return;
    };

    let _ = write!(out, "{indent}{name} ({:03o})", mode.bits());
    match fs.read(path) {
        Some(contents) if !contents.is_empty() => {
            let mut lines = contents.lines();
            let _ = writeln!(out, ": {}", lines.next().unwrap_or_default());
            for line in lines {
                let _ = writeln!(out, "{indent}  {line}");
            }
        }
        _ => out.push('\n'),
    }
}
