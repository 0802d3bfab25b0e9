//! File tree as ASCII lines.

use repolens_kernel::FileNode;

/// Format a tree. Directories get a trailing `/`; paths in `dirty` get ` *`.
pub fn format_tree(tree: &[FileNode], dirty: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    for (idx, node) in tree.iter().enumerate() {
        format_node(node, "", idx == tree.len() - 1, dirty, &mut lines);
    }
    lines
}

fn format_node(node: &FileNode, prefix: &str, is_last: bool, dirty: &[String], lines: &mut Vec<String>) {
    let connector = if is_last { "└─ " } else { "├─ " };
    let suffix = if node.is_dir() {
        "/"
    } else if dirty.iter().any(|p| p == &node.path) {
        " *"
    } else {
        ""
    };
    lines.push(format!("{}{}{}{}", prefix, connector, node.name, suffix));

    let child_prefix = if is_last {
        format!("{}   ", prefix)
    } else {
        format!("{}│  ", prefix)
    };
    let children = node.children();
    for (i, child) in children.iter().enumerate() {
        format_node(child, &child_prefix, i == children.len() - 1, dirty, lines);
    }
}
