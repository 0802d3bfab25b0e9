//! System instruction for a chat run.

use crate::repo::RepoRef;
use crate::tools::truncate_chars;

/// Build the system instruction, including the open file when there is one.
///
/// The file body is capped like a `read_file` result.
pub fn system_instruction(repo: &RepoRef, active: Option<(&str, &str)>, cap: usize) -> String {
    let mut out = format!(
        "You are a coding assistant embedded in a repository browser for `{repo}`.\n\
         Use `read_file` to inspect any file before answering questions about it. \
         Use `update_file` to change a file; always send the complete new contents. \
         Edits stay local until the user commits them, so say what you changed.\n"
    );

    match active {
        Some((path, content)) => {
            let shown = truncate_chars(content, cap);
            out.push_str(&format!(
                "\nThe user is viewing `{path}`. Calls to `update_file` without a path write to it.\n\
                 \n<file path=\"{path}\">\n{shown}\n</file>\n"
            ));
            if shown.len() < content.len() {
                out.push_str("(file truncated; use read_file for the rest)\n");
            }
        }
        None => out.push_str("\nNo file is open.\n"),
    }
    out
}
