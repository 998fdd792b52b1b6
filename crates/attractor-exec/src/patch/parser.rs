use crate::ExecError;

use super::types::{PatchHunk, PatchHunkLine, PatchOperation};

pub fn parse_patch(patch: &str) -> Result<Vec<PatchOperation>, ExecError> {
    let lines: Vec<&str> = patch.lines().collect();
    if lines.first().copied() != Some("*** Begin Patch") {
        return Err(ExecError::PatchParse(
            "patch must start with '*** Begin Patch'".to_string(),
        ));
    }
    if lines.last().copied() != Some("*** End Patch") {
        return Err(ExecError::PatchParse(
            "patch must end with '*** End Patch'".to_string(),
        ));
    }

    let mut operations = Vec::new();
    let mut idx = 1usize;
    let end = lines.len().saturating_sub(1);
    while idx < end {
        let line = lines[idx];
        if line.trim().is_empty() {
            idx += 1;
            continue;
        }

        if let Some(path) = line.strip_prefix("*** Add File: ") {
            let path = validated_path(path)?;
            idx += 1;
            let mut added = Vec::new();
            while idx < end && !is_patch_operation_start(lines[idx]) {
                let Some(payload) = lines[idx].strip_prefix('+') else {
                    return Err(ExecError::PatchParse(format!(
                        "invalid add-file line: '{}'",
                        lines[idx]
                    )));
                };
                added.push(payload.to_string());
                idx += 1;
            }
            operations.push(PatchOperation::AddFile { path, lines: added });
            continue;
        }

        if let Some(path) = line.strip_prefix("*** Delete File: ") {
            operations.push(PatchOperation::DeleteFile {
                path: validated_path(path)?,
            });
            idx += 1;
            continue;
        }

        if let Some(path) = line.strip_prefix("*** Update File: ") {
            let path = validated_path(path)?;
            idx += 1;
            let mut move_to = None;
            if idx < end {
                if let Some(target) = lines[idx].strip_prefix("*** Move to: ") {
                    move_to = Some(validated_path(target)?);
                    idx += 1;
                }
            }

            let mut hunks = Vec::new();
            while idx < end && !is_patch_operation_start(lines[idx]) {
                let header = lines[idx];
                if !header.starts_with("@@") {
                    return Err(ExecError::PatchParse(format!(
                        "invalid hunk header in update '{path}': '{header}'"
                    )));
                }
                idx += 1;

                let mut hunk_lines = Vec::new();
                while idx < end
                    && !is_patch_operation_start(lines[idx])
                    && !lines[idx].starts_with("@@")
                {
                    let hunk_line = lines[idx];
                    if hunk_line == "*** End of File" {
                        hunk_lines.push(PatchHunkLine::EndOfFile);
                        idx += 1;
                        continue;
                    }
                    let Some(prefix) = hunk_line.chars().next() else {
                        return Err(ExecError::PatchParse(
                            "empty hunk line is not allowed".to_string(),
                        ));
                    };
                    let value = hunk_line[1..].to_string();
                    let parsed = match prefix {
                        ' ' => PatchHunkLine::Context(value),
                        '-' => PatchHunkLine::Delete(value),
                        '+' => PatchHunkLine::Add(value),
                        _ => {
                            return Err(ExecError::PatchParse(format!(
                                "invalid hunk line prefix '{prefix}' in '{hunk_line}'"
                            )));
                        }
                    };
                    hunk_lines.push(parsed);
                    idx += 1;
                }

                if hunk_lines.is_empty() {
                    return Err(ExecError::PatchParse(format!(
                        "empty hunk in update '{path}'"
                    )));
                }
                hunks.push(PatchHunk {
                    header: header.to_string(),
                    lines: hunk_lines,
                });
            }

            if hunks.is_empty() {
                return Err(ExecError::PatchParse(format!(
                    "update operation for '{path}' must include at least one hunk"
                )));
            }

            operations.push(PatchOperation::UpdateFile {
                path,
                move_to,
                hunks,
            });
            continue;
        }

        return Err(ExecError::PatchParse(format!(
            "unknown patch operation line: '{line}'"
        )));
    }

    if operations.is_empty() {
        return Err(ExecError::PatchParse(
            "patch must contain at least one operation".to_string(),
        ));
    }

    Ok(operations)
}

fn is_patch_operation_start(line: &str) -> bool {
    line.starts_with("*** Add File: ")
        || line.starts_with("*** Delete File: ")
        || line.starts_with("*** Update File: ")
}

/// Paths are repository-root relative; absolute paths and parent traversal
/// are rejected before any filesystem access.
fn validated_path(raw: &str) -> Result<String, ExecError> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(ExecError::PatchParse("empty patch path".to_string()));
    }
    let has_drive_prefix = path.len() >= 2 && path.as_bytes()[1] == b':';
    if path.starts_with('/') || path.starts_with('\\') || has_drive_prefix {
        return Err(ExecError::PatchParse(format!(
            "absolute patch path is not allowed: '{path}'"
        )));
    }
    if path
        .split(['/', '\\'])
        .any(|component| component == "..")
    {
        return Err(ExecError::PatchParse(format!(
            "parent traversal in patch path is not allowed: '{path}'"
        )));
    }
    Ok(path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_patch_accepts_simple_update() {
        let patch = "\
*** Begin Patch
*** Update File: a.txt
@@ replace
-one
+two
*** End Patch";

        let operations = parse_patch(patch).expect("patch should parse");
        assert_eq!(operations.len(), 1);
    }

    #[test]
    fn parse_patch_rejects_missing_end_marker() {
        let patch = "\
*** Begin Patch
*** Delete File: a.txt";
        let error = parse_patch(patch).expect_err("parse should fail");
        assert!(error.to_string().contains("must end with '*** End Patch'"));
    }

    #[test]
    fn parse_patch_rejects_absolute_path() {
        let patch = "\
*** Begin Patch
*** Delete File: /etc/passwd
*** End Patch";
        let error = parse_patch(patch).expect_err("parse should fail");
        assert!(error.to_string().contains("absolute patch path"));
    }

    #[test]
    fn parse_patch_rejects_parent_traversal() {
        let patch = "\
*** Begin Patch
*** Add File: ../outside.txt
+boom
*** End Patch";
        let error = parse_patch(patch).expect_err("parse should fail");
        assert!(error.to_string().contains("parent traversal"));
    }

    #[test]
    fn parse_patch_update_with_move_expected_target_recorded() {
        let patch = "\
*** Begin Patch
*** Update File: src/old.rs
*** Move to: src/new.rs
@@ rename
-fn old() {}
+fn new() {}
*** End Patch";
        let operations = parse_patch(patch).expect("patch should parse");
        match &operations[0] {
            PatchOperation::UpdateFile { move_to, .. } => {
                assert_eq!(move_to.as_deref(), Some("src/new.rs"));
            }
            other => panic!("expected update operation, got {other:?}"),
        }
    }
}
