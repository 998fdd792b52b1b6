use std::sync::Arc;

use crate::{ExecError, ExecutionEnvironment};

use super::types::{PatchHunk, PatchHunkLine, PatchOperation};

enum PlannedWrite {
    Create { path: String, content: String },
    Overwrite { path: String, content: String },
    Delete { path: String },
    Move { from: String, to: String, content: String },
}

/// Applies a parsed patch. All operations are planned against the current
/// file contents first; any mismatch aborts before a single write happens.
pub async fn apply_patch_operations(
    operations: &[PatchOperation],
    env: Arc<dyn ExecutionEnvironment>,
) -> Result<String, ExecError> {
    let mut plan = Vec::with_capacity(operations.len());
    let mut summaries = Vec::with_capacity(operations.len());

    for operation in operations {
        match operation {
            PatchOperation::AddFile { path, lines } => {
                if env.file_exists(path).await? {
                    return Err(ExecError::PatchApply(format!(
                        "file already exists: '{path}'"
                    )));
                }
                plan.push(PlannedWrite::Create {
                    path: path.clone(),
                    content: lines.join("\n"),
                });
                summaries.push(format!("A {path}"));
            }
            PatchOperation::DeleteFile { path } => {
                if !env.file_exists(path).await? {
                    return Err(ExecError::PatchApply(format!("file not found: '{path}'")));
                }
                plan.push(PlannedWrite::Delete { path: path.clone() });
                summaries.push(format!("D {path}"));
            }
            PatchOperation::UpdateFile {
                path,
                move_to,
                hunks,
            } => {
                if !env.file_exists(path).await? {
                    return Err(ExecError::PatchApply(format!(
                        "cannot update missing file '{path}'"
                    )));
                }
                let original = env.read_file(path, None, None).await?;
                let updated = apply_hunks_to_content(path, &original, hunks)?;

                let move_target = move_to.as_deref().filter(|target| *target != path.as_str());
                if let Some(target) = move_target {
                    if env.file_exists(target).await? {
                        return Err(ExecError::PatchApply(format!(
                            "move target already exists: '{target}'"
                        )));
                    }
                    plan.push(PlannedWrite::Move {
                        from: path.clone(),
                        to: target.to_string(),
                        content: updated,
                    });
                    summaries.push(format!("R {path} -> {target}"));
                } else {
                    plan.push(PlannedWrite::Overwrite {
                        path: path.clone(),
                        content: updated,
                    });
                    summaries.push(format!("M {path}"));
                }
            }
        }
    }

    for write in plan {
        match write {
            PlannedWrite::Create { path, content }
            | PlannedWrite::Overwrite { path, content } => {
                env.write_file(&path, &content).await?;
            }
            PlannedWrite::Delete { path } => {
                env.delete_file(&path).await?;
            }
            PlannedWrite::Move { from, to, content } => {
                env.write_file(&from, &content).await?;
                env.move_file(&from, &to).await?;
            }
        }
    }

    Ok(format!("Applied patch:\n{}", summaries.join("\n")))
}

/// Context and delete lines must match the file exactly at the anchor; the
/// first exact occurrence at or after the previous hunk's end is the anchor.
fn apply_hunks_to_content(
    path: &str,
    content: &str,
    hunks: &[PatchHunk],
) -> Result<String, ExecError> {
    let mut lines = split_content_lines(content);
    let had_trailing_newline = content.ends_with('\n');
    let mut search_from = 0usize;

    for hunk in hunks {
        let (old_lines, new_lines) = hunk_old_new_lines(hunk);
        if old_lines.is_empty() {
            let insert_at = search_from.min(lines.len());
            lines.splice(insert_at..insert_at, new_lines.clone());
            search_from = insert_at + new_lines.len();
            continue;
        }

        let Some(position) = find_subsequence(&lines, &old_lines, search_from) else {
            return Err(ExecError::PatchApply(format!(
                "hunk '{}' does not match '{path}'",
                hunk.header
            )));
        };

        let end = position + old_lines.len();
        lines.splice(position..end, new_lines.clone());
        search_from = position + new_lines.len();
    }

    let mut updated = lines.join("\n");
    if had_trailing_newline {
        updated.push('\n');
    }
    Ok(updated)
}

fn find_subsequence(haystack: &[String], needle: &[String], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (from..=haystack.len() - needle.len())
        .find(|&index| haystack[index..index + needle.len()] == *needle)
}

fn split_content_lines(content: &str) -> Vec<String> {
    if content.is_empty() {
        return Vec::new();
    }
    let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
    if content.ends_with('\n') && lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

fn hunk_old_new_lines(hunk: &PatchHunk) -> (Vec<String>, Vec<String>) {
    let mut old_lines = Vec::new();
    let mut new_lines = Vec::new();
    for line in &hunk.lines {
        match line {
            PatchHunkLine::Context(value) => {
                old_lines.push(value.clone());
                new_lines.push(value.clone());
            }
            PatchHunkLine::Delete(value) => old_lines.push(value.clone()),
            PatchHunkLine::Add(value) => new_lines.push(value.clone()),
            PatchHunkLine::EndOfFile => {}
        }
    }
    (old_lines, new_lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalExecutionEnvironment;
    use crate::patch::parser::parse_patch;
    use tempfile::tempdir;

    #[test]
    fn apply_hunks_to_content_exact_match_updates_content() {
        let hunks = vec![PatchHunk {
            header: "@@ update".to_string(),
            lines: vec![
                PatchHunkLine::Delete("line2".to_string()),
                PatchHunkLine::Add("line-two".to_string()),
            ],
        }];
        let updated =
            apply_hunks_to_content("f.txt", "line1\nline2\n", &hunks).expect("should apply");
        assert_eq!(updated, "line1\nline-two\n");
    }

    #[test]
    fn apply_hunks_to_content_sequential_anchoring_expected_in_order() {
        let hunks = vec![
            PatchHunk {
                header: "@@ first region".to_string(),
                lines: vec![
                    PatchHunkLine::Context("marker".to_string()),
                    PatchHunkLine::Delete("b".to_string()),
                    PatchHunkLine::Add("B1".to_string()),
                ],
            },
            PatchHunk {
                header: "@@ second region".to_string(),
                lines: vec![
                    PatchHunkLine::Context("marker".to_string()),
                    PatchHunkLine::Delete("b".to_string()),
                    PatchHunkLine::Add("B2".to_string()),
                ],
            },
        ];
        // Identical regions: each hunk anchors at the first occurrence at or
        // after the previous hunk's end.
        let updated = apply_hunks_to_content(
            "f.txt",
            "marker\nb\nmarker\nb\nc\n",
            &hunks,
        )
        .expect("hunks should apply in order");
        assert_eq!(updated, "marker\nB1\nmarker\nB2\nc\n");
    }

    #[test]
    fn apply_hunks_to_content_out_of_order_hunks_expected_error() {
        let hunks = vec![
            PatchHunk {
                header: "@@ late region".to_string(),
                lines: vec![
                    PatchHunkLine::Delete("three".to_string()),
                    PatchHunkLine::Add("THREE".to_string()),
                ],
            },
            PatchHunk {
                header: "@@ earlier region".to_string(),
                lines: vec![
                    PatchHunkLine::Delete("one".to_string()),
                    PatchHunkLine::Add("ONE".to_string()),
                ],
            },
        ];
        let error = apply_hunks_to_content("f.txt", "one\ntwo\nthree\n", &hunks)
            .expect_err("a hunk anchored before the previous one must fail");
        assert!(error.to_string().contains("does not match"));
    }

    #[test]
    fn apply_hunks_to_content_mismatch_expected_error() {
        let hunks = vec![PatchHunk {
            header: "@@ update".to_string(),
            lines: vec![
                PatchHunkLine::Context("does not exist".to_string()),
                PatchHunkLine::Add("new".to_string()),
            ],
        }];
        let error = apply_hunks_to_content("f.txt", "line1\nline2\n", &hunks)
            .expect_err("mismatched hunk should fail");
        assert!(error.to_string().contains("does not match"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn apply_patch_mismatch_leaves_files_untouched() {
        let dir = tempdir().expect("temp dir should be created");
        let env: Arc<dyn ExecutionEnvironment> =
            Arc::new(LocalExecutionEnvironment::new(dir.path()));
        env.write_file("a.txt", "one\ntwo\n")
            .await
            .expect("write should succeed");

        let patch = "\
*** Begin Patch
*** Update File: a.txt
@@ first
-one
+uno
*** Update File: a.txt
@@ second
-missing line
+replacement
*** End Patch";
        let operations = parse_patch(patch).expect("patch should parse");
        let error = apply_patch_operations(&operations, Arc::clone(&env))
            .await
            .expect_err("apply should fail on mismatch");
        assert!(matches!(error, ExecError::PatchApply(_)));

        let content = env
            .read_file("a.txt", None, None)
            .await
            .expect("read should succeed");
        assert_eq!(content, "one\ntwo\n");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn apply_patch_add_update_delete_round_trip() {
        let dir = tempdir().expect("temp dir should be created");
        let env: Arc<dyn ExecutionEnvironment> =
            Arc::new(LocalExecutionEnvironment::new(dir.path()));
        env.write_file("keep.txt", "alpha\nbeta\n")
            .await
            .expect("write should succeed");
        env.write_file("gone.txt", "x\n")
            .await
            .expect("write should succeed");

        let patch = "\
*** Begin Patch
*** Add File: fresh.txt
+hello
*** Update File: keep.txt
@@ rename beta
-beta
+gamma
*** Delete File: gone.txt
*** End Patch";
        let operations = parse_patch(patch).expect("patch should parse");
        let summary = apply_patch_operations(&operations, Arc::clone(&env))
            .await
            .expect("apply should succeed");
        assert!(summary.contains("A fresh.txt"));
        assert!(summary.contains("M keep.txt"));
        assert!(summary.contains("D gone.txt"));

        assert_eq!(
            env.read_file("keep.txt", None, None)
                .await
                .expect("read should succeed"),
            "alpha\ngamma\n"
        );
        assert!(
            !env.file_exists("gone.txt")
                .await
                .expect("exists should succeed")
        );

        let inverse = "\
*** Begin Patch
*** Update File: keep.txt
@@ restore beta
-gamma
+beta
*** End Patch";
        let operations = parse_patch(inverse).expect("inverse patch should parse");
        apply_patch_operations(&operations, Arc::clone(&env))
            .await
            .expect("inverse apply should succeed");
        assert_eq!(
            env.read_file("keep.txt", None, None)
                .await
                .expect("read should succeed"),
            "alpha\nbeta\n"
        );
    }
}
