mod parser;
mod seek_sequence;
mod standalone_executable;

use std::collections::HashMap;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Error;
pub use parser::Hunk;
pub use parser::ParseError;
pub use parser::Patch;
pub use parser::UpdateFileChunk;
pub use parser::parse_patch;
use similar::TextDiff;
pub use standalone_executable::main;
use thiserror::Error;
use tree_sitter::Parser;
use tree_sitter_bash::LANGUAGE as BASH;

/// Detailed instructions for models on how to write patches in this format.
pub const APPLY_PATCH_TOOL_INSTRUCTIONS: &str = include_str!("../apply_patch_tool_instructions.md");

#[derive(Debug, Error)]
pub enum ApplyPatchError {
    #[error(transparent)]
    ParseError(#[from] ParseError),
    #[error(transparent)]
    IoError(#[from] IoError),
    /// Error that occurs while computing replacements when applying patch chunks
    #[error("{0}")]
    ComputeReplacements(String),
    #[error("path must be relative to the working directory: {}", .0.display())]
    AbsolutePath(PathBuf),
    #[error("path escapes the working directory: {}", .0.display())]
    PathEscapesBase(PathBuf),
    #[error("No files were modified.")]
    NoChanges,
}

impl From<std::io::Error> for ApplyPatchError {
    fn from(err: std::io::Error) -> Self {
        ApplyPatchError::IoError(IoError {
            context: "I/O error".to_string(),
            source: err,
        })
    }
}

#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct IoError {
    context: String,
    #[source]
    source: std::io::Error,
}

impl IoError {
    fn new(context: impl Into<String>, source: std::io::Error) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug)]
pub enum MaybeApplyPatch {
    Body(Patch),
    ShellParseError(Error),
    PatchParseError(ParseError),
    NotApplyPatch,
}

/// Recognises an `apply_patch` invocation in a command vector, either called
/// directly (`["apply_patch", PATCH]`) or through a bash heredoc.
pub fn maybe_parse_apply_patch(argv: &[String]) -> MaybeApplyPatch {
    match argv {
        [cmd, body] if cmd == "apply_patch" => match parse_patch(body) {
            Ok(patch) => MaybeApplyPatch::Body(patch),
            Err(e) => MaybeApplyPatch::PatchParseError(e),
        },
        [bash, flag, script]
            if bash == "bash"
                && flag == "-lc"
                && script.trim_start().starts_with("apply_patch") =>
        {
            match extract_heredoc_body_from_apply_patch_command(script) {
                Ok(body) => match parse_patch(&body) {
                    Ok(patch) => MaybeApplyPatch::Body(patch),
                    Err(e) => MaybeApplyPatch::PatchParseError(e),
                },
                Err(e) => MaybeApplyPatch::ShellParseError(e),
            }
        }
        _ => MaybeApplyPatch::NotApplyPatch,
    }
}

/// Extracts the heredoc body from a bash command like
/// `apply_patch <<'EOF'\n*** Begin Patch\n...\nEOF`.
fn extract_heredoc_body_from_apply_patch_command(src: &str) -> anyhow::Result<String> {
    if !src.trim_start().starts_with("apply_patch") {
        anyhow::bail!("expected command to start with 'apply_patch'");
    }

    let lang = BASH.into();
    let mut parser = Parser::new();
    parser
        .set_language(&lang)
        .context("failed to load bash grammar")?;
    let tree = parser
        .parse(src, None)
        .ok_or_else(|| anyhow::anyhow!("failed to parse patch into AST"))?;

    let bytes = src.as_bytes();
    let mut c = tree.root_node().walk();

    loop {
        let node = c.node();
        if node.kind() == "heredoc_body" {
            let text = node
                .utf8_text(bytes)
                .with_context(|| "failed to interpret heredoc body as UTF-8")?;
            return Ok(text.trim_end_matches('\n').to_owned());
        }

        if c.goto_first_child() {
            continue;
        }
        while !c.goto_next_sibling() {
            if !c.goto_parent() {
                anyhow::bail!("expected to find heredoc_body in patch candidate");
            }
        }
    }
}

/// Paths touched by a patch, as written in the patch (relative to the base
/// directory). Each list is free of duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSummary {
    pub added: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
}

impl PatchSummary {
    pub fn from_hunks(hunks: &[Hunk]) -> Self {
        let mut summary = Self::default();
        for hunk in hunks {
            match hunk {
                Hunk::AddFile { path, .. } => push_unique(&mut summary.added, path),
                Hunk::DeleteFile { path } => push_unique(&mut summary.deleted, path),
                Hunk::UpdateFile {
                    path, move_path, ..
                } => {
                    push_unique(&mut summary.modified, path);
                    if let Some(dest) = move_path {
                        push_unique(&mut summary.modified, dest);
                    }
                }
            }
        }
        summary
    }

    pub fn has_deletes(&self) -> bool {
        !self.deleted.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Every affected path, without duplicates.
    pub fn paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for path in self
            .added
            .iter()
            .chain(&self.modified)
            .chain(&self.deleted)
        {
            push_unique(&mut paths, path);
        }
        paths
    }
}

fn push_unique(paths: &mut Vec<PathBuf>, path: &Path) {
    if !paths.iter().any(|p| p == path) {
        paths.push(path.to_path_buf());
    }
}

pub fn summarize_patch(patch: &Patch) -> PatchSummary {
    PatchSummary::from_hunks(&patch.hunks)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyPatchResult {
    pub summary: PatchSummary,
    pub raw_patch_text: String,
}

/// Resolves a path from a patch against `base`. Only relative paths are
/// accepted, and `..` components may not climb above `base`. The check is
/// lexical; symlinks inside `base` are followed by the OS as usual.
pub fn resolve_path(base: &Path, path: &Path) -> Result<PathBuf, ApplyPatchError> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ApplyPatchError::PathEscapesBase(path.to_path_buf()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(ApplyPatchError::AbsolutePath(path.to_path_buf()));
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        return Err(ApplyPatchError::PathEscapesBase(path.to_path_buf()));
    }
    Ok(base.join(normalized))
}

/// Applies the patch to the files under `base`, printing the summary to
/// stdout or the error to stderr.
pub fn apply_patch(
    patch: &str,
    base: &Path,
    stdout: &mut impl std::io::Write,
    stderr: &mut impl std::io::Write,
) -> Result<ApplyPatchResult, ApplyPatchError> {
    let parsed = match parse_patch(patch) {
        Ok(parsed) => parsed,
        Err(e) => {
            match &e {
                ParseError::InvalidPatchError {
                    message,
                    line_number,
                } => {
                    writeln!(stderr, "Invalid patch on line {line_number}: {message}")?;
                }
                ParseError::InvalidHunkError {
                    message,
                    line_number,
                } => {
                    writeln!(
                        stderr,
                        "Invalid patch hunk on line {line_number}: {message}"
                    )?;
                }
            }
            return Err(ApplyPatchError::ParseError(e));
        }
    };

    match apply_patch_in_dir(&parsed, base) {
        Ok(result) => {
            print_summary(&result.summary, stdout)?;
            Ok(result)
        }
        Err(err) => {
            writeln!(stderr, "{err}")?;
            Err(err)
        }
    }
}

/// Applies each hunk of `patch` to the filesystem under `base`, in order.
///
/// Every path is validated before any file is touched. After that, hunks are
/// written one at a time: if hunk *k* fails, hunks before it stay applied.
pub fn apply_patch_in_dir(patch: &Patch, base: &Path) -> Result<ApplyPatchResult, ApplyPatchError> {
    if patch.hunks.is_empty() {
        return Err(ApplyPatchError::NoChanges);
    }
    for hunk in &patch.hunks {
        resolve_path(base, hunk.path())?;
        if let Hunk::UpdateFile {
            move_path: Some(dest),
            ..
        } = hunk
        {
            resolve_path(base, dest)?;
        }
    }

    for hunk in &patch.hunks {
        apply_hunk(hunk, base)?;
    }

    Ok(ApplyPatchResult {
        summary: summarize_patch(patch),
        raw_patch_text: patch.raw_text.clone(),
    })
}

fn apply_hunk(hunk: &Hunk, base: &Path) -> Result<(), ApplyPatchError> {
    match hunk {
        Hunk::AddFile { path, contents } => {
            let target = resolve_path(base, path)?;
            write_file(&target, path, contents)
        }
        Hunk::DeleteFile { path } => {
            let target = resolve_path(base, path)?;
            std::fs::remove_file(&target).map_err(|e| {
                IoError::new(format!("Failed to delete file {}", path.display()), e).into()
            })
        }
        Hunk::UpdateFile {
            path,
            move_path,
            chunks,
        } => {
            let source = resolve_path(base, path)?;
            let AppliedPatch { new_contents, .. } =
                derive_new_contents_from_chunks(&source, path, chunks)?;
            match move_path {
                Some(dest_path) => {
                    let dest = resolve_path(base, dest_path)?;
                    write_file(&dest, dest_path, &new_contents)?;
                    if dest != source {
                        std::fs::remove_file(&source).map_err(|e| {
                            IoError::new(
                                format!("Failed to remove original {}", path.display()),
                                e,
                            )
                        })?;
                    }
                    Ok(())
                }
                None => write_file(&source, path, &new_contents),
            }
        }
    }
}

fn write_file(target: &Path, display_path: &Path, contents: &str) -> Result<(), ApplyPatchError> {
    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IoError::new(
                    format!(
                        "Failed to create parent directories for {}",
                        display_path.display()
                    ),
                    e,
                )
            })?;
        }
    }
    std::fs::write(target, contents).map_err(|e| {
        IoError::new(format!("Failed to write file {}", display_path.display()), e).into()
    })
}

struct AppliedPatch {
    original_contents: String,
    new_contents: String,
}

/// Return the original and new file contents after applying the chunks to
/// the file at `path`. `display_path` is used in error messages.
fn derive_new_contents_from_chunks(
    path: &Path,
    display_path: &Path,
    chunks: &[UpdateFileChunk],
) -> Result<AppliedPatch, ApplyPatchError> {
    let original_contents = std::fs::read_to_string(path)
        .map_err(|e| update_read_error(display_path, e))?;
    derive_new_contents_from_text(original_contents, display_path, chunks)
}

fn update_read_error(display_path: &Path, e: std::io::Error) -> ApplyPatchError {
    IoError::new(
        format!("Failed to read file to update {}", display_path.display()),
        e,
    )
    .into()
}

fn derive_new_contents_from_text(
    original_contents: String,
    display_path: &Path,
    chunks: &[UpdateFileChunk],
) -> Result<AppliedPatch, ApplyPatchError> {
    let mut original_lines: Vec<String> = original_contents
        .split('\n')
        .map(|s| s.to_string())
        .collect();

    // Drop the trailing empty element that results from the final newline so
    // that line counts match the behaviour of standard `diff`.
    if original_lines.last().is_some_and(|s| s.is_empty()) {
        original_lines.pop();
    }

    let replacements = compute_replacements(&original_lines, display_path, chunks)?;
    let mut new_lines = apply_replacements(original_lines, replacements, display_path)?;
    if !new_lines.last().is_some_and(|s| s.is_empty()) {
        new_lines.push(String::new());
    }
    let new_contents = new_lines.join("\n");
    Ok(AppliedPatch {
        original_contents,
        new_contents,
    })
}

/// One contiguous edit: replace `old_len` lines starting at `start` with
/// `new_lines`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Replacement {
    start: usize,
    old_len: usize,
    new_lines: Vec<String>,
}

/// Compute the replacements needed to transform `original_lines` into the
/// new lines, given the patch `chunks`.
fn compute_replacements(
    original_lines: &[String],
    path: &Path,
    chunks: &[UpdateFileChunk],
) -> Result<Vec<Replacement>, ApplyPatchError> {
    let mut replacements: Vec<Replacement> = Vec::new();
    let mut line_index: usize = 0;

    for chunk in chunks {
        // If a chunk has a `change_context`, we use seek_sequence to find it, then
        // adjust our `line_index` to continue from there.
        if let Some(ctx_line) = &chunk.change_context {
            match seek_sequence::seek_sequence(
                original_lines,
                std::slice::from_ref(ctx_line),
                line_index,
                false,
            ) {
                Some(idx) => line_index = idx + 1,
                None => {
                    return Err(ApplyPatchError::ComputeReplacements(format!(
                        "Failed to find context '{}' in {}",
                        ctx_line,
                        path.display()
                    )));
                }
            }
        }

        if chunk.old_lines.is_empty() {
            // Pure addition: right after the context line when there is one,
            // otherwise at the end of the file (before a final blank line).
            let start = if chunk.change_context.is_some() {
                line_index
            } else if original_lines.last().is_some_and(|s| s.is_empty()) {
                original_lines.len() - 1
            } else {
                original_lines.len()
            };
            replacements.push(Replacement {
                start,
                old_len: 0,
                new_lines: chunk.new_lines.clone(),
            });
            continue;
        }

        // In many diffs the last element of `old_lines` is an empty string
        // standing for the terminating newline of the region being replaced.
        // `original_lines` has no such sentinel, so when the direct search
        // fails, retry without it.
        let mut pattern: &[String] = &chunk.old_lines;
        let mut found =
            seek_sequence::seek_sequence(original_lines, pattern, line_index, chunk.is_end_of_file);

        let mut new_slice: &[String] = &chunk.new_lines;

        if found.is_none() && pattern.last().is_some_and(|s| s.is_empty()) {
            pattern = &pattern[..pattern.len() - 1];
            if new_slice.last().is_some_and(|s| s.is_empty()) {
                new_slice = &new_slice[..new_slice.len() - 1];
            }

            found = seek_sequence::seek_sequence(
                original_lines,
                pattern,
                line_index,
                chunk.is_end_of_file,
            );
        }

        match found {
            Some(start) => {
                replacements.push(Replacement {
                    start,
                    old_len: pattern.len(),
                    new_lines: new_slice.to_vec(),
                });
                line_index = start + pattern.len();
            }
            None => {
                return Err(ApplyPatchError::ComputeReplacements(format!(
                    "Failed to find expected lines {:?} in {}",
                    chunk.old_lines,
                    path.display()
                )));
            }
        }
    }

    Ok(replacements)
}

/// Splice `replacements` into `lines`. Replacements are sorted by start and
/// must lie within the file and not overlap.
fn apply_replacements(
    mut lines: Vec<String>,
    mut replacements: Vec<Replacement>,
    path: &Path,
) -> Result<Vec<String>, ApplyPatchError> {
    replacements.sort_by_key(|r| r.start);

    for r in &replacements {
        if r.start + r.old_len > lines.len() {
            return Err(ApplyPatchError::ComputeReplacements(format!(
                "Replacement range {}..{} is out of bounds for {} ({} lines)",
                r.start,
                r.start + r.old_len,
                path.display(),
                lines.len()
            )));
        }
    }
    for pair in replacements.windows(2) {
        let (a, b) = (&pair[0], &pair[1]);
        if a.start + a.old_len > b.start {
            return Err(ApplyPatchError::ComputeReplacements(format!(
                "Overlapping replacements at lines {} and {} in {}",
                a.start + 1,
                b.start + 1,
                path.display()
            )));
        }
    }

    // Apply in descending order so earlier replacements don't shift the
    // positions of later ones.
    for r in replacements.into_iter().rev() {
        lines.splice(r.start..r.start + r.old_len, r.new_lines);
    }

    Ok(lines)
}

/// Proposed effect of one hunk, computed without touching the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyPatchFileChange {
    Add {
        content: String,
    },
    Delete,
    Update {
        unified_diff: String,
        move_path: Option<PathBuf>,
        /// new_content that will result after the unified_diff is applied.
        new_content: String,
    },
}

/// The change one hunk would make, as previewed by [`preview_patch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewedChange {
    /// Path as written in the patch.
    pub path: PathBuf,
    pub change: ApplyPatchFileChange,
}

/// Computes the change each hunk would make to the tree under `base`, one
/// entry per hunk in patch order. Hunks are previewed sequentially: each one
/// sees the contents left by the hunks before it. Nothing is written.
pub fn preview_patch(
    patch: &Patch,
    base: &Path,
) -> Result<Vec<PreviewedChange>, ApplyPatchError> {
    // Resolved path -> contents after the hunks seen so far (`None` = deleted).
    let mut overlay: HashMap<PathBuf, Option<String>> = HashMap::new();
    let mut changes = Vec::with_capacity(patch.hunks.len());
    for hunk in &patch.hunks {
        let change = match hunk {
            Hunk::AddFile { path, contents } => {
                let target = resolve_path(base, path)?;
                overlay.insert(target, Some(contents.clone()));
                ApplyPatchFileChange::Add {
                    content: contents.clone(),
                }
            }
            Hunk::DeleteFile { path } => {
                let target = resolve_path(base, path)?;
                let exists = match overlay.get(&target) {
                    Some(contents) => contents.is_some(),
                    None => target.is_file(),
                };
                if !exists {
                    return Err(IoError::new(
                        format!("Failed to delete file {}", path.display()),
                        std::io::Error::from(std::io::ErrorKind::NotFound),
                    )
                    .into());
                }
                overlay.insert(target, None);
                ApplyPatchFileChange::Delete
            }
            Hunk::UpdateFile {
                path,
                move_path,
                chunks,
            } => {
                let dest = move_path
                    .as_ref()
                    .map(|dest| resolve_path(base, dest))
                    .transpose()?;
                let source = resolve_path(base, path)?;
                let original_contents = match overlay.get(&source) {
                    Some(Some(contents)) => contents.clone(),
                    Some(None) => {
                        return Err(update_read_error(
                            path,
                            std::io::Error::from(std::io::ErrorKind::NotFound),
                        ));
                    }
                    None => std::fs::read_to_string(&source)
                        .map_err(|e| update_read_error(path, e))?,
                };
                let AppliedPatch {
                    original_contents,
                    new_contents,
                } = derive_new_contents_from_text(original_contents, path, chunks)?;
                let unified_diff = unified_diff_between(&original_contents, &new_contents, 1);
                match dest {
                    Some(dest) if dest != source => {
                        overlay.insert(source, None);
                        overlay.insert(dest, Some(new_contents.clone()));
                    }
                    _ => {
                        overlay.insert(source, Some(new_contents.clone()));
                    }
                }
                ApplyPatchFileChange::Update {
                    unified_diff,
                    move_path: move_path.clone(),
                    new_content: new_contents,
                }
            }
        };
        changes.push(PreviewedChange {
            path: hunk.path().to_path_buf(),
            change,
        });
    }
    Ok(changes)
}

fn unified_diff_between(original: &str, new: &str, context: usize) -> String {
    TextDiff::from_lines(original, new)
        .unified_diff()
        .context_radius(context)
        .to_string()
}

/// Write a summary of changes in git-style format to the given writer.
pub fn print_summary(summary: &PatchSummary, out: &mut impl std::io::Write) -> std::io::Result<()> {
    writeln!(out, "Success. Updated the following files:")?;
    for path in &summary.added {
        writeln!(out, "A {}", path.display())?;
    }
    for path in &summary.modified {
        writeln!(out, "M {}", path.display())?;
    }
    for path in &summary.deleted {
        writeln!(out, "D {}", path.display())?;
    }
    Ok(())
}
