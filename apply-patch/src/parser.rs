//! This module is responsible for parsing & validating a patch into a list of "hunks".
//! (It does not attempt to actually check that the patch can be applied to the filesystem.)
//!
//! The grammar for the apply-patch format is:
//!
//! start: begin_patch hunk+ end_patch
//! begin_patch: "*** Begin Patch" LF
//! end_patch: "*** End Patch" LF?
//!
//! hunk: add_hunk | delete_hunk | update_hunk
//! add_hunk: "*** Add File: " filename LF add_line+
//! delete_hunk: "*** Delete File: " filename LF
//! update_hunk: "*** Update File: " filename LF change_move? change+
//! filename: /(.+)/
//! add_line: "+" /(.*)/ LF -> line
//!
//! change_move: "*** Move to: " filename LF
//! change: change_context? change_line+ (eof_line | blank_line)?
//! change_context: ("@@" | "@@ " /(.+)/) LF
//! change_line: ("+" | "-" | " ") /(.*)/ LF
//! eof_line: "*** End of File" LF
//!
//! Only the first change of an update hunk may omit its `@@` marker. A blank
//! line ends the current change; an empty context line is written as a single
//! space. Leading/trailing whitespace around the whole patch is tolerated, and
//! every error reports the 1-based line number in the original input.
use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

const BEGIN_PATCH_MARKER: &str = "*** Begin Patch";
const END_PATCH_MARKER: &str = "*** End Patch";
const ADD_FILE_MARKER: &str = "*** Add File: ";
const DELETE_FILE_MARKER: &str = "*** Delete File: ";
const UPDATE_FILE_MARKER: &str = "*** Update File: ";
const MOVE_TO_MARKER: &str = "*** Move to: ";
const EOF_MARKER: &str = "*** End of File";
const CHANGE_CONTEXT_MARKER: &str = "@@ ";
const EMPTY_CHANGE_CONTEXT_MARKER: &str = "@@";
const HEADER_PREFIX: &str = "***";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid patch at line {line_number}: {message}")]
    InvalidPatchError { message: String, line_number: usize },
    #[error("invalid hunk at line {line_number}, {message}")]
    InvalidHunkError { message: String, line_number: usize },
}
use ParseError::*;

impl ParseError {
    /// 1-based line number in the original patch text.
    pub fn line_number(&self) -> usize {
        match self {
            InvalidPatchError { line_number, .. } | InvalidHunkError { line_number, .. } => {
                *line_number
            }
        }
    }
}

/// A parsed patch: the hunks in the order they appear, plus the text they
/// were parsed from.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
    pub raw_text: String,
}

#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::enum_variant_names)]
pub enum Hunk {
    AddFile {
        path: PathBuf,
        contents: String,
    },
    DeleteFile {
        path: PathBuf,
    },
    UpdateFile {
        path: PathBuf,
        move_path: Option<PathBuf>,

        /// Chunks should be in order, i.e. the `change_context` of one chunk
        /// should occur later in the file than the previous chunk.
        chunks: Vec<UpdateFileChunk>,
    },
}
use Hunk::*;

impl Hunk {
    /// The path this hunk reads from (the source path for a move).
    pub fn path(&self) -> &Path {
        match self {
            AddFile { path, .. } | DeleteFile { path } | UpdateFile { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateFileChunk {
    /// A single line of context used to narrow down the position of the chunk
    /// (this is usually a class, method, or function definition.)
    pub change_context: Option<String>,

    /// A contiguous block of lines that should be replaced with `new_lines`.
    /// `old_lines` must occur strictly after `change_context`.
    pub old_lines: Vec<String>,
    pub new_lines: Vec<String>,

    /// If set to true, `old_lines` must occur at the end of the source file.
    /// (Tolerance around trailing newlines should be encouraged.)
    pub is_end_of_file: bool,
}

pub fn parse_patch(patch: &str) -> Result<Patch, ParseError> {
    let body = patch.trim_start();
    // Line numbers are reported against the untrimmed input.
    let line_offset = patch[..patch.len() - body.len()].matches('\n').count();
    let lines: Vec<&str> = body.trim_end().lines().collect();
    if lines.is_empty() {
        return Err(InvalidPatchError {
            message: "The patch is empty".to_string(),
            line_number: 1,
        });
    }
    if lines[0].trim() != BEGIN_PATCH_MARKER {
        return Err(InvalidPatchError {
            message: "The first line of the patch must be '*** Begin Patch'".to_string(),
            line_number: line_offset + 1,
        });
    }
    let last_line_index = lines.len() - 1;
    if last_line_index == 0 || lines[last_line_index].trim() != END_PATCH_MARKER {
        return Err(InvalidPatchError {
            message: "The last line of the patch must be '*** End Patch'".to_string(),
            line_number: line_offset + last_line_index + 1,
        });
    }
    let mut hunks: Vec<Hunk> = Vec::new();
    let mut remaining_lines = &lines[1..last_line_index];
    let mut line_number = line_offset + 2;
    while !remaining_lines.is_empty() {
        // Blank lines between hunks carry no meaning.
        if remaining_lines[0].trim().is_empty() {
            line_number += 1;
            remaining_lines = &remaining_lines[1..];
            continue;
        }
        let (hunk, hunk_lines) = parse_one_hunk(remaining_lines, line_number)?;
        hunks.push(hunk);
        line_number += hunk_lines;
        remaining_lines = &remaining_lines[hunk_lines..]
    }
    Ok(Patch {
        hunks,
        raw_text: patch.to_string(),
    })
}

fn parse_path(raw: &str, line_number: usize) -> Result<PathBuf, ParseError> {
    let path = raw.trim();
    if path.is_empty() {
        return Err(InvalidHunkError {
            message: "File path must not be empty".to_string(),
            line_number,
        });
    }
    Ok(PathBuf::from(path))
}

/// Attempts to parse a single hunk from the start of lines.
/// Returns the parsed hunk and the number of lines parsed (or a ParseError).
fn parse_one_hunk(lines: &[&str], line_number: usize) -> Result<(Hunk, usize), ParseError> {
    // Be tolerant of extra padding around marker strings.
    let first_line = lines[0].trim();
    if let Some(path) = first_line.strip_prefix(ADD_FILE_MARKER) {
        let path = parse_path(path, line_number)?;
        let mut contents = String::new();
        let mut parsed_lines = 1;
        for add_line in &lines[1..] {
            if let Some(line_to_add) = add_line.strip_prefix('+') {
                contents.push_str(line_to_add);
                contents.push('\n');
                parsed_lines += 1;
            } else {
                break;
            }
        }
        if parsed_lines == 1 {
            return Err(InvalidHunkError {
                message: format!("Add file hunk for path '{}' is empty", path.display()),
                line_number,
            });
        }
        return Ok((AddFile { path, contents }, parsed_lines));
    } else if let Some(path) = first_line.strip_prefix(DELETE_FILE_MARKER) {
        let path = parse_path(path, line_number)?;
        return Ok((DeleteFile { path }, 1));
    } else if let Some(path) = first_line.strip_prefix(UPDATE_FILE_MARKER) {
        let path = parse_path(path, line_number)?;
        let mut remaining_lines = &lines[1..];
        let mut parsed_lines = 1;

        // Optional: move file line
        let move_path = match remaining_lines
            .first()
            .and_then(|x| x.trim().strip_prefix(MOVE_TO_MARKER))
        {
            Some(raw) => {
                let move_path = parse_path(raw, line_number + parsed_lines)?;
                remaining_lines = &remaining_lines[1..];
                parsed_lines += 1;
                Some(move_path)
            }
            None => None,
        };

        let mut chunks = Vec::new();
        // NOTE: we need to know to stop once we reach the next special marker header.
        while !remaining_lines.is_empty() {
            // Skip over any completely blank lines that may separate chunks.
            if remaining_lines[0].trim().is_empty() {
                parsed_lines += 1;
                remaining_lines = &remaining_lines[1..];
                continue;
            }

            if remaining_lines[0].starts_with(HEADER_PREFIX) {
                break;
            }

            let (chunk, chunk_lines) = parse_update_file_chunk(
                remaining_lines,
                line_number + parsed_lines,
                chunks.is_empty(),
            )?;
            chunks.push(chunk);
            parsed_lines += chunk_lines;
            remaining_lines = &remaining_lines[chunk_lines..]
        }

        if chunks.is_empty() {
            return Err(InvalidHunkError {
                message: format!("Update file hunk for path '{}' is empty", path.display()),
                line_number,
            });
        }

        return Ok((
            UpdateFile {
                path,
                move_path,
                chunks,
            },
            parsed_lines,
        ));
    }

    Err(InvalidHunkError {
        message: format!(
            "'{first_line}' is not a valid hunk header. Valid hunk headers: '*** Add File: {{path}}', '*** Delete File: {{path}}', '*** Update File: {{path}}'"
        ),
        line_number,
    })
}

fn parse_update_file_chunk(
    lines: &[&str],
    line_number: usize,
    allow_missing_context: bool,
) -> Result<(UpdateFileChunk, usize), ParseError> {
    if lines.is_empty() {
        return Err(InvalidHunkError {
            message: "Update hunk does not contain any lines".to_string(),
            line_number,
        });
    }
    // If we see an explicit context marker @@ or @@ <context>, consume it; otherwise, optionally
    // allow treating the chunk as starting directly with diff lines.
    let (change_context, start_index) = if lines[0].trim_end() == EMPTY_CHANGE_CONTEXT_MARKER {
        (None, 1)
    } else if let Some(context) = lines[0].strip_prefix(CHANGE_CONTEXT_MARKER) {
        (Some(context.to_string()), 1)
    } else {
        if !allow_missing_context {
            return Err(InvalidHunkError {
                message: format!(
                    "Expected update hunk to start with a @@ context marker, got: '{}'",
                    lines[0]
                ),
                line_number,
            });
        }
        (None, 0)
    };
    let empty_chunk_error = || InvalidHunkError {
        message: "Update hunk does not contain any lines".to_string(),
        line_number: line_number + start_index,
    };
    if start_index >= lines.len() {
        return Err(empty_chunk_error());
    }
    let mut chunk = UpdateFileChunk {
        change_context,
        old_lines: Vec::new(),
        new_lines: Vec::new(),
        is_end_of_file: false,
    };
    let mut parsed_lines = 0;
    for line in &lines[start_index..] {
        if line.trim() == EOF_MARKER {
            if parsed_lines == 0 {
                return Err(empty_chunk_error());
            }
            chunk.is_end_of_file = true;
            parsed_lines += 1;
            break;
        }
        // A blank line, the next file header, or the next chunk marker ends
        // this chunk.
        if line.is_empty()
            || line.starts_with(HEADER_PREFIX)
            || line.starts_with(EMPTY_CHANGE_CONTEXT_MARKER)
        {
            if parsed_lines == 0 {
                return Err(empty_chunk_error());
            }
            break;
        }
        match line.chars().next() {
            Some(' ') => {
                chunk.old_lines.push(line[1..].to_string());
                chunk.new_lines.push(line[1..].to_string());
            }
            Some('+') => {
                chunk.new_lines.push(line[1..].to_string());
            }
            Some('-') => {
                chunk.old_lines.push(line[1..].to_string());
            }
            _ => {
                return Err(InvalidHunkError {
                    message: format!(
                        "Unexpected line found in update hunk: '{line}'. Every line should start with ' ' (context line), '+' (added line), or '-' (removed line)"
                    ),
                    line_number: line_number + start_index + parsed_lines,
                });
            }
        }
        parsed_lines += 1;
    }

    Ok((chunk, parsed_lines + start_index))
}

#[cfg(test)]
fn parse_hunks(patch: &str) -> Result<Vec<Hunk>, ParseError> {
    parse_patch(patch).map(|patch| patch.hunks)
}

#[test]
fn test_parse_patch() {
    assert_eq!(
        parse_hunks(""),
        Err(InvalidPatchError {
            message: "The patch is empty".to_string(),
            line_number: 1,
        })
    );
    assert_eq!(
        parse_hunks("bad"),
        Err(InvalidPatchError {
            message: "The first line of the patch must be '*** Begin Patch'".to_string(),
            line_number: 1,
        })
    );
    assert_eq!(
        parse_hunks("*** Begin Patch\nbad"),
        Err(InvalidPatchError {
            message: "The last line of the patch must be '*** End Patch'".to_string(),
            line_number: 2,
        })
    );
    assert_eq!(
        parse_hunks(
            "*** Begin Patch\n\
             *** Update File: test.py\n\
             *** End Patch"
        ),
        Err(InvalidHunkError {
            message: "Update file hunk for path 'test.py' is empty".to_string(),
            line_number: 2,
        })
    );
    assert_eq!(
        parse_hunks(
            "*** Begin Patch\n\
             *** End Patch"
        ),
        Ok(Vec::new())
    );
    assert_eq!(
        parse_hunks(
            "*** Begin Patch\n\
             *** Add File: path/add.py\n\
             +abc\n\
             +def\n\
             *** Delete File: path/delete.py\n\
             *** Update File: path/update.py\n\
             *** Move to: path/update2.py\n\
             @@ def f():\n\
             -    pass\n\
             +    return 123\n\
             *** End Patch"
        ),
        Ok(vec![
            AddFile {
                path: PathBuf::from("path/add.py"),
                contents: "abc\ndef\n".to_string()
            },
            DeleteFile {
                path: PathBuf::from("path/delete.py")
            },
            UpdateFile {
                path: PathBuf::from("path/update.py"),
                move_path: Some(PathBuf::from("path/update2.py")),
                chunks: vec![UpdateFileChunk {
                    change_context: Some("def f():".to_string()),
                    old_lines: vec!["    pass".to_string()],
                    new_lines: vec!["    return 123".to_string()],
                    is_end_of_file: false
                }]
            }
        ])
    );
    // Update hunk followed by another hunk (Add File).
    assert_eq!(
        parse_hunks(
            "*** Begin Patch\n\
             *** Update File: file.py\n\
             @@\n\
             +line\n\
             *** Add File: other.py\n\
             +content\n\
             *** End Patch"
        ),
        Ok(vec![
            UpdateFile {
                path: PathBuf::from("file.py"),
                move_path: None,
                chunks: vec![UpdateFileChunk {
                    change_context: None,
                    old_lines: vec![],
                    new_lines: vec!["line".to_string()],
                    is_end_of_file: false
                }],
            },
            AddFile {
                path: PathBuf::from("other.py"),
                contents: "content\n".to_string()
            }
        ])
    );

    // Update hunk without an explicit @@ header for the first chunk should parse.
    // Use a raw string to preserve the leading space diff marker on the context line.
    assert_eq!(
        parse_hunks(
            r#"*** Begin Patch
*** Update File: file2.py
 import foo
+bar
*** End Patch"#,
        ),
        Ok(vec![UpdateFile {
            path: PathBuf::from("file2.py"),
            move_path: None,
            chunks: vec![UpdateFileChunk {
                change_context: None,
                old_lines: vec!["import foo".to_string()],
                new_lines: vec!["import foo".to_string(), "bar".to_string()],
                is_end_of_file: false,
            }],
        }])
    );
}

#[test]
fn test_parse_patch_rejects_empty_add_and_unknown_header() {
    assert_eq!(
        parse_hunks("*** Begin Patch\n*** Add File: a.txt\n*** End Patch"),
        Err(InvalidHunkError {
            message: "Add file hunk for path 'a.txt' is empty".to_string(),
            line_number: 2,
        })
    );
    assert_eq!(
        parse_hunks("*** Begin Patch\n*** Delete File: a.txt\n+stray\n*** End Patch"),
        Err(InvalidHunkError {
            message: "'+stray' is not a valid hunk header. \
            Valid hunk headers: '*** Add File: {path}', '*** Delete File: {path}', '*** Update File: {path}'"
                .to_string(),
            line_number: 3,
        })
    );
}

#[test]
fn test_parse_patch_reports_original_line_numbers() {
    // Two leading blank lines shift every reported line number.
    let patch = "\n\n*** Begin Patch\n*** Update File: a.txt\n@@\n foo\n?bar\n*** End Patch";
    let err = parse_patch(patch).unwrap_err();
    assert_eq!(err.line_number(), 7);
    // Parsing is deterministic.
    assert_eq!(parse_patch(patch).unwrap_err(), err);
}

#[test]
fn test_blank_line_terminates_chunk() {
    assert_eq!(
        parse_hunks(
            "*** Begin Patch\n\
             *** Update File: a.txt\n\
             @@\n\
             -a\n\
             +A\n\
             \n\
             @@ fn b\n\
             -b\n\
             +B\n\
             *** End Patch"
        ),
        Ok(vec![UpdateFile {
            path: PathBuf::from("a.txt"),
            move_path: None,
            chunks: vec![
                UpdateFileChunk {
                    change_context: None,
                    old_lines: vec!["a".to_string()],
                    new_lines: vec!["A".to_string()],
                    is_end_of_file: false,
                },
                UpdateFileChunk {
                    change_context: Some("fn b".to_string()),
                    old_lines: vec!["b".to_string()],
                    new_lines: vec!["B".to_string()],
                    is_end_of_file: false,
                },
            ],
        }])
    );
    // After a blank line a new chunk must start with a marker.
    assert_eq!(
        parse_hunks("*** Begin Patch\n*** Update File: a.txt\n@@\n-a\n+A\n\n-b\n*** End Patch"),
        Err(InvalidHunkError {
            message: "Expected update hunk to start with a @@ context marker, got: '-b'"
                .to_string(),
            line_number: 7,
        })
    );
}

#[test]
fn test_parse_one_hunk() {
    assert_eq!(
        parse_one_hunk(&["bad"], 234),
        Err(InvalidHunkError {
            message: "'bad' is not a valid hunk header. \
            Valid hunk headers: '*** Add File: {path}', '*** Delete File: {path}', '*** Update File: {path}'".to_string(),
            line_number: 234
        })
    );
    // Other edge cases are already covered by tests above/below.
}

#[test]
fn test_update_file_chunk() {
    assert_eq!(
        parse_update_file_chunk(&["bad"], 123, false),
        Err(InvalidHunkError {
            message: "Expected update hunk to start with a @@ context marker, got: 'bad'"
                .to_string(),
            line_number: 123
        })
    );
    assert_eq!(
        parse_update_file_chunk(&["@@"], 123, false),
        Err(InvalidHunkError {
            message: "Update hunk does not contain any lines".to_string(),
            line_number: 124
        })
    );
    assert_eq!(
        parse_update_file_chunk(&["@@", "bad"], 123, false),
        Err(InvalidHunkError {
            message:  "Unexpected line found in update hunk: 'bad'. \
                       Every line should start with ' ' (context line), '+' (added line), or '-' (removed line)".to_string(),
            line_number: 124
        })
    );
    assert_eq!(
        parse_update_file_chunk(&["@@", " ok", "bad"], 123, false),
        Err(InvalidHunkError {
            message:  "Unexpected line found in update hunk: 'bad'. \
                       Every line should start with ' ' (context line), '+' (added line), or '-' (removed line)".to_string(),
            line_number: 125
        })
    );
    assert_eq!(
        parse_update_file_chunk(&["@@", "*** End of File"], 123, false),
        Err(InvalidHunkError {
            message: "Update hunk does not contain any lines".to_string(),
            line_number: 124
        })
    );
    assert_eq!(
        parse_update_file_chunk(
            &[
                "@@ change_context",
                " ",
                " context",
                "-remove",
                "+add",
                " context2",
                "*** End Patch",
            ],
            123,
            false
        ),
        Ok((
            (UpdateFileChunk {
                change_context: Some("change_context".to_string()),
                old_lines: vec![
                    "".to_string(),
                    "context".to_string(),
                    "remove".to_string(),
                    "context2".to_string()
                ],
                new_lines: vec![
                    "".to_string(),
                    "context".to_string(),
                    "add".to_string(),
                    "context2".to_string()
                ],
                is_end_of_file: false
            }),
            6
        ))
    );
    assert_eq!(
        parse_update_file_chunk(&["@@", "+line", "*** End of File"], 123, false),
        Ok((
            (UpdateFileChunk {
                change_context: None,
                old_lines: vec![],
                new_lines: vec!["line".to_string()],
                is_end_of_file: true
            }),
            3
        ))
    );
}
