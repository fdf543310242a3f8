//! Service artifacts.
//!
//! An artifact is the parsed form of an annotated Markdown document that
//! declares everything one service needs to run: the files to materialize,
//! the dependency specifiers, the run command, and optional HTTP checks.
//!
//! The on-disk format is a plain Markdown README with fenced code blocks
//! whose info string starts with `markpact:`:
//!
//! ````markdown
//! # todo-api
//!
//! ```markpact:deps
//! fastapi
//! uvicorn
//! ```
//!
//! ```markpact:file path=main.py
//! ...
//! ```
//!
//! ```markpact:run
//! uvicorn main:app --port 8000
//! ```
//!
//! ```markpact:test
//! GET /health 200
//! ```
//! ````
//!
//! When no run block is present, a run command is inferred from well-known
//! entrypoint filenames.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One file to be written into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the sandbox root.
    pub path: PathBuf,

    /// Exact file contents.
    pub bytes: Vec<u8>,
}

/// One declared HTTP check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheck {
    /// HTTP method.
    pub method: String,

    /// Request path.
    pub path: String,

    /// Optional request body.
    pub body: Option<String>,

    /// Expected response status.
    pub expect_status: u16,
}

/// Parsed service artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Document title (first level-one heading).
    pub title: String,

    /// Files to materialize, in declaration order.
    pub files: Vec<ArtifactFile>,

    /// Dependency specifiers, in declaration order, as opaque strings.
    pub deps: Vec<String>,

    /// Shell command that starts the service.
    pub run: String,

    /// Declared HTTP checks.
    pub tests: Vec<HttpCheck>,
}

impl Artifact {
    /// Read and parse an artifact from a Markdown file.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ArtifactError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ArtifactError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw)
    }

    /// Parse an artifact from Markdown text.
    ///
    /// # Errors
    ///
    /// Returns [`ArtifactError`] if a block is malformed, a declared file
    /// path escapes the sandbox, or no run command can be determined.
    pub fn parse(markdown: &str) -> Result<Self, ArtifactError> {
        let mut title = String::new();
        let mut files = Vec::new();
        let mut deps = Vec::new();
        let mut run: Option<String> = None;
        let mut tests = Vec::new();

        let mut block: Option<(BlockKind, String)> = None;

        for line in markdown.lines() {
            if block.is_some() {
                if line.trim_end() == "```" {
                    let Some((kind, body)) = block.take() else {
                        continue;
                    };
                    match kind {
                        BlockKind::File(path) => files.push(ArtifactFile {
                            path,
                            bytes: body.into_bytes(),
                        }),
                        BlockKind::Deps => deps.extend(
                            body.lines()
                                .map(str::trim)
                                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                                .map(String::from),
                        ),
                        BlockKind::Run => {
                            let cmd = body.trim().to_string();
                            if !cmd.is_empty() && run.is_none() {
                                run = Some(cmd);
                            }
                        },
                        BlockKind::Test => {
                            for check_line in body.lines() {
                                if let Some(check) = parse_check(check_line)? {
                                    tests.push(check);
                                }
                            }
                        },
                        BlockKind::Ignored => {},
                    }
                } else if let Some((_, body)) = &mut block {
                    body.push_str(line);
                    body.push('\n');
                }
                continue;
            }

            if let Some(info) = line.trim_end().strip_prefix("```") {
                if let Some(kind) = info.trim().strip_prefix("markpact:") {
                    block = Some((parse_block_kind(kind)?, String::new()));
                }
                // Plain code fences are documentation, not declarations.
                continue;
            }

            if title.is_empty() {
                if let Some(heading) = line.strip_prefix("# ") {
                    title = heading.trim().to_string();
                }
            }
        }

        let run = match run {
            Some(cmd) => cmd,
            None => infer_run_command(&files).ok_or(ArtifactError::MissingRunCommand)?,
        };

        Ok(Self {
            title,
            files,
            deps,
            run,
            tests,
        })
    }
}

enum BlockKind {
    File(PathBuf),
    Deps,
    Run,
    Test,
    /// A block kind this engine does not consume (build and deployment
    /// annotations belong to other tools).
    Ignored,
}

fn parse_block_kind(info: &str) -> Result<BlockKind, ArtifactError> {
    let mut parts = info.split_whitespace();
    let kind = parts.next().unwrap_or_default();

    match kind {
        "file" => {
            let attr = parts
                .next()
                .ok_or_else(|| ArtifactError::MalformedBlock("file block without path".into()))?;
            let path = attr.strip_prefix("path=").unwrap_or(attr);
            Ok(BlockKind::File(safe_relative_path(path)?))
        },
        "deps" => Ok(BlockKind::Deps),
        "run" => Ok(BlockKind::Run),
        "test" => Ok(BlockKind::Test),
        _ => Ok(BlockKind::Ignored),
    }
}

/// Validate that a declared file path stays inside the sandbox.
fn safe_relative_path(raw: &str) -> Result<PathBuf, ArtifactError> {
    let path = PathBuf::from(raw);
    let unsafe_component = path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });
    if raw.is_empty() || unsafe_component {
        return Err(ArtifactError::UnsafePath(raw.to_string()));
    }
    Ok(path)
}

/// Parse one `METHOD PATH [STATUS] [BODY...]` check line.
fn parse_check(line: &str) -> Result<Option<HttpCheck>, ArtifactError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 2 {
        return Err(ArtifactError::MalformedBlock(format!(
            "bad check line '{line}'"
        )));
    }
    let method = tokens[0];
    let path = tokens[1];

    let mut expect_status = 200;
    let mut body = None;
    if let Some(status) = tokens.get(2) {
        expect_status = status.parse().map_err(|_| {
            ArtifactError::MalformedBlock(format!("bad status in check line '{line}'"))
        })?;
        if tokens.len() > 3 {
            body = Some(tokens[3..].join(" "));
        }
    }

    Ok(Some(HttpCheck {
        method: method.to_uppercase(),
        path: path.to_string(),
        body,
        expect_status,
    }))
}

/// Infer a run command from well-known entrypoint filenames.
fn infer_run_command(files: &[ArtifactFile]) -> Option<String> {
    let names: Vec<&str> = files
        .iter()
        .filter_map(|f| f.path.file_name().and_then(|n| n.to_str()))
        .collect();

    for (entry, cmd) in [
        ("main.py", "python main.py"),
        ("app.py", "python app.py"),
        ("index.js", "node index.js"),
        ("server.js", "node server.js"),
        ("main.js", "node main.js"),
    ] {
        if names.contains(&entry) {
            return Some(cmd.to_string());
        }
    }
    None
}

/// Artifact errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// The artifact file could not be read.
    #[error("failed to read artifact {}: {source}", path.display())]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A fenced block was malformed.
    #[error("malformed artifact block: {0}")]
    MalformedBlock(String),

    /// A declared file path would escape the sandbox.
    #[error("unsafe file path in artifact: '{0}'")]
    UnsafePath(String),

    /// No run block and no inferrable entrypoint.
    #[error("artifact declares no run command")]
    MissingRunCommand,
}

#[cfg(test)]
mod tests {
    use super::*;

    const README: &str = r#"# todo-api

A small demo service.

```markpact:deps
fastapi
uvicorn
```

```markpact:file path=main.py
print("hello")
```

```markpact:file path=static/index.html
<html></html>
```

```markpact:run
uvicorn main:app --port 8000
```

```markpact:test
GET /health 200
POST /items 201 {"name":"x"}
```
"#;

    #[test]
    fn test_parse_full_artifact() {
        let artifact = Artifact::parse(README).unwrap();
        assert_eq!(artifact.title, "todo-api");
        assert_eq!(artifact.deps, vec!["fastapi", "uvicorn"]);
        assert_eq!(artifact.run, "uvicorn main:app --port 8000");

        assert_eq!(artifact.files.len(), 2);
        assert_eq!(artifact.files[0].path, PathBuf::from("main.py"));
        assert_eq!(artifact.files[0].bytes, b"print(\"hello\")\n");
        assert_eq!(artifact.files[1].path, PathBuf::from("static/index.html"));

        assert_eq!(artifact.tests.len(), 2);
        assert_eq!(
            artifact.tests[0],
            HttpCheck {
                method: "GET".into(),
                path: "/health".into(),
                body: None,
                expect_status: 200,
            }
        );
        assert_eq!(artifact.tests[1].body.as_deref(), Some(r#"{"name":"x"}"#));
    }

    #[test]
    fn test_run_command_inferred_from_entrypoint() {
        let artifact = Artifact::parse(
            "# svc\n\n```markpact:file path=server.js\nconsole.log(1)\n```\n",
        )
        .unwrap();
        assert_eq!(artifact.run, "node server.js");
    }

    #[test]
    fn test_missing_run_command_is_an_error() {
        let result = Artifact::parse("# svc\n\n```markpact:file path=notes.txt\nhi\n```\n");
        assert!(matches!(result, Err(ArtifactError::MissingRunCommand)));
    }

    #[test]
    fn test_escaping_paths_rejected() {
        for path in ["../evil.py", "/etc/passwd"] {
            let doc = format!("# svc\n\n```markpact:file path={path}\nx\n```\n");
            assert!(matches!(
                Artifact::parse(&doc),
                Err(ArtifactError::UnsafePath(_))
            ));
        }
    }

    #[test]
    fn test_plain_code_fences_ignored() {
        let artifact = Artifact::parse(
            "# svc\n\n```bash\nnot a declaration\n```\n\n```markpact:run\necho ok\n```\n",
        )
        .unwrap();
        assert!(artifact.files.is_empty());
        assert_eq!(artifact.run, "echo ok");
    }

    #[test]
    fn test_deps_comments_skipped() {
        let artifact = Artifact::parse(
            "# svc\n\n```markpact:deps\n# pinned below\nflask\n\n```\n\n```markpact:run\nr\n```\n",
        )
        .unwrap();
        assert_eq!(artifact.deps, vec!["flask"]);
    }
}
