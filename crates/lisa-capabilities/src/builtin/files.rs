//! Workspace file access: read, write and list.
//!
//! Paths are relative to the context workspace. Absolute paths and `..`
//! components are rejected before any filesystem call; symlinks are then
//! followed and the real location must still be inside the workspace.

use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, warn};

use lisa_core::error::{LisaError, Result};
use lisa_core::traits::Capability;
use lisa_core::types::{CapabilityContext, CapabilityOutput};

/// Resolve `path` inside `workspace`, refusing anything that could escape it.
pub fn resolve_in_workspace(workspace: &Path, path: &str) -> Result<PathBuf> {
    let relative = Path::new(path);
    for component in relative.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(LisaError::PermanentBackend(format!(
                    "path '{}' escapes the workspace",
                    path
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(LisaError::PermanentBackend(format!(
                    "absolute path '{}' not allowed",
                    path
                )))
            }
        }
    }
    Ok(workspace.join(relative))
}

/// [`resolve_in_workspace`], then follow symlinks and check where the path
/// really lands. For a path that does not exist yet the nearest existing
/// ancestor decides; a dangling symlink on the way is refused.
pub async fn confine_to_workspace(workspace: &Path, path: &str) -> Result<PathBuf> {
    let resolved = resolve_in_workspace(workspace, path)?;
    let root = match tokio::fs::canonicalize(workspace).await {
        Ok(root) => root,
        // No workspace yet, so nothing inside it can be a link.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(resolved),
        Err(e) => return Err(e.into()),
    };

    let mut ancestor = resolved.as_path();
    let mut tail: Vec<&OsStr> = Vec::new();
    let real = loop {
        match tokio::fs::canonicalize(ancestor).await {
            Ok(real) => break tail.iter().rev().fold(real, |acc, part| acc.join(part)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if tokio::fs::symlink_metadata(ancestor).await.is_ok() {
                    return Err(LisaError::PermanentBackend(format!(
                        "path '{}' goes through a dangling symlink",
                        path
                    )));
                }
            }
            Err(e) => return Err(e.into()),
        }
        match (ancestor.file_name(), ancestor.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                ancestor = parent;
            }
            _ => return Ok(resolved),
        }
    };

    if real.starts_with(&root) {
        Ok(resolved)
    } else {
        warn!(path, real = %real.display(), "Path leaves the workspace through a symlink");
        Err(LisaError::PermanentBackend(format!(
            "path '{}' escapes the workspace",
            path
        )))
    }
}

fn parse<T: serde::de::DeserializeOwned>(capability: &str, input: serde_json::Value) -> Result<T> {
    serde_json::from_value(input).map_err(|e| LisaError::Validation(format!("{}: {}", capability, e)))
}

pub struct FileReadCapability;

#[derive(Deserialize)]
struct ReadInput {
    path: String,
}

impl Capability for FileReadCapability {
    fn name(&self) -> &str {
        "files.read"
    }

    fn description(&self) -> &str {
        "Read a UTF-8 file from the workspace."
    }

    fn invoke(&self, input: serde_json::Value, ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move {
            let params: ReadInput = parse(self.name(), input)?;
            let path = confine_to_workspace(&ctx.workspace, &params.path).await?;
            debug!(path = %path.display(), "Reading file");

            match tokio::fs::read_to_string(&path).await {
                Ok(content) => Ok(CapabilityOutput::success(serde_json::json!({
                    "path": params.path,
                    "content": content,
                }))),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Ok(CapabilityOutput::failure(format!("File not found: {}", params.path)))
                }
                Err(e) => Ok(CapabilityOutput::failure(format!("{}: {}", params.path, e))),
            }
        })
    }
}

pub struct FileWriteCapability;

#[derive(Deserialize)]
struct WriteInput {
    path: String,
    #[serde(default)]
    content: String,
}

impl Capability for FileWriteCapability {
    fn name(&self) -> &str {
        "files.write"
    }

    fn description(&self) -> &str {
        "Write a UTF-8 file into the workspace, creating parent directories."
    }

    fn invoke(&self, input: serde_json::Value, ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move {
            let params: WriteInput = parse(self.name(), input)?;
            let path = confine_to_workspace(&ctx.workspace, &params.path).await?;
            debug!(path = %path.display(), bytes = params.content.len(), "Writing file");

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, params.content.as_bytes()).await?;

            Ok(CapabilityOutput::success(serde_json::json!({
                "path": params.path,
                "bytes_written": params.content.len(),
            })))
        })
    }
}

pub struct FileListCapability;

#[derive(Deserialize)]
struct ListInput {
    #[serde(default = "default_list_path")]
    path: String,
}

fn default_list_path() -> String { ".".to_string() }

impl Capability for FileListCapability {
    fn name(&self) -> &str {
        "files.list"
    }

    fn description(&self) -> &str {
        "List a workspace directory."
    }

    fn invoke(&self, input: serde_json::Value, ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityOutput>> {
        Box::pin(async move {
            let input = if input.is_null() { serde_json::json!({}) } else { input };
            let params: ListInput = parse(self.name(), input)?;
            let dir = confine_to_workspace(&ctx.workspace, &params.path).await?;

            if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
                return Ok(CapabilityOutput::failure(format!("Not a directory: {}", params.path)));
            }

            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let meta = entry.metadata().await.ok();
                let is_dir = meta.as_ref().is_some_and(|m| m.is_dir());
                files.push(serde_json::json!({
                    "name": entry.file_name().to_string_lossy(),
                    "type": if is_dir { "directory" } else { "file" },
                    "size": if is_dir { None } else { meta.map(|m| m.len()) },
                }));
            }
            files.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

            Ok(CapabilityOutput::success(serde_json::json!({
                "path": params.path,
                "files": files,
            })))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lisa_core::error::ErrorKind;
    use serde_json::json;

    fn ctx(dir: &tempfile::TempDir) -> CapabilityContext {
        CapabilityContext {
            workspace: dir.path().to_path_buf(),
            ..CapabilityContext::default()
        }
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let ws = Path::new("/srv/ws");
        assert_eq!(resolve_in_workspace(ws, "a/b.txt").unwrap(), ws.join("a/b.txt"));
        assert_eq!(resolve_in_workspace(ws, "./a").unwrap(), ws.join("./a"));

        let err = resolve_in_workspace(ws, "../secret").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentBackend);
        assert!(resolve_in_workspace(ws, "a/../../b").is_err());
        assert!(resolve_in_workspace(ws, "/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();

        let out = FileWriteCapability
            .invoke(json!({"path": "notes/today.md", "content": "hello"}), ctx(&dir))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.output["bytes_written"], 5);

        let out = FileReadCapability
            .invoke(json!({"path": "notes/today.md"}), ctx(&dir))
            .await
            .unwrap();
        assert_eq!(out.output["content"], "hello");
    }

    #[tokio::test]
    async fn test_read_missing_file_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileReadCapability
            .invoke(json!({"path": "nope.txt"}), ctx(&dir))
            .await
            .unwrap();
        assert!(!out.success);
        assert!(out.error.unwrap().contains("File not found"));
    }

    #[tokio::test]
    async fn test_read_requires_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileReadCapability.invoke(json!({}), ctx(&dir)).await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_write_outside_workspace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileWriteCapability
            .invoke(json!({"path": "../evil", "content": "x"}), ctx(&dir))
            .await
            .unwrap_err();
        assert!(matches!(err, LisaError::PermanentBackend(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_workspace_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "top secret").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), dir.path().join("alias.txt")).unwrap();

        let err = FileReadCapability
            .invoke(json!({"path": "link/secret.txt"}), ctx(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentBackend);
        assert!(FileReadCapability
            .invoke(json!({"path": "alias.txt"}), ctx(&dir))
            .await
            .is_err());

        let err = FileWriteCapability
            .invoke(json!({"path": "link/nested/new.txt", "content": "x"}), ctx(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentBackend);
        assert!(!outside.path().join("nested").exists());

        assert!(FileListCapability
            .invoke(json!({"path": "link"}), ctx(&dir))
            .await
            .is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dangling_symlink_rejected_and_inner_links_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path().join("later.txt"), dir.path().join("dangling")).unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("shortcut")).unwrap();

        let err = FileWriteCapability
            .invoke(json!({"path": "dangling", "content": "x"}), ctx(&dir))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermanentBackend);
        assert!(!outside.path().join("later.txt").exists());

        let out = FileWriteCapability
            .invoke(json!({"path": "shortcut/ok.txt", "content": "fine"}), ctx(&dir))
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(std::fs::read_to_string(dir.path().join("real/ok.txt")).unwrap(), "fine");
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "bb").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();

        let out = FileListCapability.invoke(json!(null), ctx(&dir)).await.unwrap();
        let files = out.output["files"].as_array().unwrap();
        let names: Vec<&str> = files.iter().map(|f| f["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(files[1]["size"], 2);
        assert_eq!(files[2]["type"], "directory");
        assert!(files[2]["size"].is_null());
    }

    #[tokio::test]
    async fn test_list_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out = FileListCapability
            .invoke(json!({"path": "missing"}), ctx(&dir))
            .await
            .unwrap();
        assert!(!out.success);
    }
}
