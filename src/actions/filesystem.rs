//! 沙箱文件系统动作
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! FileReadAction 只读，FileWriteAction 写入后通过回读内容做自定义谓词校验。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::actions::{Action, ActionCall, Observation, RawOutcome, VerificationStrategy};

/// 沙箱文件系统：绑定根目录，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 将相对路径解析到根目录下；目标可以尚不存在，但不能包含 `..` 或绝对路径跳出根目录
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let trimmed = path.trim().trim_start_matches("./");
        let candidate = Path::new(trimmed);
        let relative = if candidate.is_absolute() {
            candidate
                .strip_prefix(&self.root_dir)
                .map_err(|_| format!("Path escapes workspace: {}", path))?
                .to_path_buf()
        } else {
            candidate.to_path_buf()
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(format!("Path escapes workspace: {}", path));
        }
        Ok(self.root_dir.join(relative))
    }

    pub fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|e| format!("Read failed: {}", e))
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<PathBuf, String> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent).map_err(|e| format!("Create dir failed: {}", e))?;
        }
        std::fs::write(&resolved, content).map_err(|e| format!("Write failed: {}", e))?;
        Ok(resolved)
    }
}

/// 读取文件内容（只读）
pub struct FileReadAction {
    fs: SafeFs,
}

impl FileReadAction {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Action for FileReadAction {
    fn name(&self) -> &str {
        "file_read"
    }

    fn description(&self) -> &str {
        "Read a text file inside the workspace. Params: {\"path\": \"relative/path\"}"
    }

    fn state_changing(&self) -> bool {
        false
    }

    fn verification(&self) -> VerificationStrategy {
        VerificationStrategy::None
    }

    async fn invoke(&self, call: &ActionCall) -> Result<RawOutcome, String> {
        let ActionCall::FileRead { path } = call else {
            return Err(format!("file_read cannot run {}", call.name()));
        };
        self.fs.read_file(path).map(RawOutcome::output)
    }
}

/// 写入文件；校验方式为回读内容是否一致
pub struct FileWriteAction {
    fs: SafeFs,
}

impl FileWriteAction {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            fs: SafeFs::new(root),
        }
    }
}

#[async_trait]
impl Action for FileWriteAction {
    fn name(&self) -> &str {
        "file_write"
    }

    fn description(&self) -> &str {
        "Write a text file inside the workspace (creates parent dirs). Params: {\"path\": \"...\", \"content\": \"...\"}"
    }

    fn state_changing(&self) -> bool {
        true
    }

    fn verification(&self) -> VerificationStrategy {
        VerificationStrategy::CustomPredicate {
            description: "file content read back equals written content".to_string(),
        }
    }

    async fn invoke(&self, call: &ActionCall) -> Result<RawOutcome, String> {
        let ActionCall::FileWrite { path, content } = call else {
            return Err(format!("file_write cannot run {}", call.name()));
        };
        let written = self.fs.write_file(path, content)?;
        Ok(RawOutcome::output(format!(
            "wrote {} bytes to {}",
            content.len(),
            written.display()
        )))
    }

    async fn observe(&self, call: &ActionCall, _outcome: &RawOutcome) -> Observation {
        let ActionCall::FileWrite { path, content } = call else {
            return Observation::Inconclusive(format!("cannot observe {}", call.name()));
        };
        match self.fs.read_file(path) {
            Ok(actual) if actual == *content => {
                Observation::Confirmed(format!("{} holds {} bytes as written", path, actual.len()))
            }
            Ok(actual) => Observation::Contradicted(format!(
                "{} holds {} bytes, expected {}",
                path,
                actual.len(),
                content.len()
            )),
            Err(e) => Observation::Inconclusive(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_blocks_escape() {
        let dir = TempDir::new().unwrap();
        let fs = SafeFs::new(dir.path());
        assert!(fs.resolve("notes/a.txt").is_ok());
        assert!(fs.resolve("../etc/passwd").is_err());
        assert!(fs.resolve("/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_write_then_observe_confirms() {
        let dir = TempDir::new().unwrap();
        let action = FileWriteAction::new(dir.path());
        let call = ActionCall::FileWrite {
            path: "out/hello.txt".into(),
            content: "hi there".into(),
        };
        let outcome = action.invoke(&call).await.unwrap();
        assert!(matches!(
            action.observe(&call, &outcome).await,
            Observation::Confirmed(_)
        ));

        std::fs::write(dir.path().join("out/hello.txt"), "tampered").unwrap();
        assert!(matches!(
            action.observe(&call, &outcome).await,
            Observation::Contradicted(_)
        ));
    }

    #[tokio::test]
    async fn test_read_missing_file_errors() {
        let dir = TempDir::new().unwrap();
        let action = FileReadAction::new(dir.path());
        let call = ActionCall::FileRead {
            path: "missing.txt".into(),
        };
        assert!(action.invoke(&call).await.is_err());
    }
}
