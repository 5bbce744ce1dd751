//! Handler 产物存储
//!
//! 由 Dispatcher 注入到每个 handler 的上下文中；handler 不自行拼路径、建目录。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::persistence::{check_name, write_atomic, StoreError};

/// 产物存储能力：按 (run_id, name) 保存，返回可记录在结果中的路径
pub trait ArtifactStore: Send + Sync {
    fn save(&self, run_id: &str, name: &str, contents: &[u8]) -> Result<String, StoreError>;
}

/// 文件实现：`<root>/<run_id>/<name>`
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for FileArtifactStore {
    fn save(&self, run_id: &str, name: &str, contents: &[u8]) -> Result<String, StoreError> {
        check_name(run_id)?;
        check_name(name)?;
        let path = self.root.join(run_id).join(name);
        write_atomic(&path, contents)?;
        tracing::debug!(path = %path.display(), bytes = contents.len(), "artifact saved");
        Ok(path.display().to_string())
    }
}

/// 内存实现（测试用）
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    items: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, run_id: &str, name: &str) -> Option<Vec<u8>> {
        let items = match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        items.get(&format!("{run_id}/{name}")).cloned()
    }

    pub fn len(&self) -> usize {
        match self.items.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn save(&self, run_id: &str, name: &str, contents: &[u8]) -> Result<String, StoreError> {
        check_name(run_id)?;
        check_name(name)?;
        let key = format!("{run_id}/{name}");
        let mut items = match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        items.insert(key.clone(), contents.to_vec());
        Ok(format!("memory://{key}"))
    }
}
