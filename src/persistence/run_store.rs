//! 运行状态存储
//!
//! 目录结构：
//! - `<state_dir>/runs/<runId>.json`：每次运行一份
//! - `<state_dir>/runner-state.json`：最近一次运行
//! - `<state_dir>/metrics.json`：最近一次的指标快照
//!
//! 所有文件整体原子替换，崩溃不会破坏上一次完整写入的内容。

use std::path::{Path, PathBuf};

use crate::core::state::Run;
use crate::observability::MetricsSnapshot;
use crate::persistence::{check_name, write_atomic, StoreError};

pub const LATEST_FILE: &str = "runner-state.json";
pub const METRICS_FILE: &str = "metrics.json";
const RUNS_DIR: &str = "runs";

#[derive(Debug, Clone)]
pub struct RunStore {
    state_dir: PathBuf,
}

impl RunStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        self.state_dir.join(RUNS_DIR).join(format!("{run_id}.json"))
    }

    /// 写入 run 文件与 latest 文件，返回 run 文件路径
    pub fn save(&self, run: &Run) -> Result<PathBuf, StoreError> {
        check_name(&run.run_id)?;
        let bytes = serde_json::to_vec_pretty(run)?;
        let path = self.run_path(&run.run_id);
        write_atomic(&path, &bytes)?;
        write_atomic(&self.state_dir.join(LATEST_FILE), &bytes)?;
        tracing::debug!(run_id = %run.run_id, path = %path.display(), "run state saved");
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> Result<Run, StoreError> {
        check_name(run_id)?;
        let path = self.run_path(run_id);
        if !path.exists() {
            return Err(StoreError::NotFound(run_id.to_string()));
        }
        read_json(&path)
    }

    /// 最近一次运行；从未运行过时为 None
    pub fn load_latest(&self) -> Result<Option<Run>, StoreError> {
        let path = self.state_dir.join(LATEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }

    /// 已持久化的 runId，按文件名排序
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.state_dir.join(RUNS_DIR);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut ids: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_suffix(".json"))
                    .map(str::to_string)
            })
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn save_metrics(&self, snapshot: &MetricsSnapshot) -> Result<PathBuf, StoreError> {
        let path = self.state_dir.join(METRICS_FILE);
        write_atomic(&path, &serde_json::to_vec_pretty(snapshot)?)?;
        Ok(path)
    }

    pub fn load_metrics(&self) -> Result<Option<MetricsSnapshot>, StoreError> {
        let path = self.state_dir.join(METRICS_FILE);
        if !path.exists() {
            return Ok(None);
        }
        read_json(&path).map(Some)
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let raw = std::fs::read_to_string(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::HandlerOutput;
    use crate::core::state::{HandlerResult, HandlerStatus, RunStatus};
    use serde_json::json;

    fn sample_run(id: &str) -> Run {
        let mut run = Run::start(id);
        run.push(HandlerResult::from_output("a", id, HandlerOutput::ok(json!({"x": 1})), 1, false));
        run.push(HandlerResult::unavailable("b", id, HandlerStatus::NoExecute));
        run.push(HandlerResult::execution_failed("c", id, "boom", 3));
        run.finish(RunStatus::Completed);
        run
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let run = sample_run("run_100");
        let path = store.save(&run).unwrap();
        assert!(path.ends_with("runs/run_100.json"));

        let loaded = store.load("run_100").unwrap();
        assert_eq!(loaded.run_id, run.run_id);
        assert_eq!(loaded.results.len(), 3);
        let statuses: Vec<_> = loaded.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![HandlerStatus::Ok, HandlerStatus::NoExecute, HandlerStatus::Error]
        );
        assert_eq!(loaded, run);
    }

    #[test]
    fn test_latest_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        assert!(store.load_latest().unwrap().is_none());
        store.save(&sample_run("run_1")).unwrap();
        store.save(&sample_run("run_2")).unwrap();
        assert_eq!(store.load_latest().unwrap().unwrap().run_id, "run_2");
        assert_eq!(store.list().unwrap(), vec!["run_1", "run_2"]);
        assert!(store.load("run_1").is_ok());
    }

    #[test]
    fn test_load_unknown_and_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        assert!(matches!(store.load("run_404"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.load("../x"), Err(StoreError::InvalidName(_))));
    }

    #[test]
    fn test_metrics_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let snapshot = MetricsSnapshot {
            llm_calls: 2,
            total_tokens: 40,
            ..MetricsSnapshot::default()
        };
        store.save_metrics(&snapshot).unwrap();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join(METRICS_FILE)).unwrap())
                .unwrap();
        assert!(raw.get("lastUpdated").is_some());
        assert_eq!(store.load_metrics().unwrap().unwrap(), snapshot);
    }
}
