//! Batch runner for `inferportd run`: a fixed list of (mode, model) tasks,
//! each classifying one image, logged as `TASK n START` / `TASK n END`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use inferport_core::{Backend, ExecError, ExecMode, ModelDescriptor, ResultEnvelope};
use inferport_runtime::{ExecutionRouter, Task};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScheduledTask {
    pub mode: ExecMode,
    pub model: ModelDescriptor,
}

impl ScheduledTask {
    /// Parses `mode[:model]`, e.g. `offload:eff0`. Names are permissive:
    /// unknown modes run on CPU and unknown models use `mv3`.
    pub fn parse(raw: &str) -> Self {
        let (mode, model) = raw.split_once(':').unwrap_or((raw, ""));
        Self {
            mode: ExecMode::from_name(mode),
            model: ModelDescriptor::from_name(model),
        }
    }
}

/// Where each task's image comes from.
#[derive(Clone, Debug)]
pub enum ImageSource {
    /// The same file for every task.
    Single(PathBuf),
    /// `test<n>.jpg` for task `n` (1-based).
    PerTask(PathBuf),
}

impl ImageSource {
    pub fn path_for(&self, task_id: usize) -> PathBuf {
        match self {
            Self::Single(path) => path.clone(),
            Self::PerTask(dir) => dir.join(format!("test{task_id}.jpg")),
        }
    }

    fn load(&self, task_id: usize) -> Result<Bytes> {
        let path = self.path_for(task_id);
        read_image(&path)
    }
}

fn read_image(path: &Path) -> Result<Bytes> {
    let bytes =
        std::fs::read(path).with_context(|| format!("cannot read image {}", path.display()))?;
    Ok(Bytes::from(bytes))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
}

pub async fn run_schedule<B: Backend>(
    router: &ExecutionRouter<B>,
    schedule: &[ScheduledTask],
    images: &ImageSource,
    top_k: usize,
    concurrent: bool,
) -> Result<RunSummary> {
    ensure!(!schedule.is_empty(), "schedule has no tasks");

    let mut tasks = Vec::with_capacity(schedule.len());
    for (i, entry) in schedule.iter().enumerate() {
        let image = images.load(i + 1)?;
        tasks.push(Task::new(image, entry.model, top_k).with_mode(entry.mode));
    }

    let started = Instant::now();
    let mut summary = RunSummary::default();
    if concurrent {
        for (i, entry) in schedule.iter().enumerate() {
            log_start(i + 1, entry);
        }
        let results = router.run_batch(tasks).await;
        for (i, result) in results.iter().enumerate() {
            log_end(i + 1, result, &mut summary);
        }
    } else {
        for (i, (task, entry)) in tasks.into_iter().zip(schedule).enumerate() {
            log_start(i + 1, entry);
            let result = router.run_task(task).await;
            log_end(i + 1, &result, &mut summary);
        }
    }

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed = ?started.elapsed(),
        "ALL_TASKS_DONE"
    );
    Ok(summary)
}

fn log_start(task_id: usize, entry: &ScheduledTask) {
    info!(task_id, mode = %entry.mode, model = %entry.model, "TASK {task_id} START");
}

fn log_end(
    task_id: usize,
    result: &Result<ResultEnvelope, ExecError>,
    summary: &mut RunSummary,
) {
    match result {
        Ok(env) => {
            summary.succeeded += 1;
            let top1 = env.top1().map(|r| r.label.as_str()).unwrap_or("-");
            info!(
                task_id,
                backend = %env.backend,
                model = %env.model,
                top1,
                total_ms = env.timing_ms.total_ms(),
                "TASK {task_id} END"
            );
        }
        Err(err) => {
            summary.failed += 1;
            warn!(task_id, error = %err, timeout = err.is_timeout(), "TASK {task_id} END");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_permissive() {
        assert_eq!(
            ScheduledTask::parse("offload:eff0"),
            ScheduledTask {
                mode: ExecMode::Offload,
                model: ModelDescriptor::EFF0
            }
        );
        let t = ScheduledTask::parse("npu");
        assert_eq!(t.mode, ExecMode::Accelerator);
        assert_eq!(t.model, ModelDescriptor::MV3);
        let t = ScheduledTask::parse("quantum:resnet");
        assert_eq!(t.mode, ExecMode::Cpu);
        assert_eq!(t.model, ModelDescriptor::MV3);
    }

    #[test]
    fn per_task_images_are_numbered() {
        let src = ImageSource::PerTask(PathBuf::from("imgs"));
        assert_eq!(src.path_for(3), PathBuf::from("imgs/test3.jpg"));
        let src = ImageSource::Single(PathBuf::from("cat.jpg"));
        assert_eq!(src.path_for(7), PathBuf::from("cat.jpg"));
    }
}
