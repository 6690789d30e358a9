//! 把耗时的解析或索引构建交给后台线程，结果经通道交回调用方。

use std::io;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("failed to start worker thread `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("worker `{0}` panicked before producing a result")]
    WorkerPanicked(String),
    #[error("worker `{0}` exited without producing a result")]
    Disconnected(String),
}

/// 后台任务的结果句柄。丢弃句柄即放弃结果，工作线程照常结束。
#[derive(Debug)]
pub struct JobHandle<T> {
    name: String,
    receiver: Receiver<T>,
    worker: Option<JoinHandle<()>>,
}

/// 在命名线程上运行 `job`。
pub fn spawn_job<T, F>(name: impl Into<String>, job: F) -> Result<JobHandle<T>, JobError>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let name = name.into();
    let (tx, receiver) = mpsc::channel();
    let worker_name = name.clone();
    let worker = thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let start = Instant::now();
            let value = job();
            let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
            if tx.send(value).is_err() {
                debug!(job = %worker_name, elapsed_ms, "任务结果无人接收，已丢弃");
            } else {
                debug!(job = %worker_name, elapsed_ms, "后台任务完成");
            }
        })
        .map_err(|source| JobError::Spawn {
            name: name.clone(),
            source,
        })?;
    Ok(JobHandle {
        name,
        receiver,
        worker: Some(worker),
    })
}

impl<T> JobHandle<T> {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 非阻塞轮询。尚未完成时返回 `None`；结果只能取走一次。
    pub fn try_take(&mut self) -> Option<Result<T, JobError>> {
        match self.receiver.try_recv() {
            Ok(value) => {
                self.worker = None;
                Some(Ok(value))
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.failure())),
        }
    }

    /// 阻塞等待结果。
    pub fn wait(mut self) -> Result<T, JobError> {
        match self.receiver.recv() {
            Ok(value) => Ok(value),
            Err(_) => Err(self.failure()),
        }
    }

    fn failure(&mut self) -> JobError {
        match self.worker.take().map(JoinHandle::join) {
            Some(Err(_)) => JobError::WorkerPanicked(self.name.clone()),
            _ => JobError::Disconnected(self.name.clone()),
        }
    }
}
