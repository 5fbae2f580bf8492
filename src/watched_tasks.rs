// This file is part of gpadcd, the Basin Cove GPADC sampler daemon
// Copyright (C) 2024 Pengutronix e.K.
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::{Context as AnyhowContext, Result};
use async_std::task;
use log::info;

// The daemon consists of a handful of tasks that are supposed to run forever
// (the SCU watcher and the web server). If any of them ends, be it with an
// error or not, the daemon has lost part of its function and should exit
// so that the service manager can restart it.
// WatchedTasks is a Future that completes with the result of the first of
// its tasks that completes.

type TaskResult = Result<()>;
type TaskHandle = task::JoinHandle<TaskResult>;

pub struct WatchedTasksBuilder {
    tasks: Vec<TaskHandle>,
}

pub struct WatchedTasks {
    tasks: Vec<TaskHandle>,
}

impl WatchedTasksBuilder {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Spawn an async task that runs until the end of the program
    pub fn spawn_task<S, F>(&mut self, name: S, future: F) -> Result<()>
    where
        S: Into<String>,
        F: Future<Output = TaskResult> + Send + 'static,
    {
        let task = task::Builder::new().name(name.into()).spawn(future)?;

        self.tasks.push(task);

        Ok(())
    }

    /// Stop accepting new tasks and return a Future that should be
    /// .awaited at the end of main()
    pub fn watch(self) -> WatchedTasks {
        info!("Spawned {} tasks", self.tasks.len());

        WatchedTasks { tasks: self.tasks }
    }
}

impl Future for WatchedTasks {
    type Output = TaskResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        for task in self.tasks.iter_mut() {
            let name = task.task().name().unwrap_or("<unknown>").to_owned();

            if let Poll::Ready(res) = Pin::new(task).poll(cx) {
                info!("Task {name} has completed");

                return Poll::Ready(res.with_context(|| format!("Failed in task {name}")));
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::{anyhow, Result};
    use async_std::channel::{unbounded, Sender};
    use async_std::future::timeout;
    use async_std::task::block_on;

    use super::{TaskResult, WatchedTasks, WatchedTasksBuilder};

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn setup_tasks() -> (WatchedTasks, Vec<Sender<TaskResult>>) {
        let mut wtb = WatchedTasksBuilder::new();

        // Each task waits for a message and completes with it
        let senders = (0..4)
            .map(|i| {
                let (tx, rx) = unbounded();

                wtb.spawn_task(format!("task-{i}"), async move { rx.recv().await? })
                    .unwrap();

                tx
            })
            .collect();

        (wtb.watch(), senders)
    }

    #[test]
    fn first_completion_ends_watch() -> Result<()> {
        let (mut wt, senders) = setup_tasks();

        let early = block_on(timeout(TIMEOUT, async { (&mut wt).await }));
        assert!(early.is_err());

        senders[2].try_send(Ok(()))?;

        let late = block_on(timeout(TIMEOUT, async { (&mut wt).await }));
        assert!(matches!(late, Ok(Ok(()))));

        Ok(())
    }

    #[test]
    fn errors_carry_task_name() -> Result<()> {
        let (mut wt, senders) = setup_tasks();

        senders[1].try_send(Err(anyhow!("broken")))?;

        let res = block_on(timeout(TIMEOUT, async { (&mut wt).await }))?;
        let err = res.unwrap_err();

        assert_eq!(format!("{err:#}"), "Failed in task task-1: broken");

        Ok(())
    }
}
