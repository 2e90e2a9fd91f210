//! Status reporter: read-only projections of task state.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};

use bridge::{
    Cursor, Page, PageRequest, RegistryError, Task, TaskFilter, TaskId, TaskStatus,
    TaskStatusView, TaskStore, Timestamp,
};

/// Serves task status to pollers and subscribers. Performs no writes.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn TaskStore>,
    poll_interval: Duration,
}

enum Watch {
    Emit(TaskStatusView),
    Waiting {
        status: TaskStatus,
        updated_at: Timestamp,
    },
    Finished,
}

impl StatusReporter {
    /// Subscriptions created by this reporter re-read the store every
    /// `poll_interval`.
    pub fn new(store: Arc<dyn TaskStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Current view of the task, including its attempt history.
    pub async fn get_status(&self, task_id: TaskId) -> Result<TaskStatusView, RegistryError> {
        self.store.view(task_id).await
    }

    /// Streams a view now and again after every change, ending after the
    /// first terminal view.
    ///
    /// Fails before the stream starts if the task does not exist. The store is
    /// re-read every poll interval, so any [`TaskStore`] implementation works.
    pub async fn subscribe(
        &self,
        task_id: TaskId,
    ) -> Result<BoxStream<'static, Result<TaskStatusView, RegistryError>>, RegistryError> {
        let first = self.store.view(task_id).await?;
        let store = self.store.clone();
        let interval = self.poll_interval;

        let views = stream::try_unfold(Watch::Emit(first), move |watch| {
            let store = store.clone();
            async move {
                match watch {
                    Watch::Finished => Ok::<_, RegistryError>(None),
                    Watch::Emit(view) => {
                        let next = after_emit(&view);
                        Ok(Some((view, next)))
                    }
                    Watch::Waiting { status, updated_at } => loop {
                        tokio::time::sleep(interval).await;
                        let view = store.view(task_id).await?;
                        if view.status != status || view.updated_at != updated_at {
                            let next = after_emit(&view);
                            break Ok(Some((view, next)));
                        }
                    },
                }
            }
        });
        Ok(views.boxed())
    }

    /// One page of views, oldest task first.
    pub async fn list(
        &self,
        filter: &TaskFilter,
        page: PageRequest,
    ) -> Result<Page<TaskStatusView>, RegistryError> {
        let tasks = self.store.list(filter, page).await?;
        let mut items = Vec::with_capacity(tasks.items.len());
        for task in &tasks.items {
            items.push(self.store.view(task.id).await?);
        }
        Ok(Page {
            items,
            next_cursor: tasks.next_cursor,
        })
    }

    /// Lazily walks every matching task, resuming after `start` if given.
    pub fn stream_tasks(
        &self,
        filter: TaskFilter,
        start: Option<Cursor>,
    ) -> BoxStream<'_, Result<Task, RegistryError>> {
        bridge::task_stream(self.store.as_ref(), filter, start, bridge::ports::DEFAULT_PAGE_SIZE)
    }
}

fn after_emit(view: &TaskStatusView) -> Watch {
    if view.status.is_terminal() {
        Watch::Finished
    } else {
        Watch::Waiting {
            status: view.status,
            updated_at: view.updated_at,
        }
    }
}
