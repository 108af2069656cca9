//! Fixed pool of worker threads.
//!
//! Each worker pops one [`WorkItem`], runs it through the
//! [`RequestHandler`], writes the reply on the item's own connection and
//! hands the connection back to the dispatcher.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use vcache_config::{log_worker_debug, log_worker_warn};
use vcache_ipc::{write_frame, Compression, Message};

use crate::dispatcher::{ControlHandle, ControlMsg, WorkItem};
use crate::handler::RequestHandler;
use crate::queue::WorkQueue;

pub struct Worker {
    index: usize,
    queue: Arc<WorkQueue<WorkItem>>,
    handler: RequestHandler,
    control: ControlHandle,
    compression: Compression,
}

impl Worker {
    pub fn new(
        index: usize,
        queue: Arc<WorkQueue<WorkItem>>,
        handler: RequestHandler,
        control: ControlHandle,
        compression: Compression,
    ) -> Self {
        Self {
            index,
            queue,
            handler,
            control,
            compression,
        }
    }

    /// Serve until the queue is closed. Returns the number of requests served.
    pub fn run(self) -> u64 {
        let mut served = 0u64;
        while let Some(item) = self.queue.pop() {
            self.serve(item);
            served += 1;
        }
        log_worker_debug!("Worker exiting", worker = self.index, served = served);
        served
    }

    fn serve(&self, item: WorkItem) {
        let WorkItem {
            client,
            mut stream,
            id,
            request,
        } = item;
        let kind = request.kind();

        let response = self.handler.handle(client, request);
        let status = response.status();
        let reply = Message::response(response);

        match write_frame(&mut stream, &reply, self.compression) {
            Ok(bytes) => {
                log_worker_debug!(
                    "Replied",
                    worker = self.index,
                    client = client.0,
                    request = id.to_string(),
                    kind = format!("{:?}", kind),
                    status = status.to_string(),
                    bytes = bytes,
                );
                // fails only once the dispatcher is gone; the stream closes on drop
                self.control.send(ControlMsg::Resume(client, stream));
            }
            Err(e) => {
                log_worker_warn!(
                    "Reply failed, closing connection",
                    worker = self.index,
                    client = client.0,
                    error = e.to_string(),
                );
                drop(stream);
                self.control.send(ControlMsg::Close(client));
            }
        }
    }
}

/// Start `count` named worker threads.
pub fn spawn_workers(
    count: usize,
    queue: &Arc<WorkQueue<WorkItem>>,
    handler: &RequestHandler,
    control: &ControlHandle,
    compression: Compression,
) -> std::io::Result<Vec<JoinHandle<u64>>> {
    (0..count)
        .map(|index| {
            let worker = Worker::new(
                index,
                queue.clone(),
                handler.clone(),
                control.clone(),
                compression,
            );
            thread::Builder::new()
                .name(format!("vcache-worker-{}", index))
                .spawn(move || worker.run())
        })
        .collect()
}
