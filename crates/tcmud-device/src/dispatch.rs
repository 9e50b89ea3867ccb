//! The command pipeline: one poll task draining the ring, a pool of
//! workers invoking the handler, and one completion task writing
//! responses back and waking the kernel.
//!
//! Shutdown is a cascade: the poll task exits (fatal error or shutdown
//! signal) and drops the work channel, the workers drain it and drop the
//! completion channel, the completion task drains that and returns.
//! Closing the device fd is what breaks the kernel side of the loop.

use std::sync::Arc;

use tcmud_ring::{Mailbox, OffsetProfile, RingReader, RingWriter, ScsiCmd, ScsiResponse};
use tokio::io::unix::AsyncFd;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::error::{DeviceError, Result};
use crate::handler::ScsiCmdHandler;
use crate::uio::UioChannel;

/// Commands and responses in flight between the pipeline stages.
const QUEUE_DEPTH: usize = 8;

/// Reusable per-worker scratch; large enough for every emulated CDB.
const SCRATCH_LEN: usize = 32 * 1024;

/// The running pipeline for one device.
#[derive(Debug)]
pub struct Dispatcher {
    shutdown: Arc<Notify>,
    poll: JoinHandle<Result<()>>,
    workers: Vec<JoinHandle<()>>,
    completion: JoinHandle<Result<()>>,
}

impl Dispatcher {
    /// Spawns the pipeline over an opened uio channel.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Mailbox validation failures; reading the initial ring indices.
    pub fn start(
        uio: UioChannel,
        handler: Arc<dyn ScsiCmdHandler>,
        profile: OffsetProfile,
        workers: usize,
    ) -> Result<Self> {
        let mailbox = Mailbox::new(Arc::clone(&uio.region))?;
        log_mailbox(&mailbox);

        let reader = RingReader::new(mailbox.clone(), profile)?;
        let writer = RingWriter::new(mailbox, profile, uio.wake_fd);

        let (cmd_tx, cmd_rx) = mpsc::channel(QUEUE_DEPTH);
        let (resp_tx, resp_rx) = mpsc::channel(QUEUE_DEPTH);
        let shutdown = Arc::new(Notify::new());

        let poll = tokio::spawn(poll_loop(
            uio.poll_fd,
            reader,
            cmd_tx,
            Arc::clone(&shutdown),
        ));
        let workers = spawn_workers(handler, cmd_rx, resp_tx, workers, Arc::clone(&shutdown));
        let completion = tokio::spawn(completion_loop(writer, resp_rx));

        Ok(Self {
            shutdown,
            poll,
            workers,
            completion,
        })
    }

    /// Stops the poll loop and drains the pipeline, returning the first
    /// error any stage hit.
    ///
    /// # Errors
    ///
    /// The first failure among the pipeline tasks.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.notify_one();

        let mut first_err = None;
        let mut note = |result: std::result::Result<Result<()>, tokio::task::JoinError>| {
            let err = match result {
                Ok(Ok(())) => return,
                Ok(Err(err)) => err,
                Err(join) => DeviceError::Task(join.to_string()),
            };
            if first_err.is_none() {
                first_err = Some(err);
            }
        };

        note(self.poll.await);
        for worker in self.workers {
            if let Err(join) = worker.await {
                note(Err(join));
            }
        }
        note(self.completion.await);

        first_err.map_or(Ok(()), Err)
    }
}

fn log_mailbox(mailbox: &Mailbox) {
    tracing::debug!(
        version = ?mailbox.version().ok(),
        flags = ?mailbox.flags().ok(),
        cmdr_offset = mailbox.cmdr_offset(),
        cmdr_size = mailbox.cmdr_size(),
        head = ?mailbox.head().ok(),
        tail = ?mailbox.tail().ok(),
        "attached to tcm-user mailbox"
    );
}

/// Blocks on the uio fd; each 4-byte read means the kernel queued
/// commands, which are drained into the work channel in ring order.
async fn poll_loop(
    fd: AsyncFd<std::fs::File>,
    mut reader: RingReader,
    tx: mpsc::Sender<ScsiCmd>,
    shutdown: Arc<Notify>,
) -> Result<()> {
    loop {
        let mut guard = tokio::select! {
            guard = fd.readable() => guard.map_err(DeviceError::Uio)?,
            () = shutdown.notified() => {
                tracing::debug!("poll loop shutting down");
                return Ok(());
            }
        };

        let mut wake = [0u8; 4];
        match guard.try_io(|inner| {
            use std::io::Read;
            let mut file: &std::fs::File = inner.get_ref();
            file.read(&mut wake)
        }) {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(DeviceError::Uio(err)),
            Err(_would_block) => continue,
        }

        loop {
            match reader.next_command()? {
                Some(cmd) => {
                    tracing::trace!(id = cmd.id(), op = cmd.command(), "queueing command");
                    if tx.send(cmd).await.is_err() {
                        return Ok(());
                    }
                }
                None => break,
            }
        }
    }
}

/// Spawns `count` workers (at least one) sharing the work channel. Each
/// worker lends its scratch buffer to the command for the duration of the
/// handler call and takes back whatever the handler left there.
///
/// A structural handler failure stops the worker and signals `shutdown`
/// so the rest of the pipeline unwinds.
pub fn spawn_workers(
    handler: Arc<dyn ScsiCmdHandler>,
    rx: mpsc::Receiver<ScsiCmd>,
    tx: mpsc::Sender<ScsiResponse>,
    count: usize,
    shutdown: Arc<Notify>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    (0..count.max(1))
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let tx = tx.clone();
            let handler = Arc::clone(&handler);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                let mut scratch = vec![0u8; SCRATCH_LEN];
                loop {
                    let cmd = rx.lock().await.recv().await;
                    let Some(mut cmd) = cmd else { break };
                    cmd.scratch = Some(std::mem::take(&mut scratch));
                    match handler.handle_command(&mut cmd).await {
                        Ok(resp) => {
                            if let Some(buf) = cmd.scratch.take() {
                                scratch = buf;
                            }
                            if tx.send(resp).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            tracing::error!(%err, worker, "command handler failed, stopping");
                            shutdown.notify_one();
                            break;
                        }
                    }
                }
            })
        })
        .collect()
}

/// Writes each response into its ring entry and wakes the kernel.
async fn completion_loop(mut writer: RingWriter, mut rx: mpsc::Receiver<ScsiResponse>) -> Result<()> {
    while let Some(resp) = rx.recv().await {
        tracing::trace!(id = resp.id(), status = resp.status(), "completing command");
        writer.complete(&resp)?;
        writer.wake()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tcmud_ring::SharedRegion;

    use crate::handler::HandlerError;

    struct AlwaysGood;

    #[async_trait]
    impl ScsiCmdHandler for AlwaysGood {
        async fn handle_command(
            &self,
            cmd: &mut ScsiCmd,
        ) -> std::result::Result<ScsiResponse, HandlerError> {
            Ok(cmd.ok())
        }
    }

    struct AlwaysFatal;

    #[async_trait]
    impl ScsiCmdHandler for AlwaysFatal {
        async fn handle_command(
            &self,
            _cmd: &mut ScsiCmd,
        ) -> std::result::Result<ScsiResponse, HandlerError> {
            Err(HandlerError::internal("no backing store"))
        }
    }

    fn test_cmd(id: u16) -> ScsiCmd {
        ScsiCmd::new(
            id,
            vec![0u8; 6],
            Vec::new(),
            Arc::new(SharedRegion::anonymous(1)),
        )
    }

    async fn run_pool(worker_count: usize, ids: &[u16]) -> Vec<u16> {
        let (cmd_tx, cmd_rx) = mpsc::channel(ids.len().max(1));
        let (resp_tx, mut resp_rx) = mpsc::channel(ids.len().max(1));
        let workers = spawn_workers(
            Arc::new(AlwaysGood),
            cmd_rx,
            resp_tx,
            worker_count,
            Arc::new(Notify::new()),
        );

        for &id in ids {
            cmd_tx.send(test_cmd(id)).await.unwrap();
        }
        drop(cmd_tx);

        let mut got = Vec::new();
        while let Some(resp) = resp_rx.recv().await {
            got.push(resp.id());
        }
        for worker in workers {
            worker.await.unwrap();
        }
        got
    }

    #[tokio::test]
    async fn test_single_worker_echoes_command_id() {
        let got = run_pool(1, &[1]).await;
        assert_eq!(got, vec![1]);
    }

    #[tokio::test]
    async fn test_worker_pool_echoes_every_command_id() {
        let mut got = run_pool(2, &[1, 2, 3, 4, 5]).await;
        got.sort_unstable();
        assert_eq!(got, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_single_worker_preserves_order() {
        let got = run_pool(1, &[5, 3, 9]).await;
        assert_eq!(got, vec![5, 3, 9]);
    }

    #[tokio::test]
    async fn test_zero_workers_rounds_up_to_one() {
        let got = run_pool(0, &[7]).await;
        assert_eq!(got, vec![7]);
    }

    #[tokio::test]
    async fn test_fatal_handler_signals_shutdown() {
        let (cmd_tx, cmd_rx) = mpsc::channel(1);
        let (resp_tx, mut resp_rx) = mpsc::channel(1);
        let shutdown = Arc::new(Notify::new());
        let workers = spawn_workers(
            Arc::new(AlwaysFatal),
            cmd_rx,
            resp_tx,
            1,
            Arc::clone(&shutdown),
        );

        cmd_tx.send(test_cmd(1)).await.unwrap();
        // The worker dies without responding and leaves a shutdown permit.
        assert!(resp_rx.recv().await.is_none());
        shutdown.notified().await;
        for worker in workers {
            worker.await.unwrap();
        }
    }
}
