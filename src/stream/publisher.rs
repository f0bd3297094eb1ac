//! Pull-based live stream of one run.
//!
//! Each subscription gets its own task: replay the log from offset zero,
//! then on every poll tick read the run record and any new log bytes, push
//! complete lines and a status heartbeat, and finish with `Done` once the
//! record is terminal. The record is read before the log on each tick; the
//! supervisor writes its final log line before the terminal status, so the
//! `Done` message always comes after every line.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::StreamEvent;
use crate::logs::{read_from, LineSplitter};
use crate::storage::{RunRecord, RunStore, StoreError};

/// Buffered messages per observer before the publisher waits on it.
const CHANNEL_CAPACITY: usize = 256;

/// The observer went away.
struct Disconnected;

type Sent = Result<(), Disconnected>;

async fn send(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> Sent {
    tx.send(event).await.map_err(|_| Disconnected)
}

/// Offset-tracking reader over one run log.
struct Tail {
    path: PathBuf,
    offset: u64,
    splitter: LineSplitter,
}

impl Tail {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            splitter: LineSplitter::new(),
        }
    }

    /// Push every complete line appended since the last call.
    async fn forward(&mut self, tx: &mpsc::Sender<StreamEvent>) -> Sent {
        let chunk = match read_from(&self.path, self.offset).await {
            Ok((bytes, next)) => {
                self.offset = next;
                bytes
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read run log");
                return Ok(());
            }
        };

        for line in self.splitter.push(&chunk) {
            send(tx, StreamEvent::Line { line }).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, tx: &mpsc::Sender<StreamEvent>) -> Sent {
        self.forward(tx).await?;
        if let Some(line) = self.splitter.finish() {
            send(tx, StreamEvent::Line { line }).await?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct Publisher {
    runs: RunStore,
    poll_interval: Duration,
}

impl Publisher {
    pub fn new(runs: RunStore, poll_interval: Duration) -> Self {
        Self {
            runs,
            poll_interval,
        }
    }

    /// Open a stream for `run_id` on a background task.
    ///
    /// Dropping the receiver stops the task; the run itself is unaffected.
    pub fn subscribe(&self, run_id: impl Into<String>) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let publisher = self.clone();
        let run_id = run_id.into();
        tokio::spawn(async move { publisher.publish(&run_id, tx).await });
        rx
    }

    /// Drive one subscription until the run is terminal or the observer
    /// disconnects.
    pub async fn publish(&self, run_id: &str, tx: mpsc::Sender<StreamEvent>) {
        match self.stream(run_id, &tx).await {
            Ok(()) => debug!(run_id, "stream completed"),
            Err(Disconnected) => debug!(run_id, "observer disconnected, stream stopped"),
        }
    }

    async fn load(&self, run_id: &str) -> Result<Option<RunRecord>, StoreError> {
        let run_id = run_id.to_string();
        self.runs.blocking(move |runs| runs.get(&run_id)).await
    }

    async fn stream(&self, run_id: &str, tx: &mpsc::Sender<StreamEvent>) -> Sent {
        let record = match self.load(run_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return send(tx, StreamEvent::Error { error: "Run not found".to_string() }).await;
            }
            Err(e) => {
                warn!(run_id, error = %e, "failed to load run for stream");
                return send(tx, StreamEvent::Error { error: e.to_string() }).await;
            }
        };

        let mut tail = Tail::new(record.log_path);
        tail.forward(tx).await?;

        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = tx.closed() => return Err(Disconnected),
            }

            let record = match self.load(run_id).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(run_id, "run disappeared while streaming");
                    continue;
                }
                Err(e) => {
                    warn!(run_id, error = %e, "failed to poll run status");
                    continue;
                }
            };

            let terminal = record.status.is_terminal();
            if terminal {
                tail.finish(tx).await?;
            } else {
                tail.forward(tx).await?;
            }

            send(
                tx,
                StreamEvent::Status {
                    status: record.status,
                    exit_code: record.exit_code,
                },
            )
            .await?;

            if terminal {
                return send(tx, StreamEvent::Done { run: record }).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogWriter;
    use crate::storage::{open_pool, RunPatch, RunRecord, RunStatus};
    use chrono::Utc;

    const POLL: Duration = Duration::from_millis(50);

    struct Fixture {
        dir: tempfile::TempDir,
        runs: RunStore,
        log: LogWriter,
        run_id: String,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let runs = RunStore::new(open_pool(dir.path().join("runs.db")).unwrap());
        let log_path = dir.path().join("run.log");
        let log = LogWriter::open(&log_path).await.unwrap();
        runs.create(&RunRecord::queued("r1", "case", dir.path().to_path_buf(), log_path))
            .unwrap();
        runs.update("r1", RunPatch::running(Utc::now())).unwrap();
        Fixture {
            dir,
            runs,
            log,
            run_id: "r1".to_string(),
        }
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("stream stalled")
        {
            events.push(event);
        }
        events
    }

    fn lines(events: &[StreamEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Line { line } => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_unknown_run_yields_single_error() {
        let fx = fixture().await;
        let publisher = Publisher::new(fx.runs.clone(), POLL);

        let events = collect(publisher.subscribe("ghost")).await;
        assert_eq!(
            events,
            vec![StreamEvent::Error {
                error: "Run not found".to_string()
            }]
        );
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_backlog_first() {
        let fx = fixture().await;
        for i in 0..50 {
            fx.log.append_line(&format!("line {i}")).await;
        }

        let publisher = Publisher::new(fx.runs.clone(), POLL);
        let mut rx = publisher.subscribe(&fx.run_id);

        let mut backlog = Vec::new();
        for _ in 0..50 {
            backlog.push(rx.recv().await.unwrap());
        }
        let expected: Vec<_> = (0..50)
            .map(|i| StreamEvent::Line {
                line: format!("line {i}"),
            })
            .collect();
        assert_eq!(backlog, expected);

        fx.log.append_line("line 50").await;
        fx.runs
            .update(&fx.run_id, RunPatch::finished(RunStatus::Passed, Some(0), None))
            .unwrap();

        let rest = collect(rx).await;
        assert_eq!(lines(&rest), vec!["line 50"]);
        match rest.last() {
            Some(StreamEvent::Done { run }) => {
                assert_eq!(run.status, RunStatus::Passed);
                assert_eq!(run.exit_code, Some(0));
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeats_while_running_and_partial_line_flushed_at_end() {
        let fx = fixture().await;
        let publisher = Publisher::new(fx.runs.clone(), POLL);
        let mut rx = publisher.subscribe(&fx.run_id);

        fx.log.append(b"no newline yet").await;
        match rx.recv().await.unwrap() {
            StreamEvent::Status { status, exit_code } => {
                assert_eq!(status, RunStatus::Running);
                assert_eq!(exit_code, None);
            }
            other => panic!("expected heartbeat, got {other:?}"),
        }

        fx.runs
            .update(&fx.run_id, RunPatch::finished(RunStatus::Failed, Some(7), None))
            .unwrap();
        let rest = collect(rx).await;
        assert_eq!(lines(&rest), vec!["no newline yet"]);

        let n = rest.len();
        assert!(matches!(
            rest[n - 2],
            StreamEvent::Status {
                status: RunStatus::Failed,
                exit_code: Some(7)
            }
        ));
        assert!(rest[n - 1].is_final());
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_see_same_done() {
        let fx = fixture().await;
        fx.log.append_line("shared").await;
        let publisher = Publisher::new(fx.runs.clone(), POLL);

        let a = tokio::spawn(collect(publisher.subscribe(&fx.run_id)));
        let b = tokio::spawn(collect(publisher.subscribe(&fx.run_id)));

        tokio::time::sleep(POLL * 2).await;
        fx.runs
            .update(&fx.run_id, RunPatch::finished(RunStatus::Passed, Some(0), None))
            .unwrap();

        let a = a.await.unwrap();
        let b = b.await.unwrap();
        assert_eq!(lines(&a), vec!["shared"]);
        assert_eq!(lines(&b), vec!["shared"]);
        assert_eq!(a.last(), b.last());
        assert!(matches!(a.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn test_heartbeats_continue_while_another_run_waits_on_the_write_lock() {
        let fx = fixture().await;
        let other_log = fx.dir.path().join("other.log");
        fx.runs
            .create(&RunRecord::queued("r2", "case", fx.dir.path().to_path_buf(), other_log))
            .unwrap();
        fx.runs.update("r2", RunPatch::running(Utc::now())).unwrap();

        // A foreign connection holds the write lock for two seconds.
        let db_path = fx.dir.path().join("runs.db");
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let conn = rusqlite::Connection::open(db_path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_secs(2));
            conn.execute_batch("COMMIT").unwrap();
        });
        locked_rx.recv().unwrap();

        let writer = {
            let runs = fx.runs.clone();
            tokio::spawn(async move {
                runs.blocking(|runs| {
                    runs.update("r2", RunPatch::finished(RunStatus::Passed, Some(0), None))
                })
                .await
            })
        };

        let publisher = Publisher::new(fx.runs.clone(), POLL);
        let mut rx = publisher.subscribe(&fx.run_id);
        let mut last = Instant::now();
        let until = last + Duration::from_millis(1500);
        let mut max_gap = Duration::ZERO;
        while Instant::now() < until {
            if let StreamEvent::Status { .. } = rx.recv().await.unwrap() {
                let now = Instant::now();
                max_gap = max_gap.max(now - last);
                last = now;
            }
        }
        drop(rx);
        assert!(max_gap < Duration::from_millis(500), "heartbeat gap {max_gap:?}");

        let other = writer.await.unwrap().unwrap();
        assert_eq!(other.status, RunStatus::Passed);
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_stops_publisher() {
        let fx = fixture().await;
        let publisher = Publisher::new(fx.runs.clone(), POLL);

        let (tx, rx) = mpsc::channel(8);
        let task = {
            let publisher = publisher.clone();
            let run_id = fx.run_id.clone();
            tokio::spawn(async move { publisher.publish(&run_id, tx).await })
        };
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("publisher kept polling after disconnect")
            .unwrap();

        // The run is untouched.
        let run = fx.runs.get(&fx.run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }
}
