//! End-to-end scenarios for the writable stream state machine: ordering,
//! backpressure, and the write/close/abort races.

#![cfg(feature = "send")]

use std::error::Error;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use writable_streams::{
    ByteLengthQueuingStrategy, CountQueuingStrategy, StreamError, StreamState, WritableSink,
    WritableStream, WritableStreamDefaultController,
};

type StreamResult<T> = Result<T, StreamError>;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

fn is_pending<F: Future>(fut: &mut std::pin::Pin<&mut F>) -> bool {
    let waker = futures::task::noop_waker_ref();
    let mut cx = std::task::Context::from_waker(waker);
    fut.as_mut().poll(&mut cx).is_pending()
}

/// Records every sink operation; writes block until a permit is released
/// through `gate` (pre-loaded with a large permit pool when ungated).
#[derive(Clone)]
struct RecordingSink {
    log: Arc<Mutex<Vec<String>>>,
    gate: Arc<Semaphore>,
    close_gate: Arc<Semaphore>,
    fail_write_on: Option<String>,
}

impl RecordingSink {
    fn gated() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new(Semaphore::new(0)),
            close_gate: Arc::new(Semaphore::new(1 << 20)),
            fail_write_on: None,
        }
    }

    fn ungated() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new(Semaphore::new(1 << 20)),
            close_gate: Arc::new(Semaphore::new(1 << 20)),
            fail_write_on: None,
        }
    }

    fn with_gated_close(mut self) -> Self {
        self.close_gate = Arc::new(Semaphore::new(0));
        self
    }

    fn failing_on(mut self, chunk: &str) -> Self {
        self.fail_write_on = Some(chunk.to_string());
        self
    }

    fn unblock_write(&self) {
        self.gate.add_permits(1);
    }

    fn unblock_close(&self) {
        self.close_gate.add_permits(1);
    }

    fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl WritableSink<String> for RecordingSink {
    fn write(
        &mut self,
        chunk: String,
        _controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> {
        let log = Arc::clone(&self.log);
        let gate = Arc::clone(&self.gate);
        let fail_on = self.fail_write_on.clone();
        async move {
            gate.acquire().await.unwrap().forget();
            if fail_on.as_deref() == Some(chunk.as_str()) {
                log.lock().unwrap().push(format!("write {chunk} failed"));
                return Err(format!("sink write exploded on {chunk}").into());
            }
            log.lock().unwrap().push(format!("write {chunk}"));
            Ok(())
        }
    }

    fn close(
        self,
        _controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> {
        let log = Arc::clone(&self.log);
        let gate = Arc::clone(&self.close_gate);
        async move {
            gate.acquire().await.unwrap().forget();
            log.lock().unwrap().push("close".to_string());
            Ok(())
        }
    }

    fn abort(&mut self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
        let log = Arc::clone(&self.log);
        async move {
            log.lock()
                .unwrap()
                .push(format!("abort {}", reason.unwrap_or_default()));
            Ok(())
        }
    }
}

fn spawn_stream(sink: RecordingSink, hwm: f64) -> WritableStream<String> {
    WritableStream::builder(sink)
        .strategy(CountQueuingStrategy::new(hwm))
        .spawn(tokio::spawn)
        .expect("spawn failed")
}

#[tokio::test]
async fn simple_throughput_with_backpressure() {
    let sink = RecordingSink::gated();
    let stream = spawn_stream(sink.clone(), 2.0);
    let writer = stream.get_writer().expect("get_writer failed");

    // "a" is dispatched immediately but keeps occupying the queue while the
    // sink holds it, so one slot of the high water mark stays taken.
    let write_a = writer.write("a".to_string());
    settle().await;
    writer.ready().await.expect("ready after first write");

    let write_b = writer.write("b".to_string());
    settle().await;
    let ready_fut = writer.ready();
    tokio::pin!(ready_fut);
    assert!(is_pending(&mut ready_fut), "queue is full, ready must wait");

    sink.unblock_write();
    write_a.await.expect("write a failed");
    settle().await;
    ready_fut.await.expect("ready after a completed");

    let write_c = writer.write("c".to_string());
    sink.unblock_write();
    sink.unblock_write();
    write_b.await.expect("write b failed");
    write_c.await.expect("write c failed");

    writer.close().await.expect("close failed");
    writer.closed().await.expect("closed should resolve");

    assert_eq!(
        sink.log_entries(),
        vec!["write a", "write b", "write c", "close"]
    );
    assert_eq!(stream.state(), StreamState::Closed);
}

#[tokio::test]
async fn write_after_close_rejects_and_never_reaches_the_sink() {
    let sink = RecordingSink::ungated();
    let stream = spawn_stream(sink.clone(), 10.0);
    let writer = stream.get_writer().expect("get_writer failed");

    let close_fut = writer.close();
    let result = writer.write("x".to_string()).await;
    assert!(matches!(result, Err(StreamError::Closing)));

    close_fut.await.expect("close failed");
    assert_eq!(sink.log_entries(), vec!["close"]);
}

#[tokio::test]
async fn sink_write_rejection_errors_everything_downstream() {
    let sink = RecordingSink::ungated().failing_on("a");
    let stream = spawn_stream(sink.clone(), 10.0);
    let writer = stream.get_writer().expect("get_writer failed");

    let write_a = writer.write("a".to_string());
    let write_b = writer.write("b".to_string());
    let write_c = writer.write("c".to_string());

    let err_a = write_a.await.expect_err("first write must fail");
    assert!(err_a.to_string().contains("sink write exploded"));

    let err_b = write_b.await.expect_err("queued write must fail");
    assert!(err_b.to_string().contains("sink write exploded"));
    let err_c = write_c.await.expect_err("queued write must fail");
    assert!(err_c.to_string().contains("sink write exploded"));

    let closed_err = writer.closed().await.expect_err("closed must reject");
    assert!(closed_err.to_string().contains("sink write exploded"));

    assert_eq!(writer.desired_size().unwrap(), None);
    assert_eq!(stream.state(), StreamState::Errored);
    // b and c were never offered to the sink
    assert_eq!(sink.log_entries(), vec!["write a failed"]);
}

#[tokio::test]
async fn abort_during_in_flight_write_waits_for_the_sink() {
    let sink = RecordingSink::gated();
    let stream = spawn_stream(sink.clone(), 10.0);
    let writer = stream.get_writer().expect("get_writer failed");

    let write_a = writer.write("a".to_string());
    settle().await;

    let abort_fut = writer.abort(Some("stop".to_string()));
    tokio::pin!(abort_fut);
    settle().await;
    assert!(
        is_pending(&mut abort_fut),
        "abort must wait for the in-flight write"
    );
    assert!(
        !sink.log_entries().iter().any(|e| e.starts_with("abort")),
        "sink abort must not run while a write is in flight"
    );

    // The dispatched write runs to completion and its promise resolves.
    sink.unblock_write();
    write_a.await.expect("in-flight write should still resolve");

    abort_fut.await.expect("abort failed");
    assert_eq!(sink.log_entries(), vec!["write a", "abort stop"]);
    assert_eq!(stream.state(), StreamState::Errored);

    let late = writer.write("b".to_string()).await;
    assert!(matches!(late, Err(StreamError::Aborted(_))));
}

#[tokio::test]
async fn abort_rejects_queued_writes_without_offering_them() {
    let sink = RecordingSink::gated();
    let stream = spawn_stream(sink.clone(), 10.0);
    let writer = stream.get_writer().expect("get_writer failed");

    let write_a = writer.write("a".to_string());
    let write_b = writer.write("b".to_string());
    settle().await;

    let abort_fut = writer.abort(None);
    sink.unblock_write();

    write_a.await.expect("in-flight write resolves");
    let err_b = write_b.await.expect_err("queued write must reject");
    assert!(matches!(err_b, StreamError::Aborted(_)));

    abort_fut.await.expect("abort failed");
    // "b" never reached the sink
    assert_eq!(sink.log_entries(), vec!["write a", "abort "]);
}

#[tokio::test]
async fn close_racing_abort_ends_errored_with_both_promises_resolved() {
    let sink = RecordingSink::ungated().with_gated_close();
    let stream = spawn_stream(sink.clone(), 10.0);
    let writer = stream.get_writer().expect("get_writer failed");

    let close_fut = writer.close();
    settle().await; // sink.close is now in flight

    let abort_fut = writer.abort(Some("r".to_string()));
    settle().await;

    sink.unblock_close();

    close_fut.await.expect("close promise must resolve");
    abort_fut.await.expect("abort promise must resolve");

    let closed_err = writer.closed().await.expect_err("closed must reject");
    assert!(matches!(closed_err, StreamError::AbortedAfterClose));
    assert_eq!(stream.state(), StreamState::Errored);

    // the sink was closed, never aborted
    assert_eq!(sink.log_entries(), vec!["close"]);
}

#[tokio::test]
async fn release_mid_write_keeps_the_write_and_frees_the_lock() {
    let sink = RecordingSink::gated();
    let stream = spawn_stream(sink.clone(), 2.0);
    let writer = stream.get_writer().expect("get_writer failed");

    let write_a = writer.write("a".to_string());
    settle().await;

    let closed_before_release = writer.closed();
    writer.release_lock();
    assert!(
        matches!(closed_before_release.await, Err(StreamError::Released)),
        "the released writer's closed signal detaches"
    );

    // The write created under the old lock still reflects the sink outcome.
    sink.unblock_write();
    write_a.await.expect("write should survive the release");

    // A fresh writer observes current backpressure and a live closed signal.
    let writer2 = stream.get_writer().expect("reacquire failed");
    writer2.ready().await.expect("fresh ready should resolve");
    writer2.close().await.expect("close failed");
    writer2.closed().await.expect("fresh closed should resolve");
}

#[tokio::test]
async fn sink_sees_writes_serially_and_in_order() {
    #[derive(Clone)]
    struct ConcurrencySink {
        chunks: Arc<Mutex<Vec<u32>>>,
        live: Arc<Mutex<usize>>,
        max_live: Arc<Mutex<usize>>,
    }

    impl WritableSink<u32> for ConcurrencySink {
        fn write(
            &mut self,
            chunk: u32,
            _controller: &mut WritableStreamDefaultController,
        ) -> impl Future<Output = StreamResult<()>> {
            let chunks = Arc::clone(&self.chunks);
            let live = Arc::clone(&self.live);
            let max_live = Arc::clone(&self.max_live);
            async move {
                {
                    let mut live = live.lock().unwrap();
                    *live += 1;
                    let mut max = max_live.lock().unwrap();
                    *max = (*max).max(*live);
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                chunks.lock().unwrap().push(chunk);
                *live.lock().unwrap() -= 1;
                Ok(())
            }
        }
    }

    let sink = ConcurrencySink {
        chunks: Arc::new(Mutex::new(Vec::new())),
        live: Arc::new(Mutex::new(0)),
        max_live: Arc::new(Mutex::new(0)),
    };
    let stream = WritableStream::builder(sink.clone())
        .strategy(CountQueuingStrategy::new(4.0))
        .spawn(tokio::spawn)
        .expect("spawn failed");
    let writer = stream.get_writer().expect("get_writer failed");

    let writes: Vec<_> = (0..10u32).map(|i| writer.write(i)).collect();
    for write in writes {
        write.await.expect("write failed");
    }
    writer.close().await.expect("close failed");

    assert_eq!(*sink.chunks.lock().unwrap(), (0..10).collect::<Vec<_>>());
    assert_eq!(*sink.max_live.lock().unwrap(), 1, "writes must never overlap");
}

#[tokio::test]
async fn abort_on_terminal_streams() {
    // closed stream: abort resolves
    let stream = spawn_stream(RecordingSink::ungated(), 1.0);
    let writer = stream.get_writer().expect("get_writer failed");
    writer.close().await.expect("close failed");
    writer.abort(None).await.expect("abort on closed resolves");

    // errored stream: abort rejects with the stored error
    let sink = RecordingSink::ungated().failing_on("a");
    let stream = spawn_stream(sink, 10.0);
    let writer = stream.get_writer().expect("get_writer failed");
    writer
        .write("a".to_string())
        .await
        .expect_err("write fails");
    let err = writer
        .abort(None)
        .await
        .expect_err("abort on errored rejects");
    assert!(err.to_string().contains("sink write exploded"));
}

#[tokio::test]
async fn second_abort_while_one_is_pending_rejects() {
    let sink = RecordingSink::gated();
    let stream = spawn_stream(sink.clone(), 10.0);
    let writer = stream.get_writer().expect("get_writer failed");

    let write_a = writer.write("a".to_string());
    settle().await;

    let abort1 = writer.abort(Some("first".to_string()));
    let abort2 = writer.abort(Some("second".to_string()));

    assert!(matches!(abort2.await, Err(StreamError::Aborted(_))));

    sink.unblock_write();
    write_a.await.expect("write resolves");
    abort1.await.expect("first abort resolves");
}

#[tokio::test]
async fn stream_level_abort_requires_an_unlocked_stream() {
    let stream = spawn_stream(RecordingSink::ungated(), 1.0);
    let writer = stream.get_writer().expect("get_writer failed");

    let err = stream.abort(None).await.expect_err("abort while locked");
    assert!(matches!(err, StreamError::Locked));

    writer.release_lock();
    stream
        .abort(Some("done".to_string()))
        .await
        .expect("abort after release");
    assert_eq!(stream.state(), StreamState::Errored);
}

#[tokio::test]
async fn writer_acquired_over_an_aborted_stream_sees_rejected_signals() {
    let stream = spawn_stream(RecordingSink::ungated(), 1.0);
    stream.abort(Some("gone".to_string())).await.expect("abort");

    let writer = stream.get_writer().expect("get_writer failed");
    let ready_err = writer.ready().await.expect_err("ready must reject");
    assert!(matches!(ready_err, StreamError::Aborted(_)));
    let closed_err = writer.closed().await.expect_err("closed must reject");
    assert!(matches!(closed_err, StreamError::Aborted(_)));
    assert_eq!(writer.desired_size().unwrap(), None);
}

#[tokio::test]
async fn abort_before_start_settles_waits_for_start() {
    #[derive(Clone)]
    struct GatedStartSink {
        gate: Arc<Semaphore>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl WritableSink<String> for GatedStartSink {
        fn start(
            &mut self,
            _controller: &mut WritableStreamDefaultController,
        ) -> impl Future<Output = StreamResult<()>> {
            let gate = Arc::clone(&self.gate);
            let log = Arc::clone(&self.log);
            async move {
                gate.acquire().await.unwrap().forget();
                log.lock().unwrap().push("start".to_string());
                Ok(())
            }
        }

        fn write(
            &mut self,
            _chunk: String,
            _controller: &mut WritableStreamDefaultController,
        ) -> impl Future<Output = StreamResult<()>> {
            futures::future::ready(Ok(()))
        }

        fn abort(&mut self, _reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
            let log = Arc::clone(&self.log);
            async move {
                log.lock().unwrap().push("abort".to_string());
                Ok(())
            }
        }
    }

    let sink = GatedStartSink {
        gate: Arc::new(Semaphore::new(0)),
        log: Arc::new(Mutex::new(Vec::new())),
    };
    let stream = WritableStream::<String>::builder(sink.clone())
        .spawn(tokio::spawn)
        .expect("spawn failed");
    let writer = stream.get_writer().expect("get_writer failed");

    let abort_fut = writer.abort(None);
    tokio::pin!(abort_fut);
    settle().await;
    assert!(is_pending(&mut abort_fut), "abort must wait for start");

    sink.gate.add_permits(1);
    abort_fut.await.expect("abort failed");

    assert_eq!(
        sink.log.lock().unwrap().clone(),
        vec!["start".to_string(), "abort".to_string()]
    );
    assert_eq!(stream.state(), StreamState::Errored);
}

#[tokio::test]
async fn sink_errors_keep_their_source_chain() {
    #[derive(Debug)]
    struct CodecError(&'static str);
    impl std::fmt::Display for CodecError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "codec rejected chunk: {}", self.0)
        }
    }
    impl Error for CodecError {}

    struct FailingDiskSink;

    impl WritableSink<String> for FailingDiskSink {
        fn write(
            &mut self,
            chunk: String,
            _controller: &mut WritableStreamDefaultController,
        ) -> impl Future<Output = StreamResult<()>> {
            async move {
                if chunk == "garbled" {
                    Err(StreamError::other(CodecError("bad frame")))
                } else {
                    let io_err = std::io::Error::new(
                        std::io::ErrorKind::PermissionDenied,
                        "read-only store",
                    );
                    Err(io_err.into())
                }
            }
        }
    }

    // an io::Error from the sink stays reachable through the source chain
    let stream = WritableStream::builder(FailingDiskSink)
        .strategy(CountQueuingStrategy::new(4.0))
        .spawn(tokio::spawn)
        .expect("spawn failed");
    let writer = stream.get_writer().expect("get_writer failed");
    let err = writer
        .write("plain".to_string())
        .await
        .expect_err("sink write must fail");
    let io = err
        .source()
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .expect("io failure keeps its source");
    assert_eq!(io.kind(), std::io::ErrorKind::PermissionDenied);
    assert_eq!(stream.state(), StreamState::Errored);

    // a custom sink error wrapped with `other` survives into `closed`
    let stream = WritableStream::builder(FailingDiskSink)
        .strategy(CountQueuingStrategy::new(4.0))
        .spawn(tokio::spawn)
        .expect("spawn failed");
    let writer = stream.get_writer().expect("get_writer failed");
    let err = writer
        .write("garbled".to_string())
        .await
        .expect_err("sink write must fail");
    assert!(err.to_string().contains("bad frame"));

    let closed_err = writer.closed().await.expect_err("closed mirrors the error");
    assert!(closed_err
        .source()
        .and_then(|source| source.downcast_ref::<CodecError>())
        .is_some());
}

#[tokio::test]
async fn close_with_error_propagation_covers_all_paths() {
    // open stream: performs a normal close
    let sink = RecordingSink::ungated();
    let stream = spawn_stream(sink.clone(), 1.0);
    let writer = stream.get_writer().expect("get_writer failed");
    writer
        .close_with_error_propagation()
        .await
        .expect("close failed");
    assert_eq!(stream.state(), StreamState::Closed);

    // already closed: resolves immediately
    writer
        .close_with_error_propagation()
        .await
        .expect("second call resolves");

    // errored stream: rejects with the stored error
    let sink = RecordingSink::ungated().failing_on("a");
    let stream = spawn_stream(sink, 10.0);
    let writer = stream.get_writer().expect("get_writer failed");
    writer
        .write("a".to_string())
        .await
        .expect_err("write fails");
    let err = writer
        .close_with_error_propagation()
        .await
        .expect_err("must mirror the stored error");
    assert!(err.to_string().contains("sink write exploded"));
}

#[tokio::test]
async fn byte_length_strategy_drives_backpressure_by_bytes() {
    #[derive(Clone)]
    struct GatedByteSink {
        gate: Arc<Semaphore>,
    }

    impl WritableSink<Vec<u8>> for GatedByteSink {
        fn write(
            &mut self,
            _chunk: Vec<u8>,
            _controller: &mut WritableStreamDefaultController,
        ) -> impl Future<Output = StreamResult<()>> {
            let gate = Arc::clone(&self.gate);
            async move {
                gate.acquire().await.unwrap().forget();
                Ok(())
            }
        }
    }

    let gate = Arc::new(Semaphore::new(0));
    let stream = WritableStream::builder(GatedByteSink {
        gate: Arc::clone(&gate),
    })
    .strategy(ByteLengthQueuingStrategy::new(10.0))
    .spawn(tokio::spawn)
    .expect("spawn failed");
    let writer = stream.get_writer().expect("get_writer failed");

    let write1 = writer.write(vec![0u8; 4]);
    settle().await;
    assert_eq!(writer.desired_size().unwrap(), Some(6.0));
    writer.ready().await.expect("still under the mark");

    let write2 = writer.write(vec![0u8; 7]);
    settle().await;
    assert_eq!(writer.desired_size().unwrap(), Some(-1.0));
    let ready_fut = writer.ready();
    tokio::pin!(ready_fut);
    assert!(is_pending(&mut ready_fut), "11 bytes queued against 10");

    gate.add_permits(1);
    write1.await.expect("write1 failed");
    settle().await;
    assert_eq!(writer.desired_size().unwrap(), Some(3.0));
    ready_fut.await.expect("ready after the first chunk drained");

    gate.add_permits(1);
    write2.await.expect("write2 failed");
    settle().await;
    assert_eq!(writer.desired_size().unwrap(), Some(10.0));
}

#[tokio::test]
async fn zero_high_water_mark_signals_backpressure_from_the_start() {
    let stream = spawn_stream(RecordingSink::ungated(), 0.0);
    let writer = stream.get_writer().expect("get_writer failed");
    settle().await;

    let ready_fut = writer.ready();
    tokio::pin!(ready_fut);
    assert!(
        is_pending(&mut ready_fut),
        "hwm of zero starts under backpressure"
    );
    assert_eq!(writer.desired_size().unwrap(), Some(0.0));

    // writes still flow; backpressure is advisory
    writer.write("a".to_string()).await.expect("write failed");
    writer.close().await.expect("close failed");
}
