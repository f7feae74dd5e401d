use super::error::StreamError;
use super::queue::SizeQueue;
use super::{CountQueuingStrategy, QueuingStrategy};
use crate::platform::{BoxedStrategy, MaybeSend, PlatformBoxFutureStatic, PlatformFuture, SharedPtr};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::future::{self, poll_fn};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use pin_project::{pin_project, pinned_drop};
use std::collections::VecDeque;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll, Waker};
use tracing::{debug, trace};

type StreamResult<T> = Result<T, StreamError>;
type CompletionTx = oneshot::Sender<StreamResult<()>>;

/// Public stream state probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Writable,
    Closed,
    Errored,
}

/// Driver-internal state. `Erroring` is the window between an abort or error
/// being observed and the in-flight sink operation settling; externally it
/// still reports as writable.
enum InnerState {
    Writable,
    Erroring(StreamError),
    Closed,
    Errored,
}

/// A queued record: a chunk awaiting its sink write, or the close sentinel.
/// The chunk value is taken when handed to the sink, but the record (and its
/// size) stays queued until the write settles.
enum WriteRecord<T> {
    Chunk(Option<T>),
    Close,
}

/// Commands sent to the driver task for state mutation
enum StreamCommand<T> {
    Write {
        chunk: T,
        completion: CompletionTx,
    },
    Close {
        completion: CompletionTx,
    },
    Abort {
        reason: Option<String>,
        completion: CompletionTx,
    },
    Flush {
        completion: CompletionTx,
    },
    RegisterReadyWaker {
        waker: Waker,
        released: SharedPtr<AtomicBool>,
    },
    RegisterClosedWaker {
        waker: Waker,
        released: SharedPtr<AtomicBool>,
    },
}

enum ControllerMsg {
    /// Trigger a stream error (controller.error(...))
    Error(StreamError),
}

/// A lightweight set storing multiple wakers.
/// It ensures wakers are stored without duplicates (based on `will_wake`).
#[derive(Clone, Default)]
struct WakerSet(SharedPtr<Mutex<Vec<Waker>>>);

impl WakerSet {
    fn new() -> Self {
        WakerSet(SharedPtr::new(Mutex::new(Vec::new())))
    }

    fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    fn wake_all(&self) {
        let mut wakers = self.0.lock();
        for waker in wakers.drain(..) {
            waker.wake();
        }
    }
}

/// Shared snapshot of the driver's state, readable from any handle without
/// crossing into the task.
#[derive(Clone)]
struct StateMirror {
    backpressure: SharedPtr<AtomicBool>,
    closed: SharedPtr<AtomicBool>,
    errored: SharedPtr<AtomicBool>,
    erroring: SharedPtr<AtomicBool>,
    close_requested: SharedPtr<AtomicBool>,
    locked: SharedPtr<AtomicBool>,
    queue_total_size: SharedPtr<RwLock<f64>>,
    stored_error: SharedPtr<RwLock<Option<StreamError>>>,
    ready_wakers: WakerSet,
    closed_wakers: WakerSet,
}

impl StateMirror {
    fn new(initial_backpressure: bool) -> Self {
        Self {
            backpressure: SharedPtr::new(AtomicBool::new(initial_backpressure)),
            closed: SharedPtr::new(AtomicBool::new(false)),
            errored: SharedPtr::new(AtomicBool::new(false)),
            erroring: SharedPtr::new(AtomicBool::new(false)),
            close_requested: SharedPtr::new(AtomicBool::new(false)),
            locked: SharedPtr::new(AtomicBool::new(false)),
            queue_total_size: SharedPtr::new(RwLock::new(0.0)),
            stored_error: SharedPtr::new(RwLock::new(None)),
            ready_wakers: WakerSet::new(),
            closed_wakers: WakerSet::new(),
        }
    }

    fn get_stored_error(&self) -> StreamError {
        self.stored_error
            .read()
            .clone()
            .unwrap_or_else(|| "Stream is errored".into())
    }
}

/// An abort recorded while another sink operation was in flight.
struct PendingAbort {
    reason: Option<String>,
    completion: CompletionTx,
    was_already_erroring: bool,
}

// In-flight sink operation being driven; at most one exists at a time.
enum InFlight<Sink> {
    Start {
        fut: PlatformBoxFutureStatic<(Sink, StreamResult<()>)>,
    },
    Write {
        fut: PlatformBoxFutureStatic<(Sink, StreamResult<()>)>,
    },
    Close {
        fut: PlatformBoxFutureStatic<StreamResult<()>>,
    },
    Abort {
        fut: PlatformBoxFutureStatic<StreamResult<()>>,
        completion: Option<CompletionTx>,
    },
}

enum Completed<Sink> {
    Start {
        sink: Sink,
        result: StreamResult<()>,
    },
    Write {
        sink: Sink,
        result: StreamResult<()>,
    },
    Close {
        result: StreamResult<()>,
    },
    Abort {
        result: StreamResult<()>,
        completion: Option<CompletionTx>,
    },
}

impl<Sink> InFlight<Sink> {
    fn poll(&mut self, cx: &mut Context<'_>) -> Option<Completed<Sink>> {
        match self {
            InFlight::Start { fut } => match fut.as_mut().poll(cx) {
                Poll::Ready((sink, result)) => Some(Completed::Start { sink, result }),
                Poll::Pending => None,
            },
            InFlight::Write { fut } => match fut.as_mut().poll(cx) {
                Poll::Ready((sink, result)) => Some(Completed::Write { sink, result }),
                Poll::Pending => None,
            },
            InFlight::Close { fut } => match fut.as_mut().poll(cx) {
                Poll::Ready(result) => Some(Completed::Close { result }),
                Poll::Pending => None,
            },
            InFlight::Abort { fut, completion } => match fut.as_mut().poll(cx) {
                Poll::Ready(result) => Some(Completed::Abort {
                    result,
                    completion: completion.take(),
                }),
                Poll::Pending => None,
            },
        }
    }
}

pub trait WritableSink<T: MaybeSend + 'static>: MaybeSend + Sized + 'static {
    /// Start the sink. No writes are dispatched until this settles;
    /// rejection errors the stream.
    fn start(
        &mut self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Write a chunk to the sink. Called at most one at a time, in
    /// submission order; its settlement drives queue advancement.
    fn write(
        &mut self,
        chunk: T,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend;

    /// Close the sink. Called once, after the last queued chunk was written.
    fn close(
        self,
        controller: &mut WritableStreamDefaultController,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = controller;
        future::ready(Ok(())) // default no-op
    }

    /// Abort the sink. Called at most once; its settlement completes the
    /// caller's abort future.
    fn abort(
        &mut self,
        reason: Option<String>,
    ) -> impl Future<Output = StreamResult<()>> + MaybeSend {
        let _ = reason;
        future::ready(Ok(())) // default no-op
    }
}

/// The control surface handed to the sink's callbacks.
#[derive(Clone)]
pub struct WritableStreamDefaultController {
    tx: UnboundedSender<ControllerMsg>,
    queue_total_size: SharedPtr<RwLock<f64>>,
    high_water_mark: f64,
}

impl WritableStreamDefaultController {
    /// Signal an error on the stream. Only acts while the stream is still
    /// writable; later calls are ignored.
    pub fn error(&self, error: StreamError) {
        // ignore send failure if the driver is gone
        let _ = self.tx.unbounded_send(ControllerMsg::Error(error));
    }

    /// `high_water_mark - totalSize` of the queue, in strategy units.
    pub fn desired_size(&self) -> f64 {
        self.high_water_mark - *self.queue_total_size.read()
    }
}

struct WritableStreamInner<T, Sink> {
    state: InnerState,
    queue: SizeQueue<WriteRecord<T>>,
    strategy: BoxedStrategy<T>,
    high_water_mark: f64,
    sink: Option<Sink>,
    /// Flips true exactly once, when the sink's start settles.
    started: bool,
    backpressure: bool,

    /// Pending write completions, in submission order. The head moves to
    /// `in_flight_write_request` when its chunk is handed to the sink.
    write_requests: VecDeque<CompletionTx>,
    in_flight_write_request: Option<CompletionTx>,
    in_flight_close_request: Option<CompletionTx>,
    close_request: Option<CompletionTx>,
    pending_abort: Option<PendingAbort>,

    /// Flush waiters, each counting down the writes outstanding at request
    /// time.
    flush_waiters: Vec<(CompletionTx, usize)>,

    mirror: StateMirror,
}

impl<T, Sink> WritableStreamInner<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    fn get_stored_error(&self) -> StreamError {
        self.mirror.get_stored_error()
    }

    fn set_stored_error(&self, error: StreamError) {
        *self.mirror.stored_error.write() = Some(error);
    }

    fn clear_stored_error(&self) {
        *self.mirror.stored_error.write() = None;
    }

    fn close_queued_or_in_flight(&self) -> bool {
        self.close_request.is_some() || self.in_flight_close_request.is_some()
    }

    fn update_backpressure(&mut self) {
        self.backpressure = self.high_water_mark - self.queue.total_size() <= 0.0;
    }

    /// Publish the driver's state to the shared mirror and wake any waiters
    /// whose condition now holds.
    fn update_flags(&self) {
        let mirror = &self.mirror;
        mirror.backpressure.store(self.backpressure, Ordering::SeqCst);
        mirror
            .closed
            .store(matches!(self.state, InnerState::Closed), Ordering::SeqCst);
        mirror
            .errored
            .store(matches!(self.state, InnerState::Errored), Ordering::SeqCst);
        mirror.erroring.store(
            matches!(self.state, InnerState::Erroring(_)),
            Ordering::SeqCst,
        );
        mirror
            .close_requested
            .store(self.close_queued_or_in_flight(), Ordering::SeqCst);
        *mirror.queue_total_size.write() = self.queue.total_size();

        if matches!(self.state, InnerState::Closed | InnerState::Errored) {
            mirror.closed_wakers.wake_all();
        }

        if !self.backpressure
            || !matches!(self.state, InnerState::Writable)
            || self.close_queued_or_in_flight()
        {
            mirror.ready_wakers.wake_all();
        }
    }

    fn handle_command(&mut self, command: StreamCommand<T>) {
        match command {
            StreamCommand::Write { chunk, completion } => self.handle_write(chunk, completion),
            StreamCommand::Close { completion } => self.handle_close(completion),
            StreamCommand::Abort { reason, completion } => self.handle_abort(reason, completion),
            StreamCommand::Flush { completion } => self.handle_flush(completion),
            StreamCommand::RegisterReadyWaker { waker, released } => {
                self.register_ready_waker(waker, &released)
            }
            StreamCommand::RegisterClosedWaker { waker, released } => {
                self.register_closed_waker(waker, &released)
            }
        }
    }

    fn handle_write(&mut self, chunk: T, completion: CompletionTx) {
        match &self.state {
            InnerState::Errored => {
                let _ = completion.send(Err(self.get_stored_error()));
                return;
            }
            InnerState::Erroring(error) => {
                let error = error.clone();
                let _ = completion.send(Err(error));
                return;
            }
            InnerState::Closed => {
                let _ = completion.send(Err(StreamError::Closed));
                return;
            }
            InnerState::Writable => {}
        }
        if self.close_queued_or_in_flight() {
            let _ = completion.send(Err(StreamError::Closing));
            return;
        }

        let size = self.strategy.size(&chunk);
        self.write_requests.push_back(completion);
        if let Err(error) = self.queue.enqueue(WriteRecord::Chunk(Some(chunk)), size) {
            // The request pushed above rejects with this error once erroring
            // finishes.
            self.error_if_needed(error);
            return;
        }
        if self.close_request.is_none() {
            self.update_backpressure();
        }
        self.update_flags();
    }

    fn handle_close(&mut self, completion: CompletionTx) {
        match &self.state {
            InnerState::Errored => {
                let _ = completion.send(Err(self.get_stored_error()));
                return;
            }
            InnerState::Closed => {
                let _ = completion.send(Err(StreamError::Closed));
                return;
            }
            InnerState::Writable | InnerState::Erroring(_) => {}
        }
        if self.close_queued_or_in_flight() {
            let _ = completion.send(Err(StreamError::Closing));
            return;
        }
        self.close_request = Some(completion);
        // the sentinel has size zero, so validation cannot fail
        let _ = self.queue.enqueue(WriteRecord::Close, 0.0);
        // a closing stream is trivially ready; update_flags wakes ready
        // waiters
        self.update_flags();
    }

    fn handle_abort(&mut self, reason: Option<String>, completion: CompletionTx) {
        match &self.state {
            InnerState::Closed => {
                let _ = completion.send(Ok(()));
                return;
            }
            InnerState::Errored => {
                let _ = completion.send(Err(self.get_stored_error()));
                return;
            }
            InnerState::Writable | InnerState::Erroring(_) => {}
        }
        if self.pending_abort.is_some() {
            // one recorded abort at a time; later callers get a fresh abort
            // error
            let _ = completion.send(Err(StreamError::Aborted(reason)));
            return;
        }

        let was_already_erroring = matches!(self.state, InnerState::Erroring(_));
        let abort_error = StreamError::Aborted(reason.clone());
        debug!(erroring = was_already_erroring, "abort requested");
        self.pending_abort = Some(PendingAbort {
            reason,
            completion,
            was_already_erroring,
        });
        if !was_already_erroring {
            self.start_erroring(abort_error);
        }
    }

    fn handle_flush(&mut self, completion: CompletionTx) {
        match &self.state {
            InnerState::Errored => {
                let _ = completion.send(Err(self.get_stored_error()));
                return;
            }
            InnerState::Erroring(error) => {
                let error = error.clone();
                let _ = completion.send(Err(error));
                return;
            }
            InnerState::Closed | InnerState::Writable => {}
        }
        let outstanding =
            self.write_requests.len() + usize::from(self.in_flight_write_request.is_some());
        if outstanding == 0 {
            let _ = completion.send(Ok(()));
        } else {
            self.flush_waiters.push((completion, outstanding));
        }
    }

    fn register_ready_waker(&self, waker: Waker, released: &AtomicBool) {
        self.mirror.ready_wakers.register(&waker);
        // Wake immediately if `ready` would already settle, so a
        // registration racing a state change is never lost.
        if released.load(Ordering::SeqCst)
            || !self.backpressure
            || !matches!(self.state, InnerState::Writable)
            || self.close_queued_or_in_flight()
        {
            self.mirror.ready_wakers.wake_all();
        }
    }

    fn register_closed_waker(&self, waker: Waker, released: &AtomicBool) {
        self.mirror.closed_wakers.register(&waker);
        if released.load(Ordering::SeqCst)
            || matches!(self.state, InnerState::Closed | InnerState::Errored)
        {
            self.mirror.closed_wakers.wake_all();
        }
    }

    /// Error the stream unless it already left the writable state.
    fn error_if_needed(&mut self, error: StreamError) {
        if matches!(self.state, InnerState::Writable) {
            self.start_erroring(error);
        }
    }

    fn start_erroring(&mut self, error: StreamError) {
        debug_assert!(matches!(self.state, InnerState::Writable));
        debug!(%error, "stream erroring");
        self.set_stored_error(error.clone());
        self.state = InnerState::Erroring(error);
        self.update_flags();
    }

    /// Finish the erroring phase: clear the queue, reject everything parked,
    /// and hand back the sink abort operation if an abort is recorded.
    fn finish_erroring(&mut self) -> Option<InFlight<Sink>> {
        let error = match &self.state {
            InnerState::Erroring(error) => error.clone(),
            _ => return None,
        };
        debug_assert!(self.in_flight_write_request.is_none());
        debug_assert!(self.in_flight_close_request.is_none());

        self.state = InnerState::Errored;
        debug!(%error, "stream errored");
        self.queue.clear();
        // publish the terminal state before waking any completion
        self.update_flags();
        for completion in self.write_requests.drain(..) {
            let _ = completion.send(Err(error.clone()));
        }
        for (completion, _) in self.flush_waiters.drain(..) {
            let _ = completion.send(Err(error.clone()));
        }

        match self.pending_abort.take() {
            None => {
                self.reject_close_and_closed(&error);
                None
            }
            Some(pending) if pending.was_already_erroring => {
                let _ = pending.completion.send(Err(error.clone()));
                self.reject_close_and_closed(&error);
                None
            }
            Some(pending) => match self.sink.take() {
                Some(mut sink) => {
                    let reason = pending.reason;
                    trace!("dispatching sink abort");
                    Some(InFlight::Abort {
                        fut: Box::pin(async move { sink.abort(reason).await }),
                        completion: Some(pending.completion),
                    })
                }
                None => {
                    let _ = pending.completion.send(Ok(()));
                    self.reject_close_and_closed(&error);
                    None
                }
            },
        }
    }

    fn reject_close_and_closed(&mut self, error: &StreamError) {
        if let Some(completion) = self.close_request.take() {
            let _ = completion.send(Err(error.clone()));
        }
        self.update_flags();
    }

    fn deal_with_rejection(&mut self, error: StreamError) {
        // While already erroring the original error wins; the next advance
        // finishes it.
        if matches!(self.state, InnerState::Writable) {
            self.start_erroring(error);
        }
    }

    /// Dispatch the next sink operation, if any is due.
    fn advance(&mut self, controller: &WritableStreamDefaultController) -> Option<InFlight<Sink>> {
        if !self.started {
            return None;
        }
        match &self.state {
            InnerState::Closed | InnerState::Errored => None,
            InnerState::Erroring(_) => self.finish_erroring(),
            InnerState::Writable => {
                if self.in_flight_write_request.is_some() || self.in_flight_close_request.is_some()
                {
                    return None;
                }
                match self.queue.peek() {
                    None => None,
                    Some(WriteRecord::Close) => self.process_close(controller),
                    Some(WriteRecord::Chunk(_)) => self.process_write(controller),
                }
            }
        }
    }

    fn process_write(
        &mut self,
        controller: &WritableStreamDefaultController,
    ) -> Option<InFlight<Sink>> {
        let chunk = match self.queue.peek_mut() {
            Some(WriteRecord::Chunk(slot)) => slot.take(),
            _ => None,
        };
        let (Some(chunk), Some(request), Some(mut sink)) =
            (chunk, self.write_requests.pop_front(), self.sink.take())
        else {
            debug_assert!(
                false,
                "write dispatch without chunk, request, and sink lined up"
            );
            return None;
        };
        self.in_flight_write_request = Some(request);

        let mut ctrl = controller.clone();
        trace!("dispatching sink write");
        Some(InFlight::Write {
            fut: Box::pin(async move {
                let result = sink.write(chunk, &mut ctrl).await;
                (sink, result)
            }),
        })
    }

    fn process_close(
        &mut self,
        controller: &WritableStreamDefaultController,
    ) -> Option<InFlight<Sink>> {
        let (Some(request), Some(sink)) = (self.close_request.take(), self.sink.take()) else {
            debug_assert!(
                false,
                "close dispatch without a close request and sink lined up"
            );
            return None;
        };
        self.in_flight_close_request = Some(request);

        debug_assert!(matches!(self.queue.peek(), Some(WriteRecord::Close)));
        self.queue.dequeue();
        debug_assert!(self.queue.is_empty());
        self.update_flags();

        let mut ctrl = controller.clone();
        trace!("dispatching sink close");
        Some(InFlight::Close {
            fut: Box::pin(async move { sink.close(&mut ctrl).await }),
        })
    }

    fn finish_start(&mut self, sink: Sink, result: StreamResult<()>) {
        self.sink = Some(sink);
        self.started = true;
        match result {
            Ok(()) => trace!("sink start settled"),
            Err(error) => {
                debug!(%error, "sink start failed");
                self.deal_with_rejection(error);
            }
        }
        self.update_flags();
    }

    fn finish_in_flight_write(&mut self, sink: Sink, result: StreamResult<()>) {
        self.sink = Some(sink);
        let Some(request) = self.in_flight_write_request.take() else {
            debug_assert!(false, "sink write settled without an in-flight request");
            return;
        };
        match result {
            Ok(()) => {
                trace!("sink write settled");
                // the just-completed record leaves the queue only now
                debug_assert!(matches!(self.queue.peek(), Some(WriteRecord::Chunk(None))));
                self.queue.dequeue();
                if !self.close_queued_or_in_flight() && matches!(self.state, InnerState::Writable)
                {
                    self.update_backpressure();
                }
                self.update_flags();
                let _ = request.send(Ok(()));
                if matches!(self.state, InnerState::Writable) {
                    self.note_write_settled();
                }
            }
            Err(error) => {
                self.deal_with_rejection(error.clone());
                self.update_flags();
                let _ = request.send(Err(error));
            }
        }
    }

    fn finish_in_flight_close(&mut self, result: StreamResult<()>) {
        let Some(request) = self.in_flight_close_request.take() else {
            debug_assert!(false, "sink close settled without an in-flight close request");
            return;
        };
        match result {
            Ok(()) => {
                let was_erroring = matches!(self.state, InnerState::Erroring(_));
                let pending = self.pending_abort.take();
                if was_erroring {
                    if pending.is_some() {
                        // the abort raced an in-flight close and the close won
                        self.state = InnerState::Errored;
                        self.set_stored_error(StreamError::AbortedAfterClose);
                        debug!("close settled under a pending abort; stream errored");
                    } else {
                        self.clear_stored_error();
                        self.state = InnerState::Closed;
                        debug!("stream closed");
                    }
                } else {
                    self.state = InnerState::Closed;
                    debug!("stream closed");
                }
                self.update_flags();
                let _ = request.send(Ok(()));
                if let Some(pending) = pending {
                    let _ = pending.completion.send(Ok(()));
                }
            }
            Err(error) => {
                let pending = self.pending_abort.take();
                self.deal_with_rejection(error.clone());
                self.update_flags();
                let _ = request.send(Err(error.clone()));
                if let Some(pending) = pending {
                    let _ = pending.completion.send(Err(error));
                }
            }
        }
    }

    fn finish_sink_abort(&mut self, result: StreamResult<()>, completion: Option<CompletionTx>) {
        let stored = self.get_stored_error();
        if let Some(completion) = completion {
            // resolves on sink abort fulfilment, forwards its rejection
            let _ = completion.send(result);
        }
        self.reject_close_and_closed(&stored);
    }

    /// A sink write settled successfully: count it down for flush waiters.
    fn note_write_settled(&mut self) {
        let mut i = 0;
        while i < self.flush_waiters.len() {
            self.flush_waiters[i].1 -= 1;
            if self.flush_waiters[i].1 == 0 {
                let (completion, _) = self.flush_waiters.swap_remove(i);
                let _ = completion.send(Ok(()));
            } else {
                i += 1;
            }
        }
    }
}

async fn stream_task<T, Sink>(
    mut command_rx: UnboundedReceiver<StreamCommand<T>>,
    mut ctrl_rx: UnboundedReceiver<ControllerMsg>,
    mut inner: WritableStreamInner<T, Sink>,
    controller: WritableStreamDefaultController,
) where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    let mut in_flight: Option<InFlight<Sink>> = None;
    let mut commands_done = false;

    // The sink's start runs first; queued work waits behind the started
    // flag.
    if let Some(mut sink) = inner.sink.take() {
        let mut ctrl = controller.clone();
        in_flight = Some(InFlight::Start {
            fut: Box::pin(async move {
                let result = sink.start(&mut ctrl).await;
                (sink, result)
            }),
        });
    }

    poll_fn(|cx| {
        // Controller-originated errors first, so commands below observe
        // them.
        loop {
            match ctrl_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(ControllerMsg::Error(error))) => {
                    inner.error_if_needed(error);
                }
                Poll::Ready(None) | Poll::Pending => break,
            }
        }

        // Drain every queued producer command.
        while !commands_done {
            match command_rx.poll_next_unpin(cx) {
                Poll::Ready(Some(command)) => inner.handle_command(command),
                Poll::Ready(None) => commands_done = true,
                Poll::Pending => break,
            }
        }

        // Drive the in-flight sink operation, if any.
        let mut completed = None;
        if let Some(op) = in_flight.as_mut() {
            completed = op.poll(cx);
        }
        if let Some(done) = completed {
            in_flight = None;
            match done {
                Completed::Start { sink, result } => inner.finish_start(sink, result),
                Completed::Write { sink, result } => inner.finish_in_flight_write(sink, result),
                Completed::Close { result } => inner.finish_in_flight_close(result),
                Completed::Abort { result, completion } => {
                    inner.finish_sink_abort(result, completion)
                }
            }
            cx.waker().wake_by_ref();
        }

        // Dispatch the next operation when nothing is in flight.
        if in_flight.is_none() {
            if let Some(op) = inner.advance(&controller) {
                in_flight = Some(op);
                cx.waker().wake_by_ref();
            }
        }

        // All handles gone and nothing left to drive.
        if commands_done && in_flight.is_none() && inner.queue.is_empty() {
            return Poll::Ready(());
        }
        Poll::Pending
    })
    .await;
}

/// The unlocked stream handle: acquire a writer, or abort from the outside.
pub struct WritableStream<T: MaybeSend + 'static> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    mirror: StateMirror,
    high_water_mark: f64,
}

impl<T: MaybeSend + 'static> Clone for WritableStream<T> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            mirror: self.mirror.clone(),
            high_water_mark: self.high_water_mark,
        }
    }
}

impl<T: MaybeSend + 'static> WritableStream<T> {
    /// Returns a builder for a writable stream over the given sink
    pub fn builder<Sink>(sink: Sink) -> WritableStreamBuilder<T, Sink>
    where
        Sink: WritableSink<T> + 'static,
    {
        WritableStreamBuilder::new(sink)
    }

    pub(crate) fn new_inner<Sink>(
        sink: Sink,
        strategy: BoxedStrategy<T>,
        high_water_mark: f64,
    ) -> (Self, impl Future<Output = ()>)
    where
        Sink: WritableSink<T> + 'static,
    {
        let (command_tx, command_rx) = unbounded();
        let (ctrl_tx, ctrl_rx) = unbounded();
        let mirror = StateMirror::new(high_water_mark <= 0.0);
        let controller = WritableStreamDefaultController {
            tx: ctrl_tx,
            queue_total_size: SharedPtr::clone(&mirror.queue_total_size),
            high_water_mark,
        };
        let inner = WritableStreamInner {
            state: InnerState::Writable,
            queue: SizeQueue::new(),
            strategy,
            high_water_mark,
            sink: Some(sink),
            started: false,
            backpressure: high_water_mark <= 0.0,
            write_requests: VecDeque::new(),
            in_flight_write_request: None,
            in_flight_close_request: None,
            close_request: None,
            pending_abort: None,
            flush_waiters: Vec::new(),
            mirror: mirror.clone(),
        };
        let fut = stream_task(command_rx, ctrl_rx, inner, controller);
        let stream = Self {
            command_tx,
            mirror,
            high_water_mark,
        };
        (stream, fut)
    }

    /// Whether a writer currently holds the lock.
    pub fn locked(&self) -> bool {
        self.mirror.locked.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> StreamState {
        if self.mirror.errored.load(Ordering::SeqCst) {
            StreamState::Errored
        } else if self.mirror.closed.load(Ordering::SeqCst) {
            StreamState::Closed
        } else {
            StreamState::Writable
        }
    }

    /// Acquire the exclusive writer for this stream.
    ///
    /// Fails with a lock error if a writer is already attached.
    pub fn get_writer(&self) -> StreamResult<WritableStreamDefaultWriter<T>> {
        // Attempt to atomically acquire the lock:
        if self
            .mirror
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::Locked);
        }

        Ok(WritableStreamDefaultWriter {
            command_tx: self.command_tx.clone(),
            mirror: self.mirror.clone(),
            high_water_mark: self.high_water_mark,
            released: SharedPtr::new(AtomicBool::new(false)),
            flush_receiver: None,
            close_receiver: None,
        })
    }

    /// Abort the stream from the stream-level surface, signaling that no
    /// more data will be written.
    ///
    /// The request is recorded at call time. Rejects with a lock error
    /// while a writer holds the lock; the writer's own `abort` bypasses
    /// that check.
    pub fn abort(&self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
        let sent = if self.locked() {
            Err(StreamError::Locked)
        } else {
            let (tx, rx) = oneshot::channel();
            self.command_tx
                .unbounded_send(StreamCommand::Abort {
                    reason,
                    completion: tx,
                })
                .map(|_| rx)
                .map_err(|_| StreamError::TaskDropped)
        };
        async move {
            let rx = sent?;
            rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
        }
    }
}

/// The exclusive handle a producer writes through.
///
/// Dropping the writer releases the lock; in-flight and queued work
/// continues to completion, but its completions no longer signal to this
/// writer.
#[pin_project(PinnedDrop)]
pub struct WritableStreamDefaultWriter<T: MaybeSend + 'static> {
    command_tx: UnboundedSender<StreamCommand<T>>,
    mirror: StateMirror,
    high_water_mark: f64,
    released: SharedPtr<AtomicBool>,
    #[pin]
    flush_receiver: Option<oneshot::Receiver<StreamResult<()>>>,
    #[pin]
    close_receiver: Option<oneshot::Receiver<StreamResult<()>>>,
}

#[pinned_drop]
impl<T: MaybeSend + 'static> PinnedDrop for WritableStreamDefaultWriter<T> {
    fn drop(self: Pin<&mut Self>) {
        self.release_inner();
    }
}

impl<T: MaybeSend + 'static> WritableStreamDefaultWriter<T> {
    /// Write a chunk to the stream by immediately enqueueing it for writing.
    ///
    /// The chunk is queued at call time; the returned future resolves when
    /// the chunk's sink write settles, or rejects when the stream errors
    /// before then.
    ///
    /// # Important
    ///
    /// Calling `write()` repeatedly *without* awaiting the returned futures
    /// or `ready()` (i.e. without respecting backpressure) can grow the
    /// internal queue without bound. Await each write, or await [`ready()`]
    /// between writes, to stay inside the configured high water mark.
    ///
    /// [`ready()`]: Self::ready
    pub fn write(&self, chunk: T) -> impl Future<Output = StreamResult<()>> {
        let sent = if self.released.load(Ordering::SeqCst) {
            Err(StreamError::Released)
        } else {
            let (tx, rx) = oneshot::channel();
            self.command_tx
                .unbounded_send(StreamCommand::Write {
                    chunk,
                    completion: tx,
                })
                .map(|_| rx)
                .map_err(|_| StreamError::TaskDropped)
        };

        async move {
            let rx = sent?;
            rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
        }
    }

    /// Close the stream once every queued chunk has been written.
    ///
    /// The close request is recorded at call time; writes submitted after
    /// this call reject. Rejects if the stream is not writable or a close
    /// is already pending.
    pub fn close(&self) -> impl Future<Output = StreamResult<()>> {
        let sent = if self.released.load(Ordering::SeqCst) {
            Err(StreamError::Released)
        } else {
            let (tx, rx) = oneshot::channel();
            self.command_tx
                .unbounded_send(StreamCommand::Close { completion: tx })
                .map(|_| rx)
                .map_err(|_| StreamError::TaskDropped)
        };
        async move {
            let rx = sent?;
            rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
        }
    }

    /// Abort the stream with an optional reason.
    ///
    /// Queued writes reject with the abort error and are never handed to
    /// the sink; an operation already dispatched to the sink runs to
    /// completion first, and the returned future settles only after the
    /// sink's own abort has settled.
    pub fn abort(&self, reason: Option<String>) -> impl Future<Output = StreamResult<()>> {
        let sent = if self.released.load(Ordering::SeqCst) {
            Err(StreamError::Released)
        } else {
            let (tx, rx) = oneshot::channel();
            self.command_tx
                .unbounded_send(StreamCommand::Abort {
                    reason,
                    completion: tx,
                })
                .map(|_| rx)
                .map_err(|_| StreamError::TaskDropped)
        };
        async move {
            let rx = sent?;
            rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped))
        }
    }

    /// Close the stream, mirroring any error state instead of failing on it.
    ///
    /// For piping-style consumers: a stream that is already closed or
    /// closing resolves immediately, an errored stream rejects with its
    /// stored error, and anything else performs a normal close.
    pub fn close_with_error_propagation(&self) -> impl Future<Output = StreamResult<()>> {
        let sent = if self.released.load(Ordering::SeqCst) {
            Err(StreamError::Released)
        } else if self.mirror.closed.load(Ordering::SeqCst)
            || self.mirror.close_requested.load(Ordering::SeqCst)
        {
            Ok(None)
        } else if self.mirror.errored.load(Ordering::SeqCst) {
            Err(self.mirror.get_stored_error())
        } else {
            let (tx, rx) = oneshot::channel();
            self.command_tx
                .unbounded_send(StreamCommand::Close { completion: tx })
                .map(|_| Some(rx))
                .map_err(|_| StreamError::TaskDropped)
        };
        async move {
            match sent? {
                None => Ok(()),
                Some(rx) => rx.await.unwrap_or_else(|_| Err(StreamError::TaskDropped)),
            }
        }
    }

    /// How much more data the queue can absorb before backpressure.
    ///
    /// `None` when the stream is errored or an abort is pending, zero when
    /// closed. Fails with a released error once the lock has been released.
    pub fn desired_size(&self) -> StreamResult<Option<f64>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(StreamError::Released);
        }
        if self.mirror.errored.load(Ordering::SeqCst)
            || self.mirror.erroring.load(Ordering::SeqCst)
        {
            return Ok(None);
        }
        if self.mirror.closed.load(Ordering::SeqCst) {
            return Ok(Some(0.0));
        }
        Ok(Some(
            self.high_water_mark - *self.mirror.queue_total_size.read(),
        ))
    }

    /// Resolves while the stream accepts further writes without
    /// backpressure; rejects when the stream errors or this writer releases
    /// its lock. A closing or closed stream counts as trivially ready.
    pub fn ready(&self) -> impl Future<Output = StreamResult<()>> {
        let mirror = self.mirror.clone();
        let released = SharedPtr::clone(&self.released);
        let command_tx = self.command_tx.clone();
        poll_fn(move |cx| {
            if let Some(result) = ready_poll_state(&mirror, &released) {
                return Poll::Ready(result);
            }
            // Not ready, register waker:
            let _ = command_tx.unbounded_send(StreamCommand::RegisterReadyWaker {
                waker: cx.waker().clone(),
                released: SharedPtr::clone(&released),
            });
            // Re-check after registration to close the race with a
            // concurrent settle
            if let Some(result) = ready_poll_state(&mirror, &released) {
                return Poll::Ready(result);
            }
            Poll::Pending
        })
    }

    /// Resolves when the stream closes cleanly under this writer; rejects
    /// when the stream errors or the writer releases its lock.
    pub fn closed(&self) -> impl Future<Output = StreamResult<()>> {
        let mirror = self.mirror.clone();
        let released = SharedPtr::clone(&self.released);
        let command_tx = self.command_tx.clone();
        poll_fn(move |cx| {
            if let Some(result) = closed_poll_state(&mirror, &released) {
                return Poll::Ready(result);
            }
            let _ = command_tx.unbounded_send(StreamCommand::RegisterClosedWaker {
                waker: cx.waker().clone(),
                released: SharedPtr::clone(&released),
            });
            if let Some(result) = closed_poll_state(&mirror, &released) {
                return Poll::Ready(result);
            }
            Poll::Pending
        })
    }

    /// Release the writer's exclusive lock on the stream.
    ///
    /// Outstanding write futures keep reflecting the sink's eventual
    /// outcome; only the `ready`/`closed` signals detach. A later
    /// `get_writer` call on the stream succeeds and observes the stream's
    /// current state.
    pub fn release_lock(self) {
        self.release_inner();
    }

    fn release_inner(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.mirror.locked.store(false, Ordering::SeqCst);
        // Pending ready()/closed() futures from this writer settle with a
        // released error on their next poll.
        self.mirror.ready_wakers.wake_all();
        self.mirror.closed_wakers.wake_all();
    }
}

fn ready_poll_state(mirror: &StateMirror, released: &AtomicBool) -> Option<Result<(), StreamError>> {
    if released.load(Ordering::SeqCst) {
        return Some(Err(StreamError::Released));
    }
    if mirror.errored.load(Ordering::SeqCst) || mirror.erroring.load(Ordering::SeqCst) {
        return Some(Err(mirror.get_stored_error()));
    }
    if mirror.closed.load(Ordering::SeqCst)
        || mirror.close_requested.load(Ordering::SeqCst)
        || !mirror.backpressure.load(Ordering::SeqCst)
    {
        return Some(Ok(()));
    }
    None
}

fn closed_poll_state(
    mirror: &StateMirror,
    released: &AtomicBool,
) -> Option<Result<(), StreamError>> {
    if released.load(Ordering::SeqCst) {
        return Some(Err(StreamError::Released));
    }
    if mirror.errored.load(Ordering::SeqCst) {
        return Some(Err(mirror.get_stored_error()));
    }
    if mirror.closed.load(Ordering::SeqCst) {
        return Some(Ok(()));
    }
    None
}

impl<T: MaybeSend + 'static> futures::Sink<T> for WritableStreamDefaultWriter<T> {
    type Error = StreamError;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.released.load(Ordering::SeqCst) {
            return Poll::Ready(Err(StreamError::Released));
        }
        if self.mirror.errored.load(Ordering::SeqCst)
            || self.mirror.erroring.load(Ordering::SeqCst)
        {
            return Poll::Ready(Err(self.mirror.get_stored_error()));
        }
        if self.mirror.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(StreamError::Closed));
        }
        if self.mirror.close_requested.load(Ordering::SeqCst) {
            return Poll::Ready(Err(StreamError::Closing));
        }
        if !self.mirror.backpressure.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        let _ = self
            .command_tx
            .unbounded_send(StreamCommand::RegisterReadyWaker {
                waker: cx.waker().clone(),
                released: SharedPtr::clone(&self.released),
            });
        // Re-check backpressure after registering to avoid a lost wakeup
        if !self.mirror.backpressure.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        Poll::Pending
    }

    fn start_send(self: Pin<&mut Self>, item: T) -> Result<(), Self::Error> {
        if self.released.load(Ordering::SeqCst) {
            return Err(StreamError::Released);
        }
        if self.mirror.errored.load(Ordering::SeqCst)
            || self.mirror.erroring.load(Ordering::SeqCst)
        {
            return Err(self.mirror.get_stored_error());
        }
        if self.mirror.closed.load(Ordering::SeqCst) {
            return Err(StreamError::Closed);
        }
        if self.mirror.close_requested.load(Ordering::SeqCst) {
            return Err(StreamError::Closing);
        }
        // Completion is observed through poll_flush rather than per item.
        let (tx, _rx) = oneshot::channel();
        self.command_tx
            .unbounded_send(StreamCommand::Write {
                chunk: item,
                completion: tx,
            })
            .map_err(|_| StreamError::TaskDropped)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();

        if this.mirror.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(this.mirror.get_stored_error()));
        }

        // If there's no flush_receiver yet, initiate a flush and store the
        // receiver
        if this.flush_receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Flush { completion: tx })
                .is_err()
            {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            this.flush_receiver.set(Some(rx));
        }

        if let Some(rx) = this.flush_receiver.as_mut().as_pin_mut() {
            match rx.poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.flush_receiver.set(None);
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    this.flush_receiver.set(None);
                    Poll::Ready(Err(StreamError::TaskDropped))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Err(StreamError::TaskDropped))
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut this = self.project();

        if this.mirror.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Ok(()));
        }
        if this.mirror.errored.load(Ordering::SeqCst) {
            return Poll::Ready(Err(this.mirror.get_stored_error()));
        }

        if this.close_receiver.is_none() {
            let (tx, rx) = oneshot::channel();
            if this
                .command_tx
                .unbounded_send(StreamCommand::Close { completion: tx })
                .is_err()
            {
                return Poll::Ready(Err(StreamError::TaskDropped));
            }
            this.close_receiver.set(Some(rx));
        }

        if let Some(rx) = this.close_receiver.as_mut().as_pin_mut() {
            match rx.poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.close_receiver.set(None);
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    this.close_receiver.set(None);
                    Poll::Ready(Err(StreamError::TaskDropped))
                }
                Poll::Pending => Poll::Pending,
            }
        } else {
            Poll::Ready(Err(StreamError::TaskDropped))
        }
    }
}

pub struct WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    sink: Sink,
    strategy: BoxedStrategy<T>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T, Sink> WritableStreamBuilder<T, Sink>
where
    T: MaybeSend + 'static,
    Sink: WritableSink<T> + 'static,
{
    fn new(sink: Sink) -> Self {
        Self {
            sink,
            strategy: Box::new(CountQueuingStrategy::new(1.0)),
            _phantom: PhantomData,
        }
    }

    pub fn strategy<S>(mut self, strategy: S) -> Self
    where
        S: QueuingStrategy<T> + MaybeSend + 'static,
    {
        self.strategy = Box::new(strategy);
        self
    }

    /// Return stream + driver future without spawning.
    ///
    /// Fails synchronously when the strategy's high water mark is NaN,
    /// negative, or infinite.
    pub fn prepare(self) -> StreamResult<(WritableStream<T>, impl Future<Output = ()>)> {
        let high_water_mark = self.strategy.high_water_mark();
        if !high_water_mark.is_finite() || high_water_mark < 0.0 {
            return Err(StreamError::InvalidHighWaterMark(high_water_mark));
        }
        Ok(WritableStream::new_inner(
            self.sink,
            self.strategy,
            high_water_mark,
        ))
    }

    /// Spawn with an owned spawner function
    pub fn spawn<F, R>(self, spawn_fn: F) -> StreamResult<WritableStream<T>>
    where
        F: FnOnce(PlatformFuture<'static, ()>) -> R,
    {
        let (stream, fut) = self.prepare()?;
        spawn_fn(Box::pin(fut));
        Ok(stream)
    }
}
