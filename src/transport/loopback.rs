use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace};

use super::{Completion, FrameHandler, Role, Transport, TransportError};
use crate::message::{Frame, MsrpUri};

/// One end of an in-process connection.
///
/// Frames written on one end are handed to the handler attached to the other end by a blocking
/// task, in write order, once that end is both attached and opened. Completions always run on a
/// blocking task, never on the writer's thread.
pub struct LoopbackTransport {
    name: String,
    runtime: Handle,
    outgoing: Mutex<Option<UnboundedSender<Frame>>>,
    incoming: Mutex<Option<UnboundedReceiver<Frame>>>,
    handler: Mutex<Option<Weak<dyn FrameHandler>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

struct Reader {
    name: String,
    incoming: UnboundedReceiver<Frame>,
    handler: Weak<dyn FrameHandler>,
}

impl Reader {
    fn run(mut self) {
        while let Some(frame) = self.incoming.blocking_recv() {
            let Some(handler) = self.handler.upgrade() else {
                debug!(end = %self.name, "Handler gone, stopping loopback reader");
                return;
            };
            trace!(end = %self.name, ?frame, "Delivering frame");
            handler.frame_received(frame);
        }

        debug!(end = %self.name, "Loopback peer closed");
        if let Some(handler) = self.handler.upgrade() {
            handler.transport_closed();
        }
    }
}

impl LoopbackTransport {
    /// Two connected ends.
    pub fn pair(runtime: Handle) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let end = |name: &str, tx, rx| {
            Arc::new(Self {
                name: name.to_string(),
                runtime: runtime.clone(),
                outgoing: Mutex::new(Some(tx)),
                incoming: Mutex::new(Some(rx)),
                handler: Mutex::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            })
        };
        (end("a", b_tx, a_rx), end("b", a_tx, b_rx))
    }

    /// Deliver frames read on this end to `handler`. Only the first attach counts.
    pub fn attach(&self, handler: Weak<dyn FrameHandler>) -> bool {
        {
            let mut slot = self.handler.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(handler);
        }
        if let Some(reader) = self.take_reader() {
            self.runtime.spawn_blocking(move || reader.run());
        }
        true
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    /// The reader, once this end is attached and opened. Handed out at most once.
    fn take_reader(&self) -> Option<Reader> {
        if !self.connected.load(Ordering::Acquire) {
            return None;
        }
        let handler = self.handler.lock().clone()?;
        let incoming = self.incoming.lock().take()?;
        Some(Reader {
            name: self.name.clone(),
            incoming,
            handler,
        })
    }

    fn complete(&self, done: Completion, result: Result<(), TransportError>) {
        self.runtime.spawn_blocking(move || done(result));
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, role: Role, remote: &MsrpUri, done: Completion) {
        debug!(end = %self.name, %role, %remote, "Opening loopback");
        let result = if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            self.connected.store(true, Ordering::Release);
            Ok(())
        };

        // The opener learns about the connection before the first frame is delivered.
        let reader = self.take_reader();
        self.runtime.spawn_blocking(move || {
            done(result);
            if let Some(reader) = reader {
                reader.run();
            }
        });
    }

    fn write(&self, frame: Frame, done: Completion) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }

        let outgoing = self.outgoing.lock();
        let Some(outgoing) = outgoing.as_ref() else {
            return Err(TransportError::Closed);
        };
        outgoing
            .send(frame)
            .map_err(|_| TransportError::Io("loopback peer is gone".to_string()))?;
        self.complete(done, Ok(()));
        Ok(())
    }

    fn close(&self, done: Completion) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(end = %self.name, "Closing loopback");
        }
        // Dropping the sender ends the peer's reader.
        self.outgoing.lock().take();
        self.complete(done, Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use super::*;
    use crate::ids::TransactionId;
    use crate::message::{Response, StatusCode};

    enum Seen {
        Frame(Frame),
        Closed,
    }

    struct Recorder(Mutex<std_mpsc::Sender<Seen>>);

    impl FrameHandler for Recorder {
        fn frame_received(&self, frame: Frame) {
            let _ = self.0.lock().send(Seen::Frame(frame));
        }

        fn transport_closed(&self) {
            let _ = self.0.lock().send(Seen::Closed);
        }
    }

    fn completion() -> (Completion, std_mpsc::Receiver<Result<(), TransportError>>) {
        let (tx, rx) = std_mpsc::channel();
        (
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            rx,
        )
    }

    fn response(tx: &str) -> Frame {
        Frame::Response(Response {
            transaction_id: TransactionId::from(tx),
            status: StatusCode::OK,
            to_path: "msrp://a.example:1/a;tcp".parse().unwrap(),
            from_path: "msrp://b.example:2/b;tcp".parse().unwrap(),
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_frames_cross_in_order() {
        let (a, b) = LoopbackTransport::pair(Handle::current());
        let (seen_tx, seen) = std_mpsc::channel();
        let recorder: Arc<dyn FrameHandler> = Arc::new(Recorder(Mutex::new(seen_tx)));
        assert!(b.attach(Arc::downgrade(&recorder)));
        assert!(!b.attach(Arc::downgrade(&recorder)));

        let remote = "msrp://b.example:2/b;tcp".parse().unwrap();
        let (done, opened) = completion();
        a.open(Role::Active, &remote, done);
        assert_eq!(opened.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        let local = "msrp://a.example:1/a;tcp".parse().unwrap();
        let (done, accepted) = completion();
        b.open(Role::Passive, &local, done);
        assert_eq!(accepted.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));

        for tx in ["t1", "t2"] {
            let (done, written) = completion();
            a.write(response(tx), done).unwrap();
            assert_eq!(written.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        }

        for tx in ["t1", "t2"] {
            match seen.recv_timeout(Duration::from_secs(5)).unwrap() {
                Seen::Frame(frame) => assert_eq!(frame, response(tx)),
                Seen::Closed => panic!("closed early"),
            }
        }

        let (done, closed) = completion();
        a.close(done);
        assert_eq!(closed.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(()));
        assert!(matches!(
            seen.recv_timeout(Duration::from_secs(5)).unwrap(),
            Seen::Closed
        ));

        let (done, _) = completion();
        assert_eq!(a.write(response("t3"), done), Err(TransportError::Closed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_before_open_is_refused() {
        let (a, _b) = LoopbackTransport::pair(Handle::current());
        let (done, _) = completion();
        assert_eq!(
            a.write(response("t1"), done),
            Err(TransportError::NotConnected)
        );
        assert!(!a.is_connected());
    }
}
