use std::sync::Arc;
use std::time::{Duration, Instant};

use msrp_fsm::cpim::MessageMetadata;
use msrp_fsm::store::ContentStore;
use msrp_fsm::{
    ChunkPiece, LoopbackTransport, MessageId, MsrpApplication, MsrpConfig, MsrpUri,
    OutgoingMessage, ParticipantRef, ParticipantRegistry, Report, Role, SendFailure, SessionId,
    SessionPaths, StatusCode, Transport,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Established,
    Received {
        message_id: MessageId,
        contents: Vec<u8>,
        aborted: bool,
        content_type: Option<String>,
    },
    Sent(MessageId),
    Failed(MessageId, SendFailure),
    Report(MessageId, StatusCode),
    Closed,
}

struct App {
    events: Mutex<Vec<Event>>,
    answer: StatusCode,
}

impl App {
    fn new(answer: StatusCode) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            answer,
        })
    }

    fn has(&self, predicate: impl Fn(&Event) -> bool) -> bool {
        self.events.lock().iter().any(predicate)
    }

    fn received(&self) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|event| matches!(event, Event::Received { .. }))
            .cloned()
            .collect()
    }
}

impl MsrpApplication for App {
    fn request_received(&self, _session: &SessionPaths, _chunk: &ChunkPiece) -> StatusCode {
        self.answer
    }

    fn message_received(
        &self,
        message_id: &MessageId,
        metadata: &MessageMetadata,
        store: Box<dyn ContentStore>,
    ) {
        self.events.lock().push(Event::Received {
            message_id: message_id.clone(),
            contents: store.contents().unwrap_or_default().to_vec(),
            aborted: store.was_aborted(),
            content_type: metadata.content_type.clone(),
        });
    }

    fn message_sent(&self, message_id: &MessageId) {
        self.events.lock().push(Event::Sent(message_id.clone()));
    }

    fn message_failed(&self, message_id: &MessageId, failure: SendFailure) {
        self.events
            .lock()
            .push(Event::Failed(message_id.clone(), failure));
    }

    fn report_received(&self, report: &Report) {
        self.events
            .lock()
            .push(Event::Report(report.message_id.clone(), report.status));
    }

    fn connection_established(&self, _local: &MsrpUri) {
        self.events.lock().push(Event::Established);
    }

    fn connection_closed(&self, _local: &MsrpUri) {
        self.events.lock().push(Event::Closed);
    }
}

fn eventually(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

struct Session {
    registry: Arc<ParticipantRegistry>,
    alice: ParticipantRef,
    alice_app: Arc<App>,
    bob: ParticipantRef,
    bob_app: Arc<App>,
}

/// Two participants of one registry, connected over loopback and bound.
fn connect(runtime: Handle, config: MsrpConfig, bob_answers: StatusCode) -> Session {
    let registry = ParticipantRegistry::new("127.0.0.1", 2855, config, runtime.clone());
    let alice_uri = MsrpUri::new("127.0.0.1", 2855, &SessionId::generate()).unwrap();
    let bob_uri = MsrpUri::new("127.0.0.1", 2855, &SessionId::generate()).unwrap();
    let (alice_end, bob_end) = LoopbackTransport::pair(runtime);
    let alice_app = App::new(StatusCode::OK);
    let bob_app = App::new(bob_answers);

    let alice = registry
        .create_participant_at(
            SessionPaths {
                local: alice_uri.clone(),
                remote: bob_uri.clone(),
            },
            Arc::clone(&alice_end) as Arc<dyn Transport>,
            Arc::clone(&alice_app) as Arc<dyn MsrpApplication>,
        )
        .unwrap();
    let bob = registry
        .create_participant_at(
            SessionPaths {
                local: bob_uri,
                remote: alice_uri,
            },
            Arc::clone(&bob_end) as Arc<dyn Transport>,
            Arc::clone(&bob_app) as Arc<dyn MsrpApplication>,
        )
        .unwrap();
    assert!(alice_end.attach(alice.frame_handler()));
    assert!(bob_end.attach(bob.frame_handler()));

    bob.view(|p| p.open(Role::Passive)).unwrap().unwrap();
    alice.view(|p| p.open(Role::Active)).unwrap().unwrap();
    assert!(eventually(|| alice_app.has(|e| *e == Event::Established)
        && bob_app.has(|e| *e == Event::Established)));

    Session {
        registry,
        alice,
        alice_app,
        bob,
        bob_app,
    }
}

fn run_blocking<F: FnOnce(Handle) + Send + 'static>(test: F) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let handle = runtime.handle().clone();
    runtime.block_on(async move {
        tokio::task::spawn_blocking(move || test(handle)).await.unwrap();
    });
}

#[test]
fn test_chunked_message_arrives_intact() {
    run_blocking(|runtime| {
        let config = MsrpConfig::builder().max_chunk_size(1000).read_size(256).build();
        let session = connect(runtime, config, StatusCode::OK);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let message = OutgoingMessage::new("application/octet-stream", payload.clone())
            .with_success_report(true);
        let message_id = session
            .alice
            .view(|p| p.send_message(message))
            .unwrap()
            .unwrap();

        assert!(eventually(|| session.alice_app.has(|e| *e == Event::Sent(message_id.clone()))));
        assert!(eventually(|| !session.bob_app.received().is_empty()));
        assert_eq!(
            session.bob_app.received(),
            vec![Event::Received {
                message_id: message_id.clone(),
                contents: payload,
                aborted: false,
                content_type: Some("application/octet-stream".to_string()),
            }]
        );
        assert!(eventually(|| session
            .alice_app
            .has(|e| *e == Event::Report(message_id.clone(), StatusCode::OK))));
    });
}

#[test]
fn test_messages_are_delivered_in_order() {
    run_blocking(|runtime| {
        let config = MsrpConfig::builder().max_chunk_size(64).build();
        let session = connect(runtime, config, StatusCode::OK);

        let ids: Vec<MessageId> = ["first", "second", "third"]
            .into_iter()
            .map(|text| {
                let message = OutgoingMessage::new("text/plain", text.repeat(40));
                session.alice.view(|p| p.send_message(message)).unwrap().unwrap()
            })
            .collect();

        assert!(eventually(|| session.bob_app.received().len() == 3));
        let received: Vec<MessageId> = session
            .bob_app
            .received()
            .into_iter()
            .filter_map(|event| match event {
                Event::Received { message_id, .. } => Some(message_id),
                _ => None,
            })
            .collect();
        assert_eq!(received, ids);
    });
}

#[test]
fn test_rejected_chunk_fails_the_message() {
    run_blocking(|runtime| {
        let session = connect(runtime, MsrpConfig::default(), StatusCode::FORBIDDEN);

        let message_id = session
            .alice
            .view(|p| p.send_message(OutgoingMessage::new("text/plain", "nope")))
            .unwrap()
            .unwrap();

        assert!(eventually(|| session.alice_app.has(|e| *e
            == Event::Failed(message_id.clone(), SendFailure::Rejected(StatusCode::FORBIDDEN)))));
        assert!(session.bob_app.received().is_empty());
    });
}

#[test]
fn test_close_tears_down_both_sides() {
    run_blocking(|runtime| {
        let session = connect(runtime, MsrpConfig::default(), StatusCode::OK);
        assert_eq!(session.registry.len(), 2);

        session.alice.view(|p| p.close()).unwrap().unwrap();

        assert!(eventually(|| session.alice_app.has(|e| *e == Event::Closed)
            && session.bob_app.has(|e| *e == Event::Closed)));
        assert!(eventually(|| session.registry.is_empty()));
        // Whoever delivered the last signal may still hold the participant for a moment.
        assert!(eventually(|| session.alice.view(|p| p.state()).is_err()));
        assert!(eventually(|| session.bob.view(|p| p.state()).is_err()));
    });
}
