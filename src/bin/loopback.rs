use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use msrp_fsm::cpim::MessageMetadata;
use msrp_fsm::store::ContentStore;
use msrp_fsm::{
    LoopbackTransport, MessageId, MsrpApplication, MsrpConfig, MsrpUri, OutgoingMessage,
    ParticipantRegistry, Role, SendFailure, SessionId, SessionPaths, Transport,
};
use tokio::runtime::Handle;
use tracing::{info, warn};

const HOST: &str = "127.0.0.1";
const PORT: u16 = 2855;
const EVENT_WAIT: Duration = Duration::from_secs(30);

#[derive(Debug)]
enum DemoEvent {
    Established,
    Received { bytes: u64, aborted: bool },
    Sent,
    Failed(SendFailure),
    Closed,
}

struct DemoApp {
    name: &'static str,
    events: Sender<DemoEvent>,
}

impl DemoApp {
    fn new(name: &'static str) -> (Arc<Self>, Receiver<DemoEvent>) {
        let (events, rx) = mpsc::channel();
        (Arc::new(Self { name, events }), rx)
    }

    fn emit(&self, event: DemoEvent) {
        // The receiver outlives every participant.
        let _ = self.events.send(event);
    }
}

impl MsrpApplication for DemoApp {
    fn more_bytes_received(
        &self,
        message_id: &MessageId,
        bytes_so_far: u64,
        expected_total: Option<u64>,
        _store: &dyn ContentStore,
    ) {
        info!(participant = self.name, %message_id, bytes_so_far, ?expected_total, "Progress");
    }

    fn message_received(
        &self,
        message_id: &MessageId,
        metadata: &MessageMetadata,
        mut store: Box<dyn ContentStore>,
    ) {
        info!(
            participant = self.name,
            %message_id,
            from = ?metadata.from,
            content_type = ?metadata.content_type,
            bytes = store.bytes_received(),
            aborted = store.was_aborted(),
            "Message received"
        );
        self.emit(DemoEvent::Received {
            bytes: store.bytes_received(),
            aborted: store.was_aborted(),
        });
        store.release();
    }

    fn message_sent(&self, message_id: &MessageId) {
        info!(participant = self.name, %message_id, "Message sent");
        self.emit(DemoEvent::Sent);
    }

    fn message_failed(&self, message_id: &MessageId, failure: SendFailure) {
        warn!(participant = self.name, %message_id, ?failure, "Message failed");
        self.emit(DemoEvent::Failed(failure));
    }

    fn connection_established(&self, local: &MsrpUri) {
        info!(participant = self.name, %local, "Connected");
        self.emit(DemoEvent::Established);
    }

    fn connection_closed(&self, local: &MsrpUri) {
        info!(participant = self.name, %local, "Disconnected");
        self.emit(DemoEvent::Closed);
    }
}

/// Block until `events` yields something `accept` takes, failing on [`DemoEvent::Failed`].
fn wait_for(
    events: &Receiver<DemoEvent>,
    accept: impl Fn(&DemoEvent) -> bool,
) -> Result<DemoEvent> {
    let deadline = Instant::now() + EVENT_WAIT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = events.recv_timeout(remaining)?;
        if let DemoEvent::Failed(failure) = &event {
            bail!("transfer failed: {failure:?}");
        }
        if accept(&event) {
            return Ok(event);
        }
    }
}

fn run(runtime: Handle, payload_size: usize, chunk_size: usize) -> Result<()> {
    let config = MsrpConfig::builder().max_chunk_size(chunk_size).build();
    let registry = ParticipantRegistry::new(HOST, PORT, config, runtime.clone());

    let alice_uri = MsrpUri::new(HOST, PORT, &SessionId::generate())?;
    let bob_uri = MsrpUri::new(HOST, PORT, &SessionId::generate())?;
    let (alice_end, bob_end) = LoopbackTransport::pair(runtime);
    let (alice_app, alice_events) = DemoApp::new("alice");
    let (bob_app, bob_events) = DemoApp::new("bob");

    let alice = registry.create_participant_at(
        SessionPaths {
            local: alice_uri.clone(),
            remote: bob_uri.clone(),
        },
        Arc::clone(&alice_end) as Arc<dyn Transport>,
        alice_app,
    )?;
    let bob = registry.create_participant_at(
        SessionPaths {
            local: bob_uri,
            remote: alice_uri,
        },
        Arc::clone(&bob_end) as Arc<dyn Transport>,
        bob_app,
    )?;
    alice_end.attach(alice.frame_handler());
    bob_end.attach(bob.frame_handler());

    bob.view(|participant| participant.open(Role::Passive))??;
    alice.view(|participant| participant.open(Role::Active))??;
    wait_for(&alice_events, |event| matches!(event, DemoEvent::Established))?;

    let payload: Vec<u8> = (0..payload_size).map(|i| (i % 251) as u8).collect();
    let started = Instant::now();
    let message_id = alice.view(|participant| {
        participant.send_message(OutgoingMessage::new("application/octet-stream", payload))
    })??;
    info!(%message_id, payload_size, chunk_size, "Sending");

    wait_for(&alice_events, |event| matches!(event, DemoEvent::Sent))?;
    let received = wait_for(&bob_events, |event| matches!(event, DemoEvent::Received { .. }))?;
    match received {
        DemoEvent::Received { bytes, aborted: false } if bytes == payload_size as u64 => {
            info!(bytes, elapsed = ?started.elapsed(), "Transfer complete");
        }
        other => bail!("unexpected delivery: {other:?}"),
    }

    alice.view(|participant| participant.close())??;
    wait_for(&alice_events, |event| matches!(event, DemoEvent::Closed))?;
    wait_for(&bob_events, |event| matches!(event, DemoEvent::Closed))?;
    info!(remaining = registry.len(), "Participants closed");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let payload_size = std::env::var("PAYLOAD_SIZE")
        .unwrap_or_else(|_| "65536".to_string())
        .parse::<usize>()?;
    let chunk_size = std::env::var("CHUNK_SIZE")
        .unwrap_or_else(|_| "4096".to_string())
        .parse::<usize>()?;

    info!(payload_size, chunk_size, "Starting loopback transfer");

    // Participants block their callers while machines wait; keep them off the async workers.
    let runtime = Handle::current();
    tokio::task::spawn_blocking(move || run(runtime, payload_size, chunk_size)).await?
}
