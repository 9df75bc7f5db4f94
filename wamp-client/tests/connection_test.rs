use std::{
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
    time::Duration,
};

use anyhow::Result;
use assert_matches::assert_matches;
use test_utils::router::TestRouter;
use tokio::sync::mpsc::{
    UnboundedReceiver,
    UnboundedSender,
    unbounded_channel,
};
use wamp_client::{
    connection::{
        config::MaxRetries,
        connection::{
            Connection,
            ConnectionCloseDetails,
            ConnectionCloseReason,
            ConnectionHandler,
            NoopConnectionHandler,
        },
    },
    core::{
        error::{
            ConnectionError,
            SessionError,
        },
        uri::Uri,
    },
    session::{
        handle::SessionHandle,
        handler::TicketChallengeHandler,
        types::SessionDetails,
    },
    transport::{
        registry::TransportRegistry,
        transport::{
            Transport,
            TransportConfig,
            TransportFactory,
        },
    },
};

const REALM: &str = "com.wamp.test";

#[derive(Debug)]
enum HandlerEvent {
    Open(SessionHandle),
    Close(ConnectionCloseReason, ConnectionCloseDetails),
}

struct RecordingHandler {
    events_tx: UnboundedSender<HandlerEvent>,
    stop_retrying: bool,
}

impl RecordingHandler {
    fn new(stop_retrying: bool) -> (Self, UnboundedReceiver<HandlerEvent>) {
        let (events_tx, events_rx) = unbounded_channel();
        (
            Self {
                events_tx,
                stop_retrying,
            },
            events_rx,
        )
    }
}

impl ConnectionHandler for RecordingHandler {
    fn on_open(&self, session: SessionHandle, _: &SessionDetails) -> Result<()> {
        self.events_tx.send(HandlerEvent::Open(session))?;
        Ok(())
    }

    fn on_close(
        &self,
        reason: ConnectionCloseReason,
        details: &ConnectionCloseDetails,
    ) -> Result<bool> {
        self.events_tx
            .send(HandlerEvent::Close(reason, details.clone()))?;
        Ok(self.stop_retrying)
    }
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    Error,
    Panic,
}

/// Records events like [`RecordingHandler`], then fails every callback.
struct FaultyHandler {
    events_tx: UnboundedSender<HandlerEvent>,
    fault: Fault,
}

impl FaultyHandler {
    fn fail(&self, callback: &str) -> anyhow::Error {
        match self.fault {
            Fault::Error => anyhow::Error::msg(format!("{callback} failed")),
            Fault::Panic => panic!("{callback} panicked"),
        }
    }
}

impl ConnectionHandler for FaultyHandler {
    fn on_open(&self, session: SessionHandle, _: &SessionDetails) -> Result<()> {
        self.events_tx.send(HandlerEvent::Open(session))?;
        Err(self.fail("on_open"))
    }

    fn on_close(
        &self,
        reason: ConnectionCloseReason,
        details: &ConnectionCloseDetails,
    ) -> Result<bool> {
        self.events_tx
            .send(HandlerEvent::Close(reason, details.clone()))?;
        Err(self.fail("on_close"))
    }
}

/// Reports whether the last opened session was already discarded when `on_close` ran.
struct SessionObservingHandler {
    session: Mutex<Option<SessionHandle>>,
    closed_tx: UnboundedSender<bool>,
}

impl ConnectionHandler for SessionObservingHandler {
    fn on_open(&self, session: SessionHandle, _: &SessionDetails) -> Result<()> {
        *self.session.lock().unwrap() = Some(session);
        Ok(())
    }

    fn on_close(&self, _: ConnectionCloseReason, _: &ConnectionCloseDetails) -> Result<bool> {
        if let Some(session) = self.session.lock().unwrap().take() {
            self.closed_tx.send(session.is_closed())?;
        }
        Ok(true)
    }
}

/// A transport factory that counts its attempts and never creates a transport.
#[derive(Debug)]
struct FailingFactory {
    transport_type: String,
    creates: Arc<AtomicUsize>,
}

impl TransportFactory for FailingFactory {
    fn transport_type(&self) -> &str {
        &self.transport_type
    }

    fn create(&self) -> Result<Box<dyn Transport>> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Err(anyhow::Error::msg("transport is not available"))
    }
}

fn register_failing_transport(
    registry: &mut TransportRegistry,
    transport_type: &'static str,
) -> Arc<AtomicUsize> {
    let creates = Arc::new(AtomicUsize::new(0));
    registry.register(transport_type, {
        let creates = creates.clone();
        move |_: &TransportConfig| {
            Ok(Box::new(FailingFactory {
                transport_type: transport_type.to_owned(),
                creates: creates.clone(),
            }) as Box<dyn TransportFactory>)
        }
    });
    creates
}

async fn next_event(events_rx: &mut UnboundedReceiver<HandlerEvent>) -> HandlerEvent {
    tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
        .await
        .unwrap()
        .unwrap()
}

async fn expect_open(events_rx: &mut UnboundedReceiver<HandlerEvent>) -> SessionHandle {
    assert_matches!(next_event(events_rx).await, HandlerEvent::Open(session) => session)
}

async fn expect_close(
    events_rx: &mut UnboundedReceiver<HandlerEvent>,
) -> (ConnectionCloseReason, ConnectionCloseDetails) {
    assert_matches!(next_event(events_rx).await, HandlerEvent::Close(reason, details) => (reason, details))
}

#[tokio::test]
async fn reports_unsupported_when_no_transport_can_be_created() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, mut events_rx) = RecordingHandler::new(false);
    // The registry does not know the direct transport, so its entry is skipped.
    let connection =
        Connection::new(router.connection_config(), &TransportRegistry::new(), handler).unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Unsupported);
    assert!(!details.will_retry);
    assert_eq!(details.retry_delay, None);

    let status = connection.status();
    assert!(!status.is_retrying);
    assert_eq!(status.transport.transport_type, "none");
    assert_eq!(router.connection_attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn retries_unreachable_router_until_attempts_run_out() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    router.set_reachable(false);
    let mut config = router.connection_config();
    config.max_retries = MaxRetries::Limited(2);
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(config, &router.transport_registry(), handler).unwrap();

    assert_matches!(connection.open().await, Ok(()));

    let (reason, first) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Unreachable);
    assert_eq!(first.retry_count, Some(1));
    assert!(first.will_retry);
    assert_eq!(first.retry_delay, Some(Duration::from_millis(100)));

    let (reason, second) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Unreachable);
    assert_eq!(second.retry_count, Some(2));
    assert!(second.will_retry);
    assert!(second.retry_delay > first.retry_delay);

    let (reason, last) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Unreachable);
    assert!(!last.will_retry);
    assert_eq!(last.retry_count, None);

    assert_eq!(router.connection_attempts(), 3);
    assert!(!connection.status().is_retrying);
    assert_matches!(connection.close(None, None).await, Err(err) => {
        assert_matches!(err.downcast_ref::<ConnectionError>(), Some(ConnectionError::AlreadyClosed));
    });
}

#[tokio::test(start_paused = true)]
async fn gives_up_on_unreachable_router_when_configured() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    router.set_reachable(false);
    let mut config = router.connection_config();
    config.retry_if_unreachable = false;
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(config, &router.transport_registry(), handler).unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Unreachable);
    assert!(!details.will_retry);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(router.connection_attempts(), 1);
}

#[tokio::test]
async fn joins_realm_and_reports_status() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let session = expect_open(&mut events_rx).await;
    assert_eq!(session.realm().as_ref(), REALM);
    assert_eq!(session.details().authrole.as_deref(), Some("anonymous"));

    let status = connection.status();
    assert!(status.is_open);
    assert!(status.is_connected);
    assert!(!status.is_retrying);
    assert_eq!(status.transport.transport_type, "direct");
    assert_eq!(status.transport.protocol.as_deref(), Some("direct"));
    assert_matches!(status.session, Some(current) => {
        assert_eq!(current.id(), session.id());
    });

    assert_matches!(connection.open().await, Err(err) => {
        assert_matches!(err.downcast_ref::<ConnectionError>(), Some(ConnectionError::AlreadyOpen));
    });
}

#[tokio::test]
async fn close_before_open_fails() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, _events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();
    assert_matches!(connection.close(None, None).await, Err(err) => {
        assert_matches!(err.downcast_ref::<ConnectionError>(), Some(ConnectionError::AlreadyClosed));
    });
}

#[tokio::test]
async fn reconnects_after_lost_transport_and_resets_backoff() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let first = expect_open(&mut events_rx).await;

    router.drop_connections();
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Lost);
    assert!(details.will_retry);
    assert_eq!(details.retry_count, Some(1));
    assert_eq!(details.reason, None);

    let second = expect_open(&mut events_rx).await;
    assert_ne!(second.id(), first.id());
    assert!(first.is_closed());
    assert!(!second.is_closed());

    // A successful reconnection starts the backoff over.
    router.drop_connections();
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Lost);
    assert_eq!(details.retry_count, Some(1));
    assert_eq!(details.retry_delay, Some(Duration::from_millis(100)));

    expect_open(&mut events_rx).await;
    assert_eq!(router.sessions_joined(), 3);
}

#[tokio::test]
async fn clean_transport_close_is_closed_and_retried() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    expect_open(&mut events_rx).await;

    router.close_connections();
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Closed);
    assert!(details.will_retry);

    expect_open(&mut events_rx).await;
    assert_eq!(router.sessions_joined(), 2);
}

#[tokio::test]
async fn close_leaves_realm_without_retrying() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let session = expect_open(&mut events_rx).await;

    assert_matches!(
        connection
            .close(None, Some("shutting down".to_owned()))
            .await,
        Ok(())
    );
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Closed);
    assert!(!details.will_retry);
    assert_eq!(
        details.reason,
        Some(Uri::try_from("wamp.close.goodbye_and_out").unwrap())
    );
    assert_eq!(details.message.as_deref(), Some("shutting down"));

    let status = connection.status();
    assert!(!status.is_open);
    assert!(!status.is_connected);
    assert!(status.session.is_none());
    assert!(session.is_closed());
    assert_eq!(router.active_sessions(), 0);

    assert_matches!(connection.close(None, None).await, Err(err) => {
        assert_matches!(err.downcast_ref::<ConnectionError>(), Some(ConnectionError::AlreadyClosed));
    });

    // The connection can be opened again after closing.
    assert_matches!(connection.open().await, Ok(()));
    expect_open(&mut events_rx).await;
}

#[tokio::test]
async fn router_goodbye_stops_reconnection() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    expect_open(&mut events_rx).await;

    router.shut_down_sessions();
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Closed);
    assert!(!details.will_retry);
    assert_eq!(
        details.reason,
        Some(Uri::try_from("wamp.close.system_shutdown").unwrap())
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(router.sessions_joined(), 1);
    assert!(!connection.status().is_retrying);
}

#[tokio::test]
async fn close_handler_can_stop_reconnection() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, mut events_rx) = RecordingHandler::new(true);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    expect_open(&mut events_rx).await;

    router.drop_connections();
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Lost);
    // The policy would have retried; the handler's answer wins.
    assert!(details.will_retry);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(router.sessions_joined(), 1);
    assert!(!connection.status().is_retrying);
}

#[tokio::test]
async fn close_cancels_pending_retry() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    router.set_reachable(false);
    let mut config = router.connection_config();
    config.initial_retry_delay = 60.0;
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(config, &router.transport_registry(), handler).unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let (_, details) = expect_close(&mut events_rx).await;
    assert!(details.will_retry);

    let mut status_rx = connection.watch_status();
    status_rx.wait_for(|status| status.is_retrying).await.unwrap();
    assert_matches!(connection.open().await, Err(err) => {
        assert_matches!(err.downcast_ref::<ConnectionError>(), Some(ConnectionError::AlreadyOpen));
    });
    assert_matches!(connection.close(None, None).await, Ok(()));
    assert!(!connection.status().is_retrying);
    assert_eq!(router.connection_attempts(), 1);
}

#[tokio::test]
async fn router_abort_ends_connection() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    router.abort_hello(Some(Uri::try_from("wamp.error.not_authorized").unwrap()));
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Closed);
    assert!(!details.will_retry);
    assert_eq!(
        details.reason,
        Some(Uri::try_from("wamp.error.not_authorized").unwrap())
    );
    assert_eq!(router.sessions_joined(), 0);
}

#[tokio::test]
async fn answers_ticket_challenge() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    router.require_ticket("secret");
    let mut config = router.connection_config();
    config.authmethods = Vec::from_iter(["ticket".to_owned()]);
    config.authid = Some("alice".to_owned());
    config.challenge_handler = Some(Arc::new(TicketChallengeHandler::new("secret")));
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(config, &router.transport_registry(), handler).unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let session = expect_open(&mut events_rx).await;
    assert_eq!(session.details().authmethod.as_deref(), Some("ticket"));
    assert_eq!(session.details().authid.as_deref(), Some("alice"));
    assert_eq!(session.details().authrole.as_deref(), Some("user"));
}

#[tokio::test]
async fn wrong_ticket_is_rejected() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    router.require_ticket("secret");
    let mut config = router.connection_config();
    config.authmethods = Vec::from_iter(["ticket".to_owned()]);
    config.challenge_handler = Some(Arc::new(TicketChallengeHandler::new("guess")));
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(config, &router.transport_registry(), handler).unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Closed);
    assert!(!details.will_retry);
    assert_eq!(
        details.reason,
        Some(Uri::try_from("wamp.error.authentication_failed").unwrap())
    );
}

#[tokio::test]
async fn uses_first_transport_that_can_be_created() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let mut registry = router.transport_registry();
    let broken_creates = register_failing_transport(&mut registry, "broken");
    let spare_creates = register_failing_transport(&mut registry, "spare");
    let mut config = router.connection_config();
    config.transports = Vec::from_iter([
        TransportConfig::new("broken", "direct://test-router"),
        router.transport_config(),
        TransportConfig::new("spare", "direct://test-router"),
    ]);
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(config, &registry, handler).unwrap();

    assert_matches!(connection.open().await, Ok(()));
    expect_open(&mut events_rx).await;
    assert_eq!(connection.status().transport.transport_type, "direct");
    assert_eq!(broken_creates.load(Ordering::SeqCst), 1);
    assert_eq!(spare_creates.load(Ordering::SeqCst), 0);

    // Every attempt walks the entries in order again.
    router.drop_connections();
    assert_matches!(expect_close(&mut events_rx).await, (ConnectionCloseReason::Lost, _));
    expect_open(&mut events_rx).await;
    assert_eq!(broken_creates.load(Ordering::SeqCst), 2);
    assert_eq!(spare_creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failing_callbacks_do_not_stop_reconnection() {
    test_utils::setup::setup_test_environment();

    for fault in [Fault::Error, Fault::Panic] {
        let router = TestRouter::new(REALM).unwrap();
        let (events_tx, mut events_rx) = unbounded_channel();
        let connection = Connection::new(
            router.connection_config(),
            &router.transport_registry(),
            FaultyHandler { events_tx, fault },
        )
        .unwrap();

        assert_matches!(connection.open().await, Ok(()));
        expect_open(&mut events_rx).await;
        assert!(connection.status().is_open, "{fault:?}");

        router.drop_connections();
        let (reason, details) = expect_close(&mut events_rx).await;
        assert_eq!(reason, ConnectionCloseReason::Lost);
        assert!(details.will_retry);

        // A failed on_close does not veto the retry, and the connection task survives.
        expect_open(&mut events_rx).await;
        assert_eq!(router.sessions_joined(), 2, "{fault:?}");
        assert_matches!(connection.close(None, None).await, Ok(()));
    }
}

#[tokio::test]
async fn application_leave_stops_reconnection_even_if_transport_drops() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (handler, mut events_rx) = RecordingHandler::new(false);
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        handler,
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let session = expect_open(&mut events_rx).await;

    // The router never answers GOODBYE, so the transport is lost mid-leave.
    router.drop_on_goodbye(true);
    assert_matches!(session.leave(None, Some("done".to_owned())).await, Ok(()));

    let (reason, details) = expect_close(&mut events_rx).await;
    assert_eq!(reason, ConnectionCloseReason::Lost);
    assert!(!details.will_retry);
    assert_eq!(details.retry_delay, None);
    assert_eq!(
        details.reason,
        Some(Uri::try_from("wamp.close.normal").unwrap())
    );
    assert_eq!(details.message.as_deref(), Some("done"));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(router.connection_attempts(), 1);
    assert_eq!(router.sessions_joined(), 1);
    assert!(!connection.status().is_retrying);
}

#[tokio::test]
async fn rejects_timeouts_too_large_to_schedule() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let mut config = router.connection_config();
    config.leave_timeout = 1e20;
    assert_matches!(
        Connection::new(config, &router.transport_registry(), NoopConnectionHandler).err(),
        Some(err) => {
            assert!(err.to_string().contains("leave_timeout"), "{err}");
        }
    );

    let mut config = router.connection_config();
    config.max_retry_delay = 1.9e19;
    assert!(Connection::new(config, &router.transport_registry(), NoopConnectionHandler).is_err());
}

#[tokio::test]
async fn session_is_discarded_after_close_handler_runs() {
    test_utils::setup::setup_test_environment();

    let router = TestRouter::new(REALM).unwrap();
    let (closed_tx, mut closed_rx) = unbounded_channel();
    let connection = Connection::new(
        router.connection_config(),
        &router.transport_registry(),
        SessionObservingHandler {
            session: Mutex::new(None),
            closed_tx,
        },
    )
    .unwrap();

    assert_matches!(connection.open().await, Ok(()));
    let mut status_rx = connection.watch_status();
    status_rx
        .wait_for(|status| status.is_open)
        .await
        .unwrap();
    let session = connection.session().unwrap();

    router.drop_connections();
    let closed_during_handler = tokio::time::timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(!closed_during_handler);

    // The session is gone once the close has been handled.
    assert_matches!(session.leave(None, None).await, Err(err) => {
        assert_matches!(err.downcast_ref::<SessionError>(), Some(SessionError::SessionLost));
    });
    assert!(session.is_closed());
}
