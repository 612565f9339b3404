// Integration tests for the recognizer session lifecycle
//
// Native callbacks are played by MockController, usually from a spawned
// thread, and observed through the callbacks registered on the runtime thread.

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use speech_bridge::dispatch::{DropReason, Published};
use speech_bridge::error::codes;
use speech_bridge::speech::{MockController, MockPlatform, StopMode};
use speech_bridge::{
    AuthorizationOutcome, BridgeConfig, BridgeError, RecognitionError, RecognitionEvent,
    RecognizerSession, RuntimeLoop, SessionState, SessionStatus, TeardownPolicy,
};

fn granted_session(runtime: &RuntimeLoop, config: BridgeConfig) -> (RecognizerSession, MockController) {
    let (platform, controller) = MockPlatform::manual();
    controller.set_authorization_status(AuthorizationOutcome::Granted);
    let session = RecognizerSession::new(&platform, config, &runtime.handle()).unwrap();
    (session, controller)
}

fn collect_results(session: &mut RecognizerSession) -> Rc<RefCell<Vec<RecognitionEvent>>> {
    let results = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&results);
    session.on_result(move |event| seen.borrow_mut().push(event));
    results
}

fn collect_errors(session: &mut RecognizerSession) -> Rc<RefCell<Vec<RecognitionError>>> {
    let errors = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&errors);
    session.on_error(move |err| seen.borrow_mut().push(err));
    errors
}

#[test]
fn test_partials_and_final_arrive_in_emission_order() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());
    let results = collect_results(&mut session);

    session.start().unwrap();
    let native = controller.clone();
    thread::spawn(move || {
        native.emit_partial("こん");
        native.emit_partial("こんにち");
        native.emit_partial("こんにちは");
        native.emit_final("こんにちは。");
    })
    .join()
    .unwrap();

    // Nothing is delivered until the runtime turns
    assert!(results.borrow().is_empty());
    assert!(runtime.take_wake());

    let summary = session.dispatch_pending().unwrap();
    assert_eq!(summary.results, 4);
    assert_eq!(
        *results.borrow(),
        vec![
            RecognitionEvent::Partial { text: "こん".into() },
            RecognitionEvent::Partial { text: "こんにち".into() },
            RecognitionEvent::Partial { text: "こんにちは".into() },
            RecognitionEvent::Final { text: "こんにちは。".into() },
        ]
    );
    assert_eq!(session.state(), SessionState::Listening);

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(controller.emit_partial("late"), None);
    assert!(session.dispatch_pending().unwrap().is_empty());

    let report = session.close();
    assert!(!report.release_failed);
    assert_eq!(report.results.discarded, 0);
    assert_eq!(results.borrow().len(), 4);
}

#[test]
fn test_denied_authorization_leaves_session_idle() {
    let runtime = RuntimeLoop::new();
    let (platform, controller) = MockPlatform::manual();
    let mut session =
        RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();
    assert_eq!(session.state(), SessionState::AwaitingAuthorization);

    let mut request = session.request_authorization().unwrap();
    let native = controller.clone();
    thread::spawn(move || native.resolve_authorization(AuthorizationOutcome::Denied))
        .join()
        .unwrap();
    assert_eq!(request.try_outcome().unwrap(), None);

    let summary = session.dispatch_pending().unwrap();
    assert_eq!(summary.authorization, Some(AuthorizationOutcome::Denied));
    assert_eq!(request.try_outcome().unwrap(), Some(AuthorizationOutcome::Denied));
    assert_eq!(session.state(), SessionState::Idle);
    assert!(matches!(session.start(), Err(BridgeError::AuthorizationDenied)));
    assert_eq!(controller.starts(), 0);
}

#[test]
fn test_concurrent_authorization_requests_share_one_prompt() {
    let runtime = RuntimeLoop::new();
    let (platform, controller) = MockPlatform::manual();
    let mut session =
        RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();

    let mut first = session.request_authorization().unwrap();
    let mut second = session.request_authorization().unwrap();
    assert_eq!(controller.authorization_prompts(), 1);

    assert!(controller.resolve_authorization(AuthorizationOutcome::Granted));
    session.dispatch_pending().unwrap();
    assert_eq!(first.try_outcome().unwrap(), Some(AuthorizationOutcome::Granted));
    assert_eq!(second.try_outcome().unwrap(), Some(AuthorizationOutcome::Granted));

    // Terminal outcomes are answered without asking the platform again
    let mut third = session.request_authorization().unwrap();
    assert_eq!(third.try_outcome().unwrap(), Some(AuthorizationOutcome::Granted));
    assert_eq!(controller.authorization_prompts(), 1);

    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Listening);
}

#[test]
fn test_undetermined_answer_prompts_again() {
    let runtime = RuntimeLoop::new();
    let (platform, controller) = MockPlatform::manual();
    let mut session =
        RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();

    let mut request = session.request_authorization().unwrap();
    controller.resolve_authorization(AuthorizationOutcome::Undetermined);
    session.dispatch_pending().unwrap();
    assert_eq!(request.try_outcome().unwrap(), Some(AuthorizationOutcome::Undetermined));
    assert_eq!(session.state(), SessionState::AwaitingAuthorization);

    let _retry = session.request_authorization().unwrap();
    assert_eq!(controller.authorization_prompts(), 2);
}

#[test]
fn test_pending_authorization_is_abandoned_on_close() {
    let runtime = RuntimeLoop::new();
    let (platform, controller) = MockPlatform::manual();
    let mut session =
        RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();

    let mut request = session.request_authorization().unwrap();
    session.close();
    assert!(matches!(request.try_outcome(), Err(BridgeError::Disposed)));

    // The platform answering late reaches nothing
    controller.resolve_authorization(AuthorizationOutcome::Granted);
    assert_eq!(session.state(), SessionState::Closed);
}

#[test]
fn test_native_error_mid_session_is_delivered_once() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());
    let results = collect_results(&mut session);
    let errors = collect_errors(&mut session);

    session.start().unwrap();
    controller.emit_partial("hello");
    controller.emit_error(codes::RECOGNITION, "network lost");
    session.dispatch_pending().unwrap();
    session.dispatch_pending().unwrap();

    assert_eq!(results.borrow().len(), 1);
    assert_eq!(
        *errors.borrow(),
        vec![RecognitionError::new(codes::RECOGNITION, "network lost")]
    );
    assert_eq!(session.state(), SessionState::Listening);
}

#[test]
fn test_status_callback_sees_start_and_platform_end() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&statuses);
    session.on_status(move |status| seen.borrow_mut().push(status));

    session.start().unwrap();
    controller.emit_started();
    controller.end_session();
    session.dispatch_pending().unwrap();

    assert_eq!(*statuses.borrow(), vec![SessionStatus::Started, SessionStatus::Stopped]);
    assert_eq!(session.state(), SessionState::Idle);

    // A new cycle can begin right away
    session.start().unwrap();
    assert_eq!(controller.starts(), 2);
}

#[test]
fn test_stop_is_harmless_when_not_listening() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(controller.stops(), 0);

    session.start().unwrap();
    session.stop().unwrap();
    session.stop().unwrap();
    assert_eq!(controller.stops(), 1);
}

#[test]
fn test_never_more_than_one_live_handle() {
    let runtime = RuntimeLoop::new();
    let (platform, controller) = MockPlatform::manual();
    controller.set_authorization_status(AuthorizationOutcome::Granted);

    for _ in 0..3 {
        let mut session =
            RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();
        for _ in 0..4 {
            session.start().unwrap();
            assert!(session.start().is_err());
            session.stop().unwrap();
        }
        assert_eq!(controller.live_handles(), 1);
        session.close();
        assert_eq!(controller.live_handles(), 0);
    }

    assert_eq!(controller.max_live_handles(), 1);
    assert_eq!(controller.starts(), 12);
}

#[test]
fn test_dropping_session_releases_handle() {
    let runtime = RuntimeLoop::new();
    let (session, controller) = granted_session(&runtime, BridgeConfig::default());
    assert_eq!(controller.live_handles(), 1);
    drop(session);
    assert_eq!(controller.live_handles(), 0);
}

#[test]
fn test_failed_acquire_leaves_nothing_behind() {
    let runtime = RuntimeLoop::new();
    let (platform, controller) = MockPlatform::manual();
    controller.fail_next_acquire(RecognitionError::new(codes::ACQUIRE_FAILED, "no recognizer"));

    let err = RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle())
        .unwrap_err();
    assert!(matches!(err, BridgeError::NativeFailure(ref e) if e.code == codes::ACQUIRE_FAILED));
    assert_eq!(controller.live_handles(), 0);
}

#[test]
fn test_no_callback_runs_after_teardown() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());
    let results = collect_results(&mut session);
    let errors = collect_errors(&mut session);

    session.start().unwrap();
    let stray = controller.take_sink().unwrap();
    controller.emit_partial("queued before close");

    session.close();
    assert_eq!(
        stray.partial("after close"),
        Published::Dropped(DropReason::Closed)
    );
    assert_eq!(
        stray.error(RecognitionError::new(codes::RECOGNITION, "late")),
        Published::Dropped(DropReason::Closed)
    );
    assert!(matches!(session.dispatch_pending(), Err(BridgeError::Disposed)));

    assert!(results.borrow().is_empty());
    assert!(errors.borrow().is_empty());
}

#[test]
fn test_flush_teardown_delivers_queued_events() {
    let runtime = RuntimeLoop::new();
    let config = BridgeConfig {
        teardown: TeardownPolicy::Flush,
        ..BridgeConfig::default()
    };
    let (mut session, controller) = granted_session(&runtime, config);
    let results = collect_results(&mut session);

    session.start().unwrap();
    controller.emit_partial("good");
    controller.emit_final("good night");

    let report = session.close();
    assert_eq!(report.results.delivered, 2);
    assert_eq!(report.results.discarded, 0);
    assert_eq!(results.borrow().len(), 2);
    assert!(results.borrow()[1].is_final());
}

#[test]
fn test_discard_teardown_drops_queued_events() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());
    let results = collect_results(&mut session);

    session.start().unwrap();
    controller.emit_partial("good");
    controller.emit_error(codes::RECOGNITION, "oops");

    let report = session.close();
    assert_eq!(report.results.discarded, 1);
    assert_eq!(report.errors.discarded, 1);
    assert!(results.borrow().is_empty());
}

#[test]
fn test_full_channel_drops_instead_of_blocking() {
    let runtime = RuntimeLoop::new();
    let config = BridgeConfig {
        channel_capacity: 2,
        ..BridgeConfig::default()
    };
    let (mut session, controller) = granted_session(&runtime, config);
    let results = collect_results(&mut session);

    session.start().unwrap();
    assert_eq!(controller.emit_partial("a"), Some(Published::Queued));
    assert_eq!(controller.emit_partial("ab"), Some(Published::Queued));
    assert_eq!(
        controller.emit_partial("abc"),
        Some(Published::Dropped(DropReason::Full))
    );

    session.dispatch_pending().unwrap();
    assert_eq!(results.borrow().len(), 2);
}

#[test]
fn test_deferred_stop_keeps_last_result() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());
    controller.set_stop_mode(StopMode::Deferred);
    let results = collect_results(&mut session);

    session.start().unwrap();
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopping);

    let native = controller.clone();
    thread::spawn(move || {
        native.emit_final("last words");
        native.confirm_stop();
    })
    .join()
    .unwrap();

    session.dispatch_pending().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(
        *results.borrow(),
        vec![RecognitionEvent::Final { text: "last words".into() }]
    );
}

#[test]
fn test_previous_cycle_events_do_not_reach_next_cycle() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());
    let results = collect_results(&mut session);
    let errors = collect_errors(&mut session);

    session.start().unwrap();
    let previous = controller.take_sink().unwrap();
    session.stop().unwrap();
    session.start().unwrap();

    thread::spawn(move || {
        previous.final_text("from previous cycle");
        previous.error(RecognitionError::new(codes::RECOGNITION, "previous cycle failed"));
        previous.ended();
    })
    .join()
    .unwrap();
    controller.emit_partial("current");

    session.dispatch_pending().unwrap();
    assert_eq!(session.state(), SessionState::Listening);
    assert_eq!(
        *results.borrow(),
        vec![RecognitionEvent::Partial { text: "current".into() }]
    );
    assert!(errors.borrow().is_empty());
}

#[test]
fn test_stop_confirmed_by_platform_end_keeps_final_result() {
    let runtime = RuntimeLoop::new();
    let (mut session, controller) = granted_session(&runtime, BridgeConfig::default());
    controller.set_stop_mode(StopMode::Deferred);
    let results = collect_results(&mut session);
    let statuses = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&statuses);
    session.on_status(move |status| seen.borrow_mut().push(status));

    session.start().unwrap();
    controller.emit_partial("last wor");
    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Stopping);

    // The recognizer finishes the utterance, then reports the session over
    let native = controller.clone();
    thread::spawn(move || {
        native.emit_final("last words");
        native.end_session();
    })
    .join()
    .unwrap();

    session.dispatch_pending().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(*statuses.borrow(), vec![SessionStatus::Stopped]);
    assert_eq!(
        *results.borrow(),
        vec![
            RecognitionEvent::Partial { text: "last wor".into() },
            RecognitionEvent::Final { text: "last words".into() },
        ]
    );
    assert_eq!(controller.emit_final("too late"), None);
}

#[test]
fn test_scripted_platform_stops_on_request() {
    let runtime = RuntimeLoop::new();
    let platform = MockPlatform::scripted();
    let mut session =
        RecognizerSession::new(&platform, BridgeConfig::default(), &runtime.handle()).unwrap();
    let results = collect_results(&mut session);
    assert_eq!(session.state(), SessionState::Idle);

    session.start().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while results.borrow().is_empty() && Instant::now() < deadline {
        runtime.wait(Duration::from_millis(50));
        session.dispatch_pending().unwrap();
    }
    assert!(!results.borrow().is_empty());

    session.stop().unwrap();
    while session.state() != SessionState::Idle && Instant::now() < deadline {
        runtime.wait(Duration::from_millis(50));
        session.dispatch_pending().unwrap();
    }
    assert_eq!(session.state(), SessionState::Idle);
    assert!(results.borrow().last().map(|e| e.is_final()).unwrap_or(false));
}
