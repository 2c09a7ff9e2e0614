//! INVITE server transaction behaviour.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::sleep;

use common::*;
use rvoip_sip_fsm::message::Param;
use rvoip_sip_fsm::{
    Error, FsmConfig, FsmDispatcher, Message, ServerEvent, SipMessageExt, TimeoutKind, TimerName,
    TransactionId, TransactionState,
};

fn server() -> (FsmDispatcher, Delivered) {
    let dispatcher = FsmDispatcher::new(FsmConfig::default());
    let delivered = Delivered::default();
    let sink = delivered.clone();
    dispatcher.set_request_handler(Arc::new(move |request, _transport, transaction| {
        sink.push(request, transaction)
    }));
    (dispatcher, delivered)
}

async fn receive(dispatcher: &FsmDispatcher, transport: &Arc<MockTransport>, message: Message) {
    dispatcher.on_received_message(message, transport.handle());
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn test_retransmitted_invite_gets_cached_final_response() {
    init_tracing();
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let request = invite("z9hG4bK-ist-retx", "ist-retx@test", 1);

    receive(&dispatcher, &transport, request.clone()).await;
    assert_eq!(delivered.len(), 1);
    let (_, transaction) = delivered.get(0);
    assert_eq!(transaction.state(), TransactionState::Proceeding);
    assert!(transaction.is_timer_armed(TimerName::MaxLifetime));

    transaction
        .send_response(response_to(&request, 200, Some("uas-1")))
        .unwrap();
    settle().await;
    assert_eq!(transaction.state(), TransactionState::Completed);
    assert_eq!(transport.responses(200), 1);
    assert_eq!(transport.last().unwrap().destination, Some(addr(REMOTE)));

    receive(&dispatcher, &transport, request).await;
    assert_eq!(transport.responses(200), 2);
    assert_eq!(delivered.len(), 1);
    assert_eq!(dispatcher.ist_pool().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retransmitted_invite_in_proceeding_resends_provisional() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let request = invite("z9hG4bK-ist-180", "ist-180@test", 1);

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);

    // Nothing cached yet: the retransmission is absorbed.
    receive(&dispatcher, &transport, request.clone()).await;
    assert!(transport.sent().is_empty());

    transaction
        .send_response(response_to(&request, 180, Some("uas-2")))
        .unwrap();
    settle().await;
    assert_eq!(transaction.state(), TransactionState::Proceeding);

    receive(&dispatcher, &transport, request).await;
    assert_eq!(transport.responses(180), 2);
    assert_eq!(delivered.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ack_confirms_then_timer_i_terminates() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let events = ServerEvents::default();
    let request = invite("z9hG4bK-ist-ack", "ist-ack@test", 4);

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);

    let busy = response_to(&request, 486, Some("uas-3"));
    transaction
        .send_response_with_callback(busy.clone(), events.callback())
        .unwrap();
    settle().await;
    assert!(transaction.is_timer_armed(TimerName::G));
    assert!(transaction.is_timer_armed(TimerName::H));

    receive(&dispatcher, &transport, ack_for(&request, &busy)).await;
    assert_eq!(events.acks(), 1);
    assert_eq!(transaction.state(), TransactionState::Confirmed);
    assert!(!transaction.is_timer_armed(TimerName::G));
    assert!(!transaction.is_timer_armed(TimerName::H));
    assert_eq!(transaction.armed_timer_delay(TimerName::I), Some(secs(5)));

    // ACK retransmissions are absorbed.
    receive(&dispatcher, &transport, ack_for(&request, &busy)).await;
    assert_eq!(events.acks(), 1);

    sleep(secs(6)).await;
    settle().await;
    assert_eq!(transaction.state(), TransactionState::Terminated);
    assert!(dispatcher.ist_pool().is_empty());
    assert_eq!(events.timeouts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timer_g_backoff_until_timer_h() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let events = ServerEvents::default();
    let request = invite("z9hG4bK-ist-noack", "ist-noack@test", 1);

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);
    transaction
        .send_response_with_callback(
            response_to(&request, 486, Some("uas-4")),
            events.callback(),
        )
        .unwrap();
    settle().await;

    sleep(secs(33)).await;
    settle().await;

    let times = transport.response_times(486);
    assert_eq!(times.len(), 11);
    let intervals: Vec<u64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(&intervals[..5], &[500, 1000, 2000, 4000, 4000]);
    assert!(intervals.iter().all(|ms| *ms <= 4000));

    assert_eq!(events.timeouts(), 1);
    assert_eq!(transaction.state(), TransactionState::Terminated);
    assert!(dispatcher.ist_pool().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_reports_timer_h() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let request = invite("z9hG4bK-ist-h", "ist-h@test", 1);

    let timeouts = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = timeouts.clone();

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);
    transaction
        .send_response_with_callback(
            response_to(&request, 500, Some("uas-5")),
            Arc::new(move |event, _| {
                if let ServerEvent::AckTimeout(e) = event {
                    sink.lock().push(e);
                }
            }),
        )
        .unwrap();
    settle().await;

    sleep(secs(33)).await;
    settle().await;
    let timeouts = timeouts.lock();
    assert_eq!(timeouts.len(), 1);
    assert!(matches!(
        timeouts[0],
        Error::TransactionTimeout {
            kind: TimeoutKind::AckWait,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reliable_transport_terminates_on_ack() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::tcp();
    let request = invite("z9hG4bK-ist-tcp", "ist-tcp@test", 1);

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);
    let busy = response_to(&request, 480, Some("uas-6"));
    transaction.send_response(busy.clone()).unwrap();
    settle().await;

    assert!(!transaction.is_timer_armed(TimerName::G));
    assert!(transaction.is_timer_armed(TimerName::H));
    assert_eq!(transport.last().unwrap().destination, None);

    sleep(secs(10)).await;
    assert_eq!(transport.responses(480), 1);

    receive(&dispatcher, &transport, ack_for(&request, &busy)).await;
    assert_eq!(transaction.state(), TransactionState::Terminated);
    assert!(!transaction.is_timer_armed(TimerName::I));
}

#[tokio::test(start_paused = true)]
async fn test_terminated_invite_id_is_blocked() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let request = invite("z9hG4bK-ist-block", "ist-block@test", 1);
    let id = TransactionId::from_message(&request).unwrap();

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);
    transaction.terminate();
    settle().await;

    assert!(dispatcher.ist_pool().is_empty());
    assert!(dispatcher.ist_blocklist().contains(&id));

    receive(&dispatcher, &transport, request.clone()).await;
    assert_eq!(delivered.len(), 1);
    assert!(dispatcher.ist_pool().is_empty());

    sleep(secs(61)).await;
    receive(&dispatcher, &transport, request).await;
    assert_eq!(delivered.len(), 2);
    assert_eq!(dispatcher.ist_pool().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retransmission_during_terminate_cleanup_is_blocked() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let request = invite("z9hG4bK-ist-race", "ist-race@test", 1);
    let id = TransactionId::from_message(&request).unwrap();

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, first) = delivered.get(0);

    // The event loop has not run finalize yet when the retransmission lands.
    first.terminate();
    assert!(dispatcher.ist_blocklist().contains(&id));
    dispatcher.on_received_message(request, transport.handle());
    settle().await;

    assert_eq!(delivered.len(), 1);
    assert_eq!(first.state(), TransactionState::Terminated);
    assert!(dispatcher.ist_pool().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ack_timeout_reaches_dispatcher_handler() {
    let (dispatcher, delivered) = server();
    let events = ServerEvents::default();
    dispatcher.set_server_event_handler(events.callback());
    let transport = MockTransport::udp();
    let request = invite("z9hG4bK-ist-h-default", "ist-h-default@test", 1);

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);
    transaction
        .send_response(response_to(&request, 486, Some("uas-9")))
        .unwrap();
    settle().await;

    sleep(secs(33)).await;
    settle().await;
    assert_eq!(events.timeouts(), 1);
    assert_eq!(events.acks(), 0);
    assert_eq!(transaction.state(), TransactionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn test_rport_is_stamped_on_delivered_request() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let mut request = invite("z9hG4bK-ist-rport", "ist-rport@test", 1);
    request_rport(&mut request);

    receive(&dispatcher, &transport, request).await;
    let (delivered_request, _) = delivered.get(0);
    let via = delivered_request.top_via().unwrap();
    assert!(via.params.contains(&Param::Rport(Some(5060))), "{:?}", via.params);
    assert!(
        via.params.contains(&Param::Received(addr(REMOTE).ip())),
        "{:?}",
        via.params
    );
    assert_eq!(delivered_request.top_via_branch(), Some("z9hG4bK-ist-rport"));
}

#[tokio::test(start_paused = true)]
async fn test_ack_for_2xx_matched_by_dialog() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let events = ServerEvents::default();
    let orphans = Arc::new(AtomicUsize::new(0));
    let counter = orphans.clone();
    dispatcher.set_orphan_handler(Arc::new(move |_message, _transport| {
        counter.fetch_add(1, Ordering::SeqCst);
    }));

    let request = invite("z9hG4bK-ist-2xx", "ist-2xx@test", 2);
    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);

    let ok = response_to(&request, 200, Some("uas-7"));
    transaction
        .send_response_with_callback(ok.clone(), events.callback())
        .unwrap();
    settle().await;
    assert_eq!(transaction.state(), TransactionState::Completed);

    receive(&dispatcher, &transport, ack_for_2xx(&request, &ok, "z9hG4bK-new-branch")).await;
    assert_eq!(events.acks(), 1);
    assert_eq!(orphans.load(Ordering::SeqCst), 1);
    assert_eq!(transaction.state(), TransactionState::Confirmed);
}

#[tokio::test(start_paused = true)]
async fn test_send_response_to_explicit_address() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let request = invite("z9hG4bK-ist-to", "ist-to@test", 1);

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);

    let target = addr("198.51.100.7:5080");
    transaction
        .send_response_to(response_to(&request, 100, None), target)
        .unwrap();
    settle().await;
    assert_eq!(transport.last().unwrap().destination, Some(target));
}

#[tokio::test(start_paused = true)]
async fn test_final_response_after_completed_is_not_sent() {
    let (dispatcher, delivered) = server();
    let transport = MockTransport::udp();
    let request = invite("z9hG4bK-ist-twice", "ist-twice@test", 1);

    receive(&dispatcher, &transport, request.clone()).await;
    let (_, transaction) = delivered.get(0);
    transaction
        .send_response(response_to(&request, 404, Some("uas-8")))
        .unwrap();
    transaction
        .send_response(response_to(&request, 200, Some("uas-8")))
        .unwrap();
    settle().await;

    assert_eq!(transport.responses(404), 1);
    assert_eq!(transport.responses(200), 0);
}
