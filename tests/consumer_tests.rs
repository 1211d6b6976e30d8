use burrow::{
    bind_all, Connection, ConnectionConfig, Consumer, ConsumerOptions, ConsumerReport,
    ConsumerState, Error, HandlerFailure, HandlerResult, MemoryBroker, Message, Producer,
    QueueBinding, RedeliveryPolicy, Result, StopHandle,
};
use crossbeam::channel::{self, Receiver};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn config() -> ConnectionConfig {
    ConnectionConfig::new("memory://consumer-tests")
}

fn fast_options() -> ConsumerOptions {
    ConsumerOptions {
        tick: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Declare `queue` and publish text messages to it
fn seed(broker: &MemoryBroker, queue: &str, bodies: &[&str]) {
    let mut conn = Connection::open(broker, config()).expect("Failed to open producer connection");
    bind_all(&mut conn, &[QueueBinding::new(queue)]).expect("Failed to declare queue");
    let producer = Producer::new();
    for body in bodies {
        producer
            .publish(&mut conn, &Message::text(*body, queue))
            .expect("Failed to publish message");
    }
    conn.close().unwrap();
}

fn spawn(
    broker: &MemoryBroker,
    mut consumer: Consumer,
) -> (StopHandle, JoinHandle<Result<ConsumerReport>>) {
    let stop = consumer.stop_handle();
    let broker = broker.clone();
    let handle = thread::spawn(move || {
        let mut conn = Connection::open(&broker, config())?;
        consumer.start(&mut conn)
    });
    (stop, handle)
}

fn wait_until(condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < TEST_TIMEOUT, "Timed out waiting for condition");
        thread::sleep(Duration::from_millis(5));
    }
}

fn collect(rx: &Receiver<String>, count: usize) -> Vec<String> {
    (0..count)
        .map(|_| rx.recv_timeout(TEST_TIMEOUT).expect("Timed out waiting for message"))
        .collect()
}

#[test]
fn test_text_message_is_received_and_acked() {
    let broker = MemoryBroker::new();
    seed(&broker, "q1", &["hello"]);

    let (tx, rx) = channel::unbounded();
    let consumer = Consumer::new(["q1"], move |message: &Message| {
        tx.send(message.as_text().unwrap_or_default().to_string()).unwrap();
        HandlerResult::Ack
    })
    .with_options(fast_options());

    let (stop, handle) = spawn(&broker, consumer);
    assert_eq!(collect(&rx, 1), vec!["hello".to_string()]);

    stop.stop();
    let report = handle.join().unwrap().expect("Consumer failed");
    assert_eq!(report.received, 1);
    assert_eq!(report.acked, 1);
    assert_eq!(broker.queue_depth("q1"), Some(0));
    assert_eq!(broker.queue_stats("q1").unwrap().unacked, 0);
}

#[test]
fn test_single_delivery_in_flight() {
    let broker = MemoryBroker::new();
    let bodies: Vec<String> = (0..20).map(|i| format!("m{}", i)).collect();
    let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
    seed(&broker, "work", &refs);

    let in_handler = Arc::new(AtomicBool::new(false));
    let violations = Arc::new(AtomicUsize::new(0));
    let handled = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let broker = broker.clone();
        let in_handler = Arc::clone(&in_handler);
        let violations = Arc::clone(&violations);
        let handled = Arc::clone(&handled);
        Consumer::new(["work"], move |_: &Message| {
            if in_handler.swap(true, Ordering::SeqCst) {
                violations.fetch_add(1, Ordering::SeqCst);
            }
            if broker.queue_stats("work").map(|s| s.unacked) != Some(1) {
                violations.fetch_add(1, Ordering::SeqCst);
            }
            in_handler.store(false, Ordering::SeqCst);
            handled.fetch_add(1, Ordering::SeqCst);
            HandlerResult::Ack
        })
        .with_options(fast_options())
    };

    let (stop, handle) = spawn(&broker, consumer);
    wait_until(|| handled.load(Ordering::SeqCst) == 20);
    stop.stop();

    let report = handle.join().unwrap().unwrap();
    assert_eq!(report.acked, 20);
    assert_eq!(violations.load(Ordering::SeqCst), 0);
}

#[test]
fn test_handler_failure_does_not_stop_the_loop() {
    let broker = MemoryBroker::new();
    seed(&broker, "jobs", &["panic", "error", "good"]);

    let (tx, rx) = channel::unbounded();
    let (failures_tx, failures_rx) = channel::unbounded();
    let consumer = Consumer::new(["jobs"], move |message: &Message| {
        match message.as_text() {
            Some("panic") => panic!("cannot handle this one"),
            Some("error") => HandlerResult::error("handler said no"),
            Some(other) => {
                tx.send(other.to_string()).unwrap();
                HandlerResult::Ack
            }
            None => HandlerResult::reject(false),
        }
    })
    .with_options(fast_options())
    .with_error_sink(move |failure: &HandlerFailure| {
        failures_tx.send(failure.cause.to_string()).unwrap();
    });

    let (stop, handle) = spawn(&broker, consumer);
    assert_eq!(collect(&rx, 1), vec!["good".to_string()]);
    stop.stop();

    let report = handle.join().unwrap().unwrap();
    assert_eq!(report.received, 3);
    assert_eq!(report.acked, 1);
    assert_eq!(report.handler_errors, 2);
    assert_eq!(report.rejected, 2);
    assert_eq!(report.requeued, 0);
    assert_eq!(broker.queue_depth("jobs"), Some(0));

    let failures: Vec<String> = failures_rx.try_iter().collect();
    assert_eq!(failures.len(), 2);
    assert!(failures[0].contains("cannot handle this one"));
    assert_eq!(failures[1], "handler said no");
}

#[test]
fn test_double_ack_is_rejected() {
    let broker = MemoryBroker::new();
    seed(&broker, "q1", &["once"]);

    let mut conn = Connection::open(&broker, config()).unwrap();
    conn.consume(&["q1".to_string()]).unwrap();
    let delivery = conn
        .receive(TEST_TIMEOUT)
        .unwrap()
        .expect("Expected a delivery");

    conn.ack(&delivery.ack_handle).expect("First ack failed");
    assert!(matches!(
        conn.ack(&delivery.ack_handle),
        Err(Error::AlreadyResolved(_))
    ));
    assert!(matches!(
        conn.reject(&delivery.ack_handle.clone(), true),
        Err(Error::AlreadyResolved(_))
    ));
    assert_eq!(broker.stats().messages_acked, 1);
}

#[test]
fn test_ack_handle_from_another_connection_is_rejected() {
    let broker = MemoryBroker::new();
    seed(&broker, "q1", &["x"]);

    let mut receiver = Connection::open(&broker, config()).unwrap();
    receiver.consume(&["q1".to_string()]).unwrap();
    let delivery = receiver.receive(TEST_TIMEOUT).unwrap().unwrap();

    let mut other = Connection::open(&broker, config()).unwrap();
    assert!(matches!(
        other.ack(&delivery.ack_handle),
        Err(Error::UnknownDelivery(_))
    ));
    assert!(!delivery.ack_handle.is_resolved());
    receiver.ack(&delivery.ack_handle).unwrap();
}

#[test]
fn test_publish_order_is_preserved() {
    let broker = MemoryBroker::new();
    let bodies: Vec<String> = (1..=50).map(|i| format!("M{}", i)).collect();
    let refs: Vec<&str> = bodies.iter().map(String::as_str).collect();
    seed(&broker, "ordered", &refs);

    let (tx, rx) = channel::unbounded();
    let consumer = Consumer::new(["ordered"], move |message: &Message| {
        tx.send(message.as_text().unwrap().to_string()).unwrap();
        HandlerResult::Ack
    })
    .with_options(fast_options());

    let (stop, handle) = spawn(&broker, consumer);
    let received = collect(&rx, bodies.len());
    stop.stop();
    handle.join().unwrap().unwrap();

    assert_eq!(received, bodies);
}

#[test]
fn test_reject_with_requeue_puts_message_back() {
    let broker = MemoryBroker::new();
    seed(&broker, "retry", &["M"]);

    let stop = StopHandle::new();
    let consumer = {
        let stop_from_handler = stop.clone();
        Consumer::new(["retry"], move |_: &Message| {
            stop_from_handler.stop();
            HandlerResult::reject(true)
        })
        .with_options(fast_options())
        .with_stop_handle(stop.clone())
    };

    let (_, handle) = spawn(&broker, consumer);
    let report = handle.join().unwrap().unwrap();

    assert_eq!(report.requeued, 1);
    assert!(broker.queue_depth("retry").unwrap() >= 1);

    let mut conn = Connection::open(&broker, config()).unwrap();
    conn.consume(&["retry".to_string()]).unwrap();
    let delivery = conn.receive(TEST_TIMEOUT).unwrap().unwrap();
    assert!(delivery.redelivered);
    assert_eq!(delivery.delivery_count, 1);
    assert_eq!(delivery.message.as_text(), Some("M"));
    conn.ack(&delivery.ack_handle).unwrap();
}

#[test]
fn test_stop_during_handler_drains_in_flight_delivery() {
    let broker = MemoryBroker::new();
    seed(&broker, "slow", &["first", "second"]);

    let (entered_tx, entered_rx) = channel::bounded(1);
    let (release_tx, release_rx) = channel::bounded::<()>(1);
    let consumer = Consumer::new(["slow"], move |_: &Message| {
        entered_tx.send(()).unwrap();
        release_rx.recv_timeout(TEST_TIMEOUT).unwrap();
        HandlerResult::Ack
    })
    .with_options(fast_options());

    let (stop, handle) = spawn(&broker, consumer);
    entered_rx.recv_timeout(TEST_TIMEOUT).expect("Handler never started");

    stop.stop();
    assert_eq!(stop.state(), ConsumerState::Draining);
    assert_eq!(broker.queue_stats("slow").unwrap().unacked, 1);

    release_tx.send(()).unwrap();
    let report = handle.join().unwrap().unwrap();

    assert_eq!(stop.state(), ConsumerState::Stopped);
    assert_eq!(report.received, 1);
    assert_eq!(report.acked, 1);
    let stats = broker.queue_stats("slow").unwrap();
    assert_eq!(stats.unacked, 0);
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.consumers, 0);
}

#[test]
fn test_redelivery_limit_stops_requeue_loop() {
    let broker = MemoryBroker::new();
    seed(&broker, "poison", &["bad"]);

    let attempts = Arc::new(AtomicUsize::new(0));
    let consumer = {
        let attempts = Arc::clone(&attempts);
        Consumer::new(["poison"], move |_: &Message| {
            attempts.fetch_add(1, Ordering::SeqCst);
            HandlerResult::reject(true)
        })
        .with_options(ConsumerOptions {
            tick: Duration::from_millis(10),
            redelivery: RedeliveryPolicy::limited(2),
        })
    };

    let (stop, handle) = spawn(&broker, consumer);
    wait_until(|| broker.stats().messages_rejected == 3);
    stop.stop();
    let report = handle.join().unwrap().unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(report.requeued, 2);
    assert_eq!(report.dead_lettered, 1);
    assert_eq!(broker.queue_depth("poison"), Some(0));
}

#[test]
fn test_lost_connection_stops_consumer_with_error() {
    let broker = MemoryBroker::new();
    seed(&broker, "q1", &[]);

    let consumer = Consumer::new(["q1"], |_: &Message| HandlerResult::Ack)
        .with_options(fast_options());
    let (stop, handle) = spawn(&broker, consumer);
    wait_until(|| stop.state() == ConsumerState::Running);

    broker.drop_connections();
    let result = handle.join().unwrap();

    assert!(matches!(result, Err(Error::Connection(_))));
    assert_eq!(stop.state(), ConsumerState::Stopped);
}

#[test]
fn test_stop_before_start_and_restart() {
    let broker = MemoryBroker::new();
    seed(&broker, "q1", &["left alone"]);

    let mut consumer = Consumer::new(["q1"], |_: &Message| HandlerResult::Ack);
    consumer.stop_handle().stop();

    let mut conn = Connection::open(&broker, config()).unwrap();
    let report = consumer.start(&mut conn).unwrap();
    assert_eq!(report.received, 0);
    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(broker.queue_depth("q1"), Some(1));

    assert!(matches!(consumer.start(&mut conn), Err(Error::InvalidState(_))));
}

#[test]
fn test_missing_queue_fails_start() {
    let broker = MemoryBroker::new();
    let mut conn = Connection::open(&broker, config()).unwrap();
    let mut consumer = Consumer::new(["missing"], |_: &Message| HandlerResult::Ack);

    assert!(matches!(consumer.start(&mut conn), Err(Error::NotFound(_))));
    assert_eq!(consumer.state(), ConsumerState::Stopped);

    let mut empty = Consumer::new(Vec::<String>::new(), |_: &Message| HandlerResult::Ack);
    assert!(matches!(empty.start(&mut conn), Err(Error::InvalidConfig(_))));
}

#[test]
fn test_missed_heartbeat_window_breaks_connection() {
    let broker = MemoryBroker::new();
    let mut conn = Connection::open(
        &broker,
        config().with_heartbeat(Duration::from_secs(1)),
    )
    .unwrap();
    conn.heartbeat_check().unwrap();

    thread::sleep(Duration::from_millis(2100));

    assert!(matches!(conn.heartbeat_check(), Err(Error::Connection(_))));
    assert!(!conn.is_open());
    assert!(matches!(
        Producer::new().publish(&mut conn, &Message::text("late", "q1")),
        Err(Error::Publish(_))
    ));
    conn.close().unwrap();
}

#[test]
fn test_persistent_messages_survive_restart() {
    let broker = MemoryBroker::new();
    let mut conn = Connection::open(&broker, config()).unwrap();
    bind_all(&mut conn, &[QueueBinding::new("durable").durable(true)]).unwrap();
    let producer = Producer::new();
    producer
        .publish_batch(
            &mut conn,
            &[
                Message::text("kept", "durable").persistent(),
                Message::text("lost", "durable"),
            ],
        )
        .unwrap();

    broker.restart();
    assert!(!conn.is_open());

    let mut conn = Connection::open(&broker, config()).unwrap();
    conn.consume(&["durable".to_string()]).unwrap();
    let delivery = conn.receive(TEST_TIMEOUT).unwrap().unwrap();
    assert_eq!(delivery.message.as_text(), Some("kept"));
    conn.ack(&delivery.ack_handle).unwrap();
    assert!(conn.receive(Duration::from_millis(20)).unwrap().is_none());
}
