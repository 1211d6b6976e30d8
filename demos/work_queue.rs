use burrow::settings::ClientSettings;
use burrow::{
    bind_all, logging, Connection, ConnectionConfig, Consumer, ConsumerOptions, HandlerResult,
    MemoryBroker, Message, Producer, QueueBinding, RedeliveryPolicy, Result,
};
use crossbeam::channel;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::thread;
use std::time::Duration;

const QUEUE: &str = "jobs";
const JOB_COUNT: u32 = 20;
const WORKERS: usize = 2;

#[derive(Serialize, Deserialize, Debug)]
struct Job {
    id: u32,
    payload: String,
}

fn main() {
    logging::init("info");

    if let Err(e) = run() {
        eprintln!("Work queue demo failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    // An optional settings file overrides the connection and consumer options
    let (config, options) = match env::args().nth(1) {
        Some(path) => {
            let settings = ClientSettings::load(Some(Path::new(&path)))?;
            (settings.connection, settings.consumer)
        }
        None => (
            ConnectionConfig::new("memory://work-queue"),
            ConsumerOptions {
                tick: Duration::from_millis(50),
                redelivery: RedeliveryPolicy::limited(3),
            },
        ),
    };

    let broker = MemoryBroker::new();
    let mut conn = Connection::open(&broker, config.clone())?;
    bind_all(&mut conn, &[QueueBinding::new(QUEUE).durable(true)])?;

    let producer = Producer::new();
    for id in 0..JOB_COUNT {
        let job = Job {
            id,
            payload: format!("resize image #{}", id),
        };
        producer.publish(&mut conn, &Message::json(&job, QUEUE)?.persistent())?;
    }
    println!("Queued {} jobs", JOB_COUNT);

    let (done_tx, done_rx) = channel::unbounded::<(usize, u32)>();
    let mut stops = Vec::new();
    let mut workers = Vec::new();

    for worker in 0..WORKERS {
        let done_tx = done_tx.clone();
        let mut consumer = Consumer::new([QUEUE], move |message: &Message| {
            let job: Job = match message.json_body() {
                Ok(job) => job,
                Err(e) => return HandlerResult::error(e),
            };
            // Roughly one job in five fails and goes back on the queue
            if rand::thread_rng().gen_bool(0.2) {
                println!("Worker {} failed job {}, requeueing", worker, job.id);
                return HandlerResult::reject(true);
            }
            thread::sleep(Duration::from_millis(10));
            let _ = done_tx.send((worker, job.id));
            HandlerResult::Ack
        })
        .with_options(options);
        stops.push(consumer.stop_handle());

        let broker = broker.clone();
        let config = config.clone();
        workers.push(thread::spawn(move || {
            let mut conn = Connection::open(&broker, config)?;
            consumer.start(&mut conn)
        }));
    }
    drop(done_tx);

    let mut finished = HashSet::new();
    while finished.len() < JOB_COUNT as usize {
        match done_rx.recv_timeout(Duration::from_secs(5)) {
            Ok((worker, id)) => {
                println!("Worker {} finished job {}", worker, id);
                finished.insert(id);
            }
            // Jobs past the redelivery limit never finish
            Err(_) => break,
        }
    }

    for stop in &stops {
        stop.stop();
    }
    for (index, worker) in workers.into_iter().enumerate() {
        match worker.join() {
            Ok(Ok(report)) => println!(
                "Worker {}: {} acked, {} requeued, {} dropped",
                index, report.acked, report.requeued, report.dead_lettered
            ),
            Ok(Err(e)) => eprintln!("Worker {} stopped with error: {}", index, e),
            Err(_) => eprintln!("Worker {} panicked", index),
        }
    }

    let stats = broker.stats();
    println!(
        "Finished {}/{} jobs; broker saw {} published, {} acked, {} requeued",
        finished.len(),
        JOB_COUNT,
        stats.messages_published,
        stats.messages_acked,
        stats.messages_requeued
    );
    conn.close()
}
