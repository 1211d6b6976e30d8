use burrow::{
    logging, BrokerClient, ConnectionConfig, ExchangeDeclaration, ExchangeKind, HandlerResult,
    MemoryBroker, Message, QueueBinding, Role, RunOutcome, Work,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::env;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const EXCHANGE: &str = "telemetry";
const READINGS_PER_SENSOR: usize = 10;

#[derive(Serialize, Deserialize, Debug)]
struct TemperatureReading {
    sensor_id: String,
    temperature: f64,
    timestamp: u64,
    location: String,
}

fn main() {
    logging::init("info");

    let threshold: f64 = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(30.0);

    let broker = MemoryBroker::new();
    let config = ConnectionConfig::new("memory://telemetry");
    let exchange = ExchangeDeclaration::new(EXCHANGE, ExchangeKind::Topic);

    let monitor = BrokerClient::new(config.clone())
        .with_exchange(exchange.clone())
        .with_queues([QueueBinding::new("monitor").bind_to(EXCHANGE, Some("temperature.#"))])
        .works_as_a(Role::Consumer);
    let stop = monitor.stop_handle();

    // The monitor declares its binding before any sensor publishes
    let monitor_thread = {
        let broker = broker.clone();
        thread::spawn(move || {
            monitor.run(
                &broker,
                Work::consume(move |message: &Message| {
                    let reading: TemperatureReading = match message.json_body() {
                        Ok(reading) => reading,
                        Err(e) => return HandlerResult::error(e),
                    };
                    println!(
                        "Sensor {} at {} - Temperature: {:.1}°C",
                        reading.sensor_id, reading.location, reading.temperature
                    );
                    if reading.temperature > threshold {
                        println!(
                            "ALERT: High temperature {:.1}°C at {} (sensor {})",
                            reading.temperature, reading.location, reading.sensor_id
                        );
                    }
                    HandlerResult::Ack
                }),
            )
        })
    };
    while !broker.has_exchange(EXCHANGE) || broker.queue_stats("monitor").is_none() {
        thread::sleep(Duration::from_millis(10));
    }

    let sensors: Vec<_> = [("s1", "kitchen"), ("s2", "garage"), ("s3", "attic")]
        .into_iter()
        .map(|(sensor_id, location)| {
            let broker = broker.clone();
            let producer = BrokerClient::new(config.clone())
                .with_exchange(exchange.clone())
                .works_as_a(Role::Producer);
            thread::spawn(move || run_sensor(&broker, &producer, sensor_id, location))
        })
        .collect();

    for sensor in sensors {
        if sensor.join().is_err() {
            eprintln!("A sensor thread panicked");
        }
    }

    while broker.queue_depth("monitor").unwrap_or(0) > 0 {
        thread::sleep(Duration::from_millis(10));
    }
    stop.stop();

    match monitor_thread.join() {
        Ok(Ok(RunOutcome::Consumed(report))) => {
            println!("Monitor processed {} readings", report.acked)
        }
        Ok(Ok(other)) => println!("Unexpected outcome: {:?}", other),
        Ok(Err(e)) => eprintln!("Monitor failed: {}", e),
        Err(_) => eprintln!("Monitor thread panicked"),
    }
}

fn run_sensor(broker: &MemoryBroker, producer: &BrokerClient, sensor_id: &str, location: &str) {
    let mut rng = rand::thread_rng();
    let routing_key = format!("temperature.{}.{}", location, sensor_id);

    for _ in 0..READINGS_PER_SENSOR {
        let reading = TemperatureReading {
            sensor_id: sensor_id.to_string(),
            temperature: 25.0 + rng.gen_range(-10.0..10.0),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            location: location.to_string(),
        };

        let message = match Message::json(&reading, routing_key.as_str()) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("Failed to encode reading: {}", e);
                continue;
            }
        };
        if let Err(e) = producer.run(broker, Work::Publish(message)) {
            eprintln!("Failed to publish reading: {}", e);
        }
        thread::sleep(Duration::from_millis(rng.gen_range(20..80)));
    }
}
