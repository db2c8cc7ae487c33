use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Drives server_telemetry and reports delivery rates", long_about = None)]
struct Args {
    /// Base URL of the gateway
    #[clap(long, default_value = "http://127.0.0.1:9003")]
    base_url: String,

    /// Subscriber to post readings for and listen as
    #[clap(long, default_value = "loadtest")]
    subscriber: String,

    /// Number of simulated devices
    #[clap(long, default_value_t = 10)]
    devices: usize,

    /// Readings per device per second
    #[clap(long, default_value_t = 1)]
    rate: u64,

    /// Report interval in seconds
    #[clap(short, long, default_value_t = 60)]
    report_interval_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    msg_type: String,
}

#[derive(Default)]
struct Stats {
    posted: u64,
    refused: HashMap<u16, u64>,
    frames: VecDeque<chrono::DateTime<Utc>>,
    by_type: HashMap<String, u64>,
}

fn ws_url(base_url: &str, subscriber: &str) -> String {
    let ws_base = base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{}/ws?subscriber_id={}", ws_base.trim_end_matches('/'), subscriber)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let stats = Arc::new(Mutex::new(Stats::default()));

    // Reporter
    let stats_reporter = Arc::clone(&stats);
    let report_interval_seconds = args.report_interval_seconds;
    tokio::spawn(async move {
        loop {
            sleep(std::time::Duration::from_secs(report_interval_seconds)).await;
            let one_minute_ago = Utc::now() - Duration::minutes(1);

            let Ok(mut data) = stats_reporter.lock() else {
                break;
            };
            while data.frames.front().is_some_and(|&t| t < one_minute_ago) {
                data.frames.pop_front();
            }

            let mut types: Vec<(String, u64)> =
                data.by_type.iter().map(|(k, v)| (k.clone(), *v)).collect();
            types.sort_by(|a, b| b.1.cmp(&a.1));
            let report = types
                .iter()
                .map(|(t, n)| format!("{}: {}", t, n))
                .collect::<Vec<_>>()
                .join(", ");

            println!("\n----- Summary -----");
            println!("Posted readings: {}", data.posted);
            println!("Refused: {:?}", data.refused);
            println!("Frame rate: {} msg/min", data.frames.len());
            println!("Frames: {}", if report.is_empty() { "No data" } else { &report });
            println!("-------------------\n");
        }
    });

    // Producers
    let client = reqwest::Client::new();
    let endpoint = format!("{}/telemetry", args.base_url.trim_end_matches('/'));
    for device in 0..args.devices {
        let client = client.clone();
        let endpoint = endpoint.clone();
        let subscriber = args.subscriber.clone();
        let stats = Arc::clone(&stats);
        let period = std::time::Duration::from_millis(1000 / args.rate.max(1));
        tokio::spawn(async move {
            let mut tick = 0u64;
            loop {
                let reading = json!({
                    "device_id": format!("device-{}", device),
                    "subscriber_id": subscriber,
                    "kind": "sensor",
                    "sensor_id": format!("sensor-{}", device),
                    "sensor_type": "temperature",
                    "value": 20.0 + (tick % 10) as f64,
                });
                tick += 1;

                match client.post(&endpoint).json(&reading).send().await {
                    Ok(resp) => {
                        if let Ok(mut data) = stats.lock() {
                            if resp.status().is_success() {
                                data.posted += 1;
                            } else {
                                *data.refused.entry(resp.status().as_u16()).or_default() += 1;
                            }
                        }
                    }
                    Err(e) => eprintln!("POST failed: {}", e),
                }
                sleep(period).await;
            }
        });
    }

    // Main WebSocket loop
    let url = ws_url(&args.base_url, &args.subscriber);
    println!("Connecting to {}...", url);
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let (mut write, mut read) = ws_stream.split();

    let topics: Vec<String> = (0..args.devices)
        .flat_map(|d| [format!("device:device-{}", d), format!("sensor:sensor-{}", d)])
        .collect();
    let sub_msg = json!({ "subscribe": topics }).to_string();
    write.send(Message::Text(sub_msg.into())).await?;
    println!("Subscribed. Press Ctrl+C to stop.");

    while let Some(Ok(msg)) = read.next().await {
        if let Message::Text(text) = msg {
            if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                if let Ok(mut data) = stats.lock() {
                    data.frames.push_back(Utc::now());
                    *data.by_type.entry(frame.msg_type).or_default() += 1;
                }
            }
        }
    }
    Ok(())
}
