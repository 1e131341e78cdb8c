//! End-to-end messaging benchmark for Vigil.
//!
//! Opens pairs of WebSocket clients against a running server and has each
//! client message its partner as fast as the server accepts. Counts the
//! `message:new` events received.
//!
//! ```bash
//! VIGIL_AUTH__JWT_SECRET=bench-secret-0123456789 cargo run --release -p vigil-server
//! VIGIL_AUTH__JWT_SECRET=bench-secret-0123456789 cargo run --release --bin e2e_messaging -- 16
//! ```

use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use vigil_protocol::{codec, ClientEvent, ServerEvent};

const SERVER_URL: &str = "ws://127.0.0.1:8080/ws";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    exp: u64,
}

fn token(secret: &str, user: &str) -> Result<String, BoxError> {
    let claims = Claims {
        sub: user,
        exp: jsonwebtoken::get_current_timestamp() + 3_600,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let num_clients = num_clients.max(2) & !1;

    let Ok(secret) = std::env::var("VIGIL_AUTH__JWT_SECRET") else {
        eprintln!("VIGIL_AUTH__JWT_SECRET must match the server's secret");
        std::process::exit(1);
    };

    println!("Vigil end-to-end messaging benchmark");
    println!("  clients: {num_clients}, warmup: {WARMUP_SECS}s, measurement: {BENCH_SECS}s");
    println!();

    let received = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));
    let mut handles = Vec::new();

    for client_id in 0..num_clients {
        let user = format!("bench-{client_id}");
        let partner = format!("bench-{}", client_id ^ 1);
        let token = match token(&secret, &user) {
            Ok(token) => token,
            Err(e) => {
                eprintln!("Failed to sign token: {e}");
                std::process::exit(1);
            }
        };
        let received = Arc::clone(&received);
        let barrier = Arc::clone(&barrier);

        handles.push(tokio::spawn(async move {
            if let Err(e) = run_client(&token, partner, received, barrier).await {
                eprintln!("Client {client_id} error: {e}");
            }
        }));
    }

    barrier.wait().await;
    println!("All {num_clients} clients connected, warming up");
    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    received.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;
    let elapsed = start.elapsed();
    let total = received.load(Ordering::SeqCst);

    let per_sec = total as f64 / elapsed.as_secs_f64();
    println!();
    println!("  duration:      {:>10.2}s", elapsed.as_secs_f64());
    println!("  delivered:     {total:>10}");
    println!("  throughput:    {per_sec:>10.0} msg/s");
    println!("  per client:    {:>10.0} msg/s", per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    token: &str,
    partner: String,
    received: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let (ws, _) = connect_async(format!("{SERVER_URL}?token={token}")).await?;
    let (mut sender, mut receiver) = ws.split();

    // `connected` is always the first event.
    if let Some(frame) = receiver.next().await {
        frame?;
    }

    barrier.wait().await;

    let send = Message::Text(codec::encode_text(&ClientEvent::MessageSend {
        receiver_id: Some(partner),
        group_id: None,
        content: "benchmark payload".to_string(),
    })?);

    let recv_task = tokio::spawn(async move {
        while let Some(Ok(frame)) = receiver.next().await {
            if let Message::Text(text) = frame {
                if let Ok(ServerEvent::MessageNew { .. }) = codec::decode_text(&text) {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });

    loop {
        if sender.send(send.clone()).await.is_err() {
            break;
        }
        tokio::task::yield_now().await;
    }

    recv_task.abort();
    Ok(())
}
