// Throttled publish/subscribe round trip on the loopback engine.
//
//   cargo run --example throttled_publisher -- <num_messages> [--auto-exit]
use mama_bridge::loopback;
use mama_bridge::Bridge::{BridgeBuilder, Message, Publisher, Queue, Subscription, SubscriptionHandler, Transport};
use mama_bridge::Core::{Closure, Status};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const FID_SEQ: u16 = 1;
const FID_DIGEST: u16 = 2;

struct Verifier {
    received: AtomicUsize,
    corrupt: AtomicUsize,
}

impl SubscriptionHandler for Verifier {
    fn on_msg(&self, _subscription: &Subscription, msg: &Message, _closure: &Closure) {
        let (seq, digest) = match (msg.get_i64(None, FID_SEQ), msg.get_string(None, FID_DIGEST)) {
            (Ok(seq), Ok(digest)) => (seq, digest),
            _ => {
                self.corrupt.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        if digest != digest_of(seq) {
            self.corrupt.fetch_add(1, Ordering::Relaxed);
        }
        let received = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        if received % 100 == 0 {
            println!("Received {} messages", received);
        }
    }
}

fn digest_of(seq: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("message_{}", seq).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <num_messages> [--auto-exit]", args[0]);
        std::process::exit(1);
    }
    let num_messages: i64 = args[1].parse()?;
    let auto_exit = args.get(2).map(|s| s == "--auto-exit").unwrap_or(false);

    let bridge = BridgeBuilder::new().with_name("demo").build(loopback::api());
    let transport = Transport::create(&bridge, "loopback")?;
    let queue = Queue::create(&bridge)?;
    let verifier = Arc::new(Verifier {
        received: AtomicUsize::new(0),
        corrupt: AtomicUsize::new(0),
    });

    let subscription = Subscription::create(&transport, &queue, verifier.clone(), "DEMO.HASHES", None)?;
    let publisher = Publisher::create(&transport, "DEMO.HASHES", None, None)?;

    let keep_alive = Arc::new(AtomicBool::new(true));
    let keep_alive_for_handler = Arc::clone(&keep_alive);

    // Handle Ctrl+C to stop early
    ctrlc::set_handler(move || {
        keep_alive_for_handler.store(false, Ordering::SeqCst);
    })?;

    let completed = Arc::new(AtomicUsize::new(0));
    let start_send = Instant::now();
    for seq in 0..num_messages {
        if !keep_alive.load(Ordering::SeqCst) {
            break;
        }
        let msg = Message::new(&bridge)?;
        msg.add_i64(Some("seq"), FID_SEQ, seq)?;
        msg.add_string(Some("digest"), FID_DIGEST, &digest_of(seq))?;

        let completed = completed.clone();
        publisher.send_with_throttle(&msg, None, move |_publisher: &Publisher, _msg: &Message, status: Status, _closure: &Closure| {
            if status.is_ok() {
                completed.fetch_add(1, Ordering::Relaxed);
            } else {
                eprintln!("Send failed: {}", status);
            }
        })?;
        // `msg` is dropped here; the engine keeps it until the completion runs

        if seq % 64 == 63 {
            queue.timed_dispatch(Duration::from_millis(1))?;
        }
    }
    loopback::run_throttle();
    queue.timed_dispatch(Duration::from_millis(20))?;

    let send_time = start_send.elapsed();
    let received = verifier.received.load(Ordering::Relaxed);
    println!("Publisher: {} sends completed in {:.2?}", completed.load(Ordering::Relaxed), send_time);
    println!(
        "Subscriber: {} received, {} corrupt, {:.2} messages/sec",
        received,
        verifier.corrupt.load(Ordering::Relaxed),
        received as f64 / send_time.as_secs_f64()
    );

    if !auto_exit {
        println!("Press Ctrl+C to exit...");
        while keep_alive.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    publisher.destroy_wait()?;
    subscription.destroy()?;
    queue.destroy_wait()?;
    transport.destroy()?;
    println!("Shutting down, {} stray callbacks", bridge.stray_callbacks());
    Ok(())
}
