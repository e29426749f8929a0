use std::sync::Arc;
use std::time::Duration;

use pairsync::{
    Codec, Envelope, JsonCodec, MemoryTransport, Origin, PostcardCodec, Replica, ReplicaConfig,
    Timestamp,
};
use tokio::time::{sleep, timeout};
use tracing::info;

use crate::CodecChoice;

type Result = std::result::Result<(), Box<dyn std::error::Error>>;

/// `pairsync demo`: replicate through an outage, then show LWW filtering.
pub async fn demo(retry_ms: u64, outage_ms: u64, codec: CodecChoice) -> Result {
    match codec {
        CodecChoice::Json => run_demo(JsonCodec, retry_ms, outage_ms).await,
        CodecChoice::Postcard => run_demo(PostcardCodec, retry_ms, outage_ms).await,
    }
}

async fn run_demo<C: Codec>(codec: C, retry_ms: u64, outage_ms: u64) -> Result {
    let retry = Duration::from_millis(retry_ms);
    let config = ReplicaConfig::from_env()?;
    let (phone_link, watch_link) = MemoryTransport::pair();

    let phone = Replica::builder("idle".to_string(), Arc::new(phone_link.clone()))
        .config(config.clone())
        .retry_interval(retry)
        .codec(codec.clone())
        .build()?;
    let watch = Replica::builder("idle".to_string(), Arc::new(watch_link.clone()))
        .config(config)
        .retry_interval(retry)
        .codec(codec.clone())
        .build()?;

    watch.add_sink(|origin: Origin| println!("  [watch] change from {origin}"));
    phone.add_sink(|origin: Origin| println!("  [phone] change from {origin}"));

    println!("== Link down, phone writes ==");
    phone_link.set_reachable(false);
    phone.write("running".to_string())?;
    println!("  phone reads {:?}", phone.read());
    println!("  watch reads {:?}", watch.read());
    println!("  phone transmission: {:?}", phone.transmission_phase());

    sleep(Duration::from_millis(outage_ms)).await;
    let stats = phone.transmission_stats();
    println!(
        "  after {outage_ms}ms outage: {} retries skipped, {} sent",
        stats.skipped_unreachable, stats.deliveries
    );

    println!();
    println!("== Link restored ==");
    phone_link.set_reachable(true);
    let mut watch_values = watch.subscribe_to_value();
    timeout(retry * 3, watch_values.wait_for(|v| v == "running")).await??;
    println!("  watch reads {:?}", watch.read());
    println!("  phone transmission: {:?}", phone.transmission_phase());

    println!();
    println!("== Watch writes back ==");
    // Make sure the watch's clock is past the phone's write.
    sleep(Duration::from_millis(2)).await;
    watch.write("paused".to_string())?;
    let mut phone_values = phone.subscribe_to_value();
    timeout(retry * 3, phone_values.wait_for(|v| v == "paused")).await??;
    println!("  phone reads {:?}", phone.read());

    println!();
    println!("== Late, stale delivery reaches the phone ==");
    let newest = phone.last_accepted().unwrap_or(Timestamp::EPOCH);
    let stale_at = Timestamp::from_millis(newest.as_millis().saturating_sub(1_000));
    let stale = codec.encode(&Envelope::new("stopped".to_string(), stale_at))?;
    let resolution = phone.receive(&stale)?;
    println!("  envelope from {stale_at}: {resolution:?}");
    println!("  phone still reads {:?}", phone.read());

    println!();
    let stats = phone.transmission_stats();
    println!(
        "Phone delivery: {} attempts, {} delivered, {} failed, {} skipped while unreachable",
        stats.attempts, stats.deliveries, stats.failures, stats.skipped_unreachable
    );
    info!(codec = C::NAME, "demo finished");

    phone.shutdown();
    watch.shutdown();
    Ok(())
}

/// `pairsync decode <json>`: print a captured envelope.
pub fn decode(text: &str) -> Result {
    let envelope: Envelope<serde_json::Value> = JsonCodec.decode(text.as_bytes())?;
    let (value, modified_at) = envelope.into_parts();

    println!("Modified at: {modified_at}");
    println!("Value:");
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
