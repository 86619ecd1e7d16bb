//! Session Engine Demo
//!
//! Creates two audio channels wired to each other over loopback UDP,
//! negotiates Opus on both and streams synthetic RTP until Ctrl+C.
//!
//! Usage: `session-demo [config.toml]`

use anyhow::{Context as _, Result};
use bytes::{BufMut, Bytes, BytesMut};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtc_session_engine::{
    channel::{ChannelId, MediaKind},
    codec::CodecSetting,
    config::EngineConfig,
    constants::DEFAULT_BIND_ADDR,
    transceiver::Direction,
    SessionEngine,
};

/// 20 ms of 48 kHz audio
const FRAME_INTERVAL: Duration = Duration::from_millis(20);
const SAMPLES_PER_FRAME: u32 = 960;
const STATS_EVERY: u16 = 250;

fn rtp_packet(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(12 + 80);
    buf.put_u8(0x80);
    buf.put_u8(payload_type & 0x7f);
    buf.put_u16(sequence);
    buf.put_u32(timestamp);
    buf.put_u32(ssrc);
    // Silence-sized payload
    buf.put_bytes(0, 80);
    buf.freeze()
}

fn connect(engine: &SessionEngine, a: ChannelId, b: ChannelId) -> Result<()> {
    let (a_rtp, a_rtcp) = engine.set_local_address(a, 0, 0, false)?;
    let (b_rtp, b_rtcp) = engine.set_local_address(b, 0, 0, false)?;
    engine.set_remote_address(a, DEFAULT_BIND_ADDR, b_rtp.port(), DEFAULT_BIND_ADDR, b_rtcp.port())?;
    engine.set_remote_address(b, DEFAULT_BIND_ADDR, a_rtp.port(), DEFAULT_BIND_ADDR, a_rtcp.port())?;
    tracing::info!(%a_rtp, %a_rtcp, %b_rtp, %b_rtcp, "Channels connected");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting session engine demo");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = EngineConfig::load_or_default(config_path.as_deref()).context("Failed to load config")?;

    let engine = SessionEngine::new(config)?;
    engine.initialize()?;

    let caller = engine.create_channel(MediaKind::Audio)?;
    let callee = engine.create_channel(MediaKind::Audio)?;

    let mut negotiated = Vec::new();
    for id in [caller, callee] {
        engine.add_transceiver(id, Direction::SendRecv)?;
        let stream = engine.set_codec(id, CodecSetting::named("opus"))?;
        tracing::info!(channel = id, codec = %stream.codec, ssrc = stream.local_ssrc, "Codec negotiated");
        negotiated.push(stream);
    }

    connect(&engine, caller, callee)?;
    engine.start_send(caller)?;
    engine.start_receive(callee)?;

    let payload_type = negotiated[0].codec.payload_type();
    let ssrc = negotiated[0].local_ssrc;
    let mut sequence: u16 = 0;
    let mut timestamp: u32 = 0;
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);

    tracing::info!("Streaming - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let packet = rtp_packet(payload_type, sequence, timestamp, ssrc);
                if let Err(e) = engine.send_rtp(caller, packet) {
                    tracing::warn!("Failed to send packet: {}", e);
                }

                sequence = sequence.wrapping_add(1);
                timestamp = timestamp.wrapping_add(SAMPLES_PER_FRAME);

                if sequence % STATS_EVERY == 0 {
                    let stats = engine.stats()?;
                    println!("{}", serde_json::to_string_pretty(&stats)?);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    engine.stop_send(caller)?;
    engine.stop_receive(callee)?;
    let stats = engine.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    Ok(())
}
