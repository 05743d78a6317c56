//! Loopback call demo
//!
//! Two participants join the same room over an in-process relay and media
//! engine: the first one calls the second, both reach `connected`, then the
//! callee hangs up by leaving the room.
//!
//! Run with `RUST_LOG=callroom=debug` to watch the negotiation.

use callroom::{
    CallClient, CallEvent, CallState, GlobalConfig, LoopbackConnectionFactory,
    LoopbackMediaDevices, LoopbackRelay, Room,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

async fn join(relay: &LoopbackRelay, id: &str, email: &str) -> Result<Room, Box<dyn std::error::Error>> {
    let client = CallClient::init_with(
        GlobalConfig {
            debug_logging: true,
            ..Default::default()
        },
        Arc::new(LoopbackMediaDevices::new()),
        Arc::new(LoopbackConnectionFactory::new()),
    )?;
    let room = client
        .room("standup")
        .relay(Arc::new(relay.connect(id)))
        .email(email)
        .join()
        .await?;
    Ok(room)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("📞 Loopback call demo");
    println!("=====================");

    let relay = LoopbackRelay::new();

    let caller = join(&relay, "p1", "p1@example.com").await?;
    let mut caller_events = caller.events();
    println!("✅ {} joined {}", caller.participant_id(), caller.id());

    let callee = join(&relay, "p2", "p2@example.com").await?;
    let mut callee_events = callee.events();
    println!("✅ {} joined {}", callee.participant_id(), callee.id());

    // wait until the caller hears about the callee
    while let Some(event) = caller_events.next().await {
        if let CallEvent::RemoteParticipantJoined { participant_id, info } = event {
            println!("👋 {} ({}) is in the room", participant_id, info.label());
            break;
        }
    }

    caller.start_call().await?;
    caller.wait_for_state(CallState::Connected, WAIT).await?;
    callee.wait_for_state(CallState::Connected, WAIT).await?;
    println!("🎉 Call connected");

    while let Ok(Some(event)) = callee_events.try_next() {
        println!("   callee event: {}", event.event_type());
    }

    callee.set_video_enabled(false).await?;
    println!("📷 Callee turned the camera off");

    callee.leave().await?;
    caller.wait_for_state(CallState::Idle, WAIT).await?;
    println!("👋 Callee left, caller is back to {}", caller.state());

    let timeline = caller.connection_timeline();
    println!("\n📊 Caller timeline ({} entries)", timeline.len());
    println!("{}", timeline.to_json()?);

    caller.leave().await?;
    Ok(())
}
