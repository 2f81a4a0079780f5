use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use image::{DynamicImage, Rgb, RgbImage};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info};

use crate::frames;
use crate::protocol::{AgentCommand, AgentMessage};

#[derive(Parser, Debug)]
#[command(name = "viewlink")]
#[command(about = "Remote-desktop session relay and debug agent client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a synthetic agent against a running relay: connects for the
    /// given session id, heartbeats, and pushes solid-color test frames.
    Agent {
        /// Relay URL (e.g., ws://localhost:8000)
        #[arg(short, long, default_value = "ws://localhost:8000")]
        url: String,

        /// Session ID to connect as
        #[arg(short, long)]
        session: String,

        /// Number of test frames to push
        #[arg(short = 'n', long, default_value_t = 30)]
        frames: u32,
    },
}

/// Synthetic agent loop. Useful for poking a live relay without a real
/// capture agent: viewers attached to the same session id see the color
/// cycle, and any commands the relay pushes are printed as they arrive.
pub async fn run_debug_agent(url: String, session: String, frame_count: u32) -> Result<()> {
    let ws_url = format!("{}/ws/agent/{}", url.trim_end_matches('/'), session);
    debug!("connecting to {}", ws_url);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            error!("connection timeout after 5 seconds");
            return Err(anyhow::anyhow!(
                "connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    // Prove the session is registered before streaming.
    let heartbeat = serde_json::to_string(&AgentMessage::Heartbeat)?;
    write.send(Message::Text(heartbeat.clone().into())).await?;
    let ack = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                if let Ok(AgentCommand::HeartbeatAck { timestamp }) = serde_json::from_str(&text) {
                    return Ok::<_, anyhow::Error>(timestamp);
                }
            }
        }
        Err(anyhow::anyhow!("connection closed before heartbeat ack"))
    })
    .await;

    match ack {
        Ok(Ok(timestamp)) => info!("session {} registered, relay time {}", session, timestamp),
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(anyhow::anyhow!("timeout waiting for heartbeat ack")),
    }

    for i in 0..frame_count {
        let shade = ((i * 8) % 256) as u8;
        let image = RgbImage::from_pixel(320, 240, Rgb([shade, 64, 255 - shade]));
        let jpeg = frames::encode_jpeg(&DynamicImage::ImageRgb8(image))?;
        write.send(Message::Binary(jpeg.into())).await?;

        if i % 10 == 9 {
            write.send(Message::Text(heartbeat.clone().into())).await?;
        }

        // Print anything the relay pushed down in the meantime.
        while let Ok(Some(msg)) = timeout(Duration::from_millis(10), read.next()).await {
            let Ok(Message::Text(text)) = msg else {
                continue;
            };
            match serde_json::from_str::<AgentCommand>(&text) {
                Ok(AgentCommand::Stop { reason }) => {
                    info!("relay requested stop ({}), closing", reason);
                    write.send(Message::Close(None)).await?;
                    return Ok(());
                }
                Ok(command) => info!("relay pushed: {:?}", command),
                Err(e) => debug!("unparseable relay message: {}", e),
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("pushed {} frames for session {}", frame_count, session);
    write.send(Message::Close(None)).await?;
    Ok(())
}
