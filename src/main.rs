use anyhow::Context;
use call_agent_rs::audio::capture::list_input_devices;
use call_agent_rs::config::{load_api_config, CallConfig};
use call_agent_rs::session::devices::SystemDevices;
use call_agent_rs::session::{CallState, SessionController};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "call-agent", about = "Realtime voice call with the concierge agent")]
struct Args {
    /// Conversation language for the agent.
    #[arg(long, default_value = "English")]
    language: String,

    /// Noise gate threshold (fraction of full scale).
    #[arg(long)]
    gate_threshold: Option<f32>,

    /// Seconds of silence before the call is ended.
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Capture device name (defaults to the system input device).
    #[arg(long)]
    device: Option<String>,

    /// List input devices and exit.
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    if args.list_devices {
        for name in list_input_devices().context("failed to enumerate input devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let api_config = load_api_config().context("API configuration missing")?;

    let mut config = CallConfig {
        device_name: args.device,
        ..CallConfig::default()
    };
    if let Some(threshold) = args.gate_threshold {
        config.gate_threshold = threshold;
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout = Duration::from_secs(secs);
    }

    let controller = Arc::new(SessionController::new(
        Arc::new(SystemDevices::new(api_config)),
        config,
    ));
    let mut events = controller.events();

    println!("📞 Starting consultation in {}...", args.language);
    println!("   Press Ctrl+C to hang up");
    controller.start_call(&args.language).await?;

    let mut connected_at: Option<Instant> = None;
    let mut status_line = String::new();

    loop {
        tokio::select! {
            changed = events.state.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *events.state.borrow();
                match state {
                    CallState::Connected => {
                        connected_at = Some(Instant::now());
                        println!("✅ Call connected");
                    }
                    CallState::Connecting => println!("… Connecting"),
                    CallState::Ended | CallState::Error | CallState::PermissionDenied => {
                        println!("\n📴 Call over ({})", state);
                        break;
                    }
                    CallState::Disconnected => {}
                }
            }

            changed = events.agent_speaking.changed() => {
                if changed.is_err() {
                    break;
                }
                let speaking = *events.agent_speaking.borrow();
                let duration = connected_at
                    .map(|t| t.elapsed().as_secs())
                    .unwrap_or(0);
                let next = if speaking {
                    format!("[{}:{:02}] Ananya speaking...", duration / 60, duration % 60)
                } else {
                    format!("[{}:{:02}] Listening...", duration / 60, duration % 60)
                };
                if next != status_line {
                    println!("{}", next);
                    status_line = next;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                println!("\n👋 Hanging up...");
                controller.end_call().await;
                break;
            }
        }
    }

    let lead = events.lead.borrow().clone();
    if !lead.is_empty() {
        println!("\n── Consultation report ──");
        let val = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());
        println!("  Name:     {}", val(&lead.full_name));
        println!("  Mobile:   {}", val(&lead.mobile));
        println!("  Location: {}", val(&lead.location));
        println!("  Shape:    {}", val(&lead.diamond_shape));
        println!("  Carat:    {}", val(&lead.carat_size));
        println!("  Budget:   {}", val(&lead.price_range));
        if let Some(summary) = &lead.summary {
            println!("  Summary:  {}", summary);
        }
    }

    Ok(())
}
