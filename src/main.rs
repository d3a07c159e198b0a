//! Midiwire - Framed MIDI event ingestion
//!
//! Runs the ingestion server, or sends events to one.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use midiwire::config::{self, Config};
use midiwire::dispatch::{DispatchedEvent, Dispatcher, HandlerResult};
use midiwire::network::{resolve_host, AcceptMode, Client, Server, ServerEvent};
use midiwire::protocol::schema::{midi_event_descriptor, EventKind, MidiEvent};
use midiwire::protocol::{self, decode_message, message_to_json, FrameReader};

/// Midiwire - Framed MIDI event ingestion
#[derive(Parser)]
#[command(name = "midiwire")]
#[command(author = "Midiwire Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Receive length-prefixed protobuf MIDI events over TCP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion server
    Serve {
        /// Interface to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Connection admission policy
        #[arg(short, long, value_enum)]
        mode: Option<AcceptMode>,

        /// Largest accepted frame payload in bytes
        #[arg(long)]
        max_frame_size: Option<usize>,
    },

    /// Send one event to a running server
    Send {
        /// Server host
        #[arg(long, default_value = protocol::DEFAULT_HOST)]
        host: String,

        /// Server port
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,

        /// MIDI channel for channel events
        #[arg(long, default_value_t = 0)]
        channel: u32,

        #[command(subcommand)]
        event: SendCommand,
    },

    /// Decode a payload file and print it as JSON
    Decode {
        /// File holding the payload bytes
        file: PathBuf,

        /// The file holds length-prefixed frames rather than one bare payload
        #[arg(long)]
        framed: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum SendCommand {
    /// Ask the host to switch to another orchestra configuration
    LoadConfig { path: String },
    NoteOn { note: u32, velocity: u32 },
    NoteOff {
        note: u32,
        #[arg(default_value_t = 0)]
        velocity: u32,
    },
    Cc { controller: u32, value: u32 },
    ProgramChange { program: u32 },
    /// Raw wheel position, 0-16383 with 8192 at centre
    PitchBend { value: u32 },
    /// Polyphonic key pressure
    Aftertouch { note: u32, value: u32 },
    ChannelPressure { value: u32 },
    /// System exclusive body, e.g. `sys-ex 0x7E 0x7F 0x09`
    SysEx {
        #[arg(required = true, value_parser = parse_byte)]
        data: Vec<u8>,
    },
    /// Free-form text event
    Other { description: String },
    /// Send the contents of a file as one frame payload, unmodified
    Raw { file: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Serve {
            host,
            port,
            mode,
            max_frame_size,
        } => {
            let mut server_config = config.server;
            if let Some(host) = host {
                server_config.host = host;
            }
            if let Some(port) = port {
                server_config.port = port;
            }
            if let Some(mode) = mode {
                server_config.accept_mode = mode;
            }
            if let Some(max) = max_frame_size {
                server_config.max_frame_size = max;
            }
            run_server(server_config).await?;
        }
        Commands::Send {
            host,
            port,
            channel,
            event,
        } => {
            run_send(&host, port, channel, event).await?;
        }
        Commands::Decode { file, framed } => {
            run_decode(&file, framed, config.server.max_frame_size)?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
    }

    Ok(())
}

/// Log every decoded event; the performance engine binds its own handlers
/// when embedding the library
fn log_event(event: DispatchedEvent<'_>) -> HandlerResult {
    match MidiEvent::from_message(event.message).map(|e| e.kind) {
        Some(EventKind::LoadConfig { config_path }) => {
            tracing::info!(connection = event.context.connection_id, "Load config requested: {}", config_path);
        }
        _ => {
            let json = message_to_json(event.message, &midi_event_descriptor());
            tracing::info!(connection = event.context.connection_id, seq = event.context.sequence, "{}", json);
        }
    }
    Ok(())
}

/// Run the ingestion server
async fn run_server(server_config: midiwire::network::ServerConfig) -> anyhow::Result<()> {
    let descriptor = midi_event_descriptor();
    let mut dispatcher = Dispatcher::new(&descriptor);
    for field in descriptor.discriminants() {
        dispatcher.register_fn(field, log_event);
    }

    let mode = server_config.accept_mode;
    let mut server = Server::new(server_config, descriptor, dispatcher);
    let mut event_rx = server
        .take_event_receiver()
        .context("event receiver already taken")?;

    let local_addr = server.start().await?;

    println!("\n========================================");
    println!("  Midiwire Server Running");
    println!("========================================");
    println!("  Address: {}", local_addr);
    println!("  Mode: {:?}", mode);
    println!("========================================");
    println!("\nWaiting for connections...");
    println!("Press Ctrl+C to stop.\n");

    // Main event loop
    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(ServerEvent::ConnectionOpened { id, peer }) => {
                        println!("+ Connection {} from {}", id, peer);
                    }
                    Some(ServerEvent::ConnectionClosed { id, peer, reason }) => {
                        println!("- Connection {} from {} ({})", id, peer, reason);
                    }
                    Some(ServerEvent::FrameReceived { id, sequence, length }) => {
                        tracing::debug!("Connection {} frame {}: {} bytes", id, sequence, length);
                    }
                    Some(ServerEvent::Stopped) | None => break,
                    Some(_) => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    if server.is_running() {
        server.stop().await?;
    }

    let stats = server.stats();
    tracing::info!(
        "Served {} connection(s), {} frame(s), {} dispatched, {} dropped",
        stats.connections_accepted,
        stats.frames_received,
        stats.events_dispatched,
        stats.events_dropped
    );

    Ok(())
}

/// Send one event to a server
async fn run_send(host: &str, port: u16, channel: u32, command: SendCommand) -> anyhow::Result<()> {
    let addr = resolve_host(host, port).await?;
    let mut client = Client::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;

    let kind = match command {
        SendCommand::Raw { file } => {
            let payload = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
            client.send_payload(&payload).await?;
            println!("Sent {} byte payload to {}", payload.len(), addr);
            client.close().await?;
            return Ok(());
        }
        SendCommand::LoadConfig { path } => EventKind::LoadConfig { config_path: path },
        SendCommand::NoteOn { note, velocity } => EventKind::NoteOn {
            note_number: note,
            velocity,
        },
        SendCommand::NoteOff { note, velocity } => EventKind::NoteOff {
            note_number: note,
            velocity,
        },
        SendCommand::Cc { controller, value } => EventKind::Cc {
            controller_number: controller,
            controller_value: value,
        },
        SendCommand::ProgramChange { program } => EventKind::ProgramChange { program_number: program },
        SendCommand::PitchBend { value } => EventKind::PitchBend { value },
        SendCommand::Aftertouch { note, value } => EventKind::Aftertouch {
            note_number: note,
            value,
        },
        SendCommand::ChannelPressure { value } => EventKind::ChannelPressure { value },
        SendCommand::SysEx { data } => EventKind::SysEx { data: data.into() },
        SendCommand::Other { description } => EventKind::Other { description },
    };

    let event = MidiEvent::new(kind).on_channel(channel);
    client.send_event(&event).await?;
    println!("Sent {:?} to {}", event.kind, addr);

    client.close().await?;
    Ok(())
}

/// Parse one byte given in decimal or `0x` hex
fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid byte '{}': {}", s, e))
}

/// Decode payload bytes from a file
fn run_decode(file: &Path, framed: bool, max_frame_size: usize) -> anyhow::Result<()> {
    let contents = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let descriptor = midi_event_descriptor();

    let payloads = if framed {
        let mut reader = FrameReader::new(max_frame_size);
        reader.extend(&contents);
        let mut payloads = Vec::new();
        while let Some(frame) = reader.next_frame()? {
            payloads.push(frame.into_payload());
        }
        reader.finish()?;
        payloads
    } else {
        vec![bytes::Bytes::from(contents)]
    };

    for payload in payloads {
        let message = decode_message(&payload, &descriptor)?;
        println!("{}", serde_json::to_string_pretty(&message_to_json(&message, &descriptor))?);
    }

    Ok(())
}
