//! RadioMesh Command-Line Interface
//!
//! This CLI provides tools for:
//! - Decoding and building raw mesh frames
//! - Simulating multi-hop meshes over an in-memory radio medium
//! - Demonstrating the device inclusion handshake
//!
//! No radio hardware is involved; every node runs the real core over
//! `radiomesh_core::sim`.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use radiomesh_core::packet::{HEADER_LEN, MAX_FRAME_LEN, MAX_PAYLOAD};
use radiomesh_core::sim::{MeshSimulator, SimConfig, SimEvent, SimStats};
use radiomesh_core::{
    InclusionEvent, InclusionState, MeshConfig, NodeId, Packet, PacketError, SignalIndicator,
    Topic,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "radiomesh")]
#[command(author, version, about = "RadioMesh frame and mesh simulation CLI", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Device configuration template (JSON); unset fields use defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a raw frame given as hex
    Decode {
        /// Frame bytes in hex (spaces and 0x prefix allowed)
        frame: String,
    },

    /// Build a raw frame and print it as hex (payload is not sealed)
    Encode {
        /// Source node ID (hex)
        #[arg(short, long)]
        source: String,

        /// Destination node ID (hex) or "broadcast"
        #[arg(short, long, default_value = "broadcast")]
        dest: String,

        /// Topic: ping, pong, ack, cmd, bye, or a number
        #[arg(short, long, default_value = "cmd")]
        topic: String,

        /// Payload text
        #[arg(short, long, default_value = "")]
        message: String,

        /// Hops already travelled
        #[arg(long, default_value = "0")]
        hop_count: u8,
    },

    /// Simulate a mesh network with multiple nodes
    Simulate {
        /// Number of nodes to simulate (node 0 is the hub)
        #[arg(short, long, default_value = "5")]
        nodes: usize,

        /// Number of unicast messages to send
        #[arg(short, long, default_value = "10")]
        messages: usize,

        /// Node placement
        #[arg(short, long, value_enum, default_value = "line")]
        layout: Layout,

        /// Spacing between line nodes (meters, default 80% of radio range)
        #[arg(long)]
        spacing: Option<f64>,

        /// Side of the square area for random placement (meters)
        #[arg(long, default_value = "2000.0")]
        area: f64,

        /// Simulation steps to run after each message
        #[arg(long, default_value = "20")]
        steps: u64,

        /// Random seed for placement and traffic
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Print a JSON report instead of the summary
        #[arg(long)]
        json: bool,
    },

    /// Run the inclusion handshake between a hub and new devices
    Include {
        /// Number of devices asking to join
        #[arg(short, long, default_value = "2")]
        devices: usize,

        /// Leave the hub closed, so requests time out
        #[arg(long)]
        closed: bool,

        /// Simulation steps to run
        #[arg(long, default_value = "50")]
        steps: u64,
    },

    /// Show frame layout, topics and configuration defaults
    Info,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Layout {
    Line,
    Random,
}

fn parse_node_id(s: &str) -> Result<NodeId> {
    if s.eq_ignore_ascii_case("broadcast") {
        return Ok(NodeId::BROADCAST);
    }
    let value = u32::from_str_radix(s.trim_start_matches("0x"), 16)
        .with_context(|| format!("Invalid node ID hex: {}", s))?;
    Ok(NodeId::from_u32(value))
}

fn parse_topic(s: &str) -> Result<Topic> {
    let topic = match s.to_ascii_lowercase().as_str() {
        "ping" => Topic::Ping,
        "pong" => Topic::Pong,
        "ack" => Topic::Ack,
        "cmd" => Topic::Cmd,
        "bye" => Topic::Bye,
        other => {
            let value = match other.strip_prefix("0x") {
                Some(hex) => u8::from_str_radix(hex, 16),
                None => other.parse::<u8>(),
            }
            .with_context(|| format!("Unknown topic: {}", s))?;
            Topic::from_byte(value)
        }
    };
    Ok(topic)
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let hex: String = s
        .split_whitespace()
        .map(|part| part.trim_start_matches("0x"))
        .collect();
    if !hex.is_ascii() {
        anyhow::bail!("Hex input contains non-ASCII characters");
    }
    if hex.len() % 2 != 0 {
        anyhow::bail!("Hex input has an odd number of digits ({})", hex.len());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).context("Invalid hex value"))
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn load_config(path: &Option<PathBuf>) -> Result<MeshConfig> {
    let Some(path) = path else {
        return Ok(MeshConfig::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config: MeshConfig = serde_json::from_str(&text)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

fn cmd_decode(frame: String) -> Result<()> {
    let bytes = parse_hex(&frame)?;

    println!("=== Mesh Frame ===");
    println!();
    println!("Length:       {} bytes", bytes.len());

    let packet = match Packet::decode(&bytes) {
        Ok(packet) => packet,
        Err(PacketError::PacketCorrupted { expected, actual }) => {
            println!("Status:       CORRUPTED");
            println!("  Checksum in frame: {:08x}", expected);
            println!("  Computed checksum: {:08x}", actual);
            return Ok(());
        }
        Err(e) => {
            println!("Status:       INVALID ({})", e);
            return Ok(());
        }
    };

    println!("Status:       OK (checksum valid)");
    println!();
    println!("Source:       {}", packet.source);
    println!(
        "Destination:  {}{}",
        packet.destination,
        if packet.is_broadcast() { " (broadcast)" } else { "" }
    );
    println!("Topic:        {} ({:?})", packet.topic, packet.topic.category());
    println!("Packet ID:    {:08x}", packet.packet_id);
    println!("Hop count:    {}", packet.hop_count);
    println!("Last hop:     {}", packet.last_hop);
    println!("Next hop:     {}", packet.next_hop);
    println!("Payload:      {} bytes", packet.payload.len());
    if !packet.payload.is_empty() {
        println!("  {}", to_hex(&packet.payload));
    }

    Ok(())
}

fn cmd_encode(source: String, dest: String, topic: String, message: String, hop_count: u8) -> Result<()> {
    let source = parse_node_id(&source)?;
    let dest = parse_node_id(&dest)?;
    let topic = parse_topic(&topic)?;

    let mut packet = Packet::new(source, dest, topic, message.into_bytes())?;
    packet.hop_count = hop_count;
    let frame = packet.encode()?;

    println!("{}", to_hex(&frame));
    info!(len = frame.len(), id = packet.packet_id, "frame built");
    Ok(())
}

#[derive(Serialize)]
struct SimReport {
    nodes: usize,
    messages: usize,
    connected: bool,
    radio_range_m: f64,
    stats: SimStats,
}

#[allow(clippy::too_many_arguments)]
fn cmd_simulate(
    template: MeshConfig,
    num_nodes: usize,
    num_messages: usize,
    layout: Layout,
    spacing: Option<f64>,
    area: f64,
    steps: u64,
    seed: u64,
    json: bool,
) -> Result<()> {
    if num_nodes < 2 {
        anyhow::bail!("Need at least 2 nodes, got {}", num_nodes);
    }

    let config = SimConfig::default().with_seed(seed).with_mesh(template);
    let range = config.max_range();
    let mut sim = match layout {
        Layout::Line => MeshSimulator::line(config, num_nodes, spacing.unwrap_or(range * 0.8))?,
        Layout::Random => MeshSimulator::random(config, num_nodes, area, area)?,
    };
    sim.provision_all()?;

    if !json {
        println!("=== RadioMesh Network Simulation ===");
        println!();
        println!("Nodes:        {}", num_nodes);
        println!("Messages:     {}", num_messages);
        println!("Layout:       {:?}", layout);
        println!("Radio range:  {:.0} m", range);
        println!("Connected:    {}", sim.is_connected());
        println!();
        println!("Created {} nodes:", num_nodes);
        for i in 0..sim.node_count() {
            if let (Some(id), Some(pos)) = (sim.node_id(i), sim.node_position(i)) {
                println!("  - {} at ({:.0}, {:.0})", id, pos.x, pos.y);
            }
        }
        println!();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    for msg_idx in 0..num_messages {
        let from = rng.gen_range(0..num_nodes);
        let mut to = rng.gen_range(0..num_nodes - 1);
        if to >= from {
            to += 1;
        }

        let message = format!("Message {}", msg_idx);
        if let Err(e) = sim.send(from, to, Topic::Cmd, message.as_bytes()) {
            warn!(from, to, error = %e, "send failed");
            continue;
        }
        if let Err(e) = sim.run(steps) {
            warn!(error = %e, "simulation step failed");
        }
    }

    if json {
        let report = SimReport {
            nodes: num_nodes,
            messages: num_messages,
            connected: sim.is_connected(),
            radio_range_m: range,
            stats: sim.stats().clone(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    sim.print_summary();
    println!();
    println!("Routing tables:");
    for i in 0..sim.node_count() {
        let Some(device) = sim.device(i) else { continue };
        println!("  {}:", device.node_id());
        for route in device.router().routes().entries() {
            println!(
                "    -> {} via {} ({} hops, {} dBm, {:?})",
                route.destination,
                route.next_hop,
                route.hop_count,
                route.rssi,
                SignalIndicator::from_rssi(route.rssi)
            );
        }
    }

    Ok(())
}

fn cmd_include(template: MeshConfig, devices: usize, closed: bool, steps: u64) -> Result<()> {
    println!("=== RadioMesh Inclusion Demo ===");
    println!();

    // Everyone within earshot of the hub
    let config = SimConfig::default().with_mesh(template);
    let mut sim = MeshSimulator::line(config, devices + 1, 10.0)?;

    if let Some(hub) = sim.device_mut(0) {
        if closed {
            println!("Hub {}: inclusion mode CLOSED", hub.node_id());
        } else {
            hub.enable_inclusion_mode()?;
            println!("Hub {}: inclusion mode open", hub.node_id());
        }
    }

    for i in 1..=devices {
        let now = sim.now();
        if let Some(device) = sim.device_mut(i) {
            device.request_inclusion(now)?;
            println!("Device {}: INCLUDE_REQUEST sent", device.node_id());
        }
        // Stagger requests so the transcript reads in order
        sim.run(1)?;
    }
    println!();

    sim.run_until(steps, |s| {
        (1..s.node_count()).all(|i| {
            s.device(i)
                .map_or(true, |d| d.state() != InclusionState::InclusionPending)
        })
    })?;

    println!("Inclusion results:");
    for event in sim.events() {
        if let SimEvent::Inclusion { node_idx, event } = event {
            let node = sim.node_id(*node_idx).map(|id| id.to_string()).unwrap_or_default();
            match event {
                InclusionEvent::Included { peer } => {
                    println!("  {}: included with {}", node, peer)
                }
                InclusionEvent::Failed { peer, reason } => {
                    println!("  {}: FAILED with {} ({})", node, peer, reason)
                }
            }
        }
    }
    println!();

    println!("{:<10} {:<18} {:<8}", "Node", "State", "Key");
    println!("{}", "-".repeat(36));
    for i in 0..sim.node_count() {
        if let Some(device) = sim.device(i) {
            println!(
                "{:<10} {:<18} {:<8}",
                device.node_id().to_string(),
                format!("{:?}", device.state()),
                if device.keys().has_mesh_key() { "yes" } else { "no" }
            );
        }
    }
    println!();
    println!("Simulated time: {} ms", sim.now());

    Ok(())
}

fn cmd_info() -> Result<()> {
    let defaults = MeshConfig::default();

    println!("=== RadioMesh Frame Layout ===");
    println!();
    println!("  source(4) dest(4) topic(1) packet_id(4) hop_count(1)");
    println!("  last_hop(4) next_hop(4) payload_len(1) payload(n) crc32(4)");
    println!();
    println!("  Header:       {} bytes", HEADER_LEN);
    println!("  Max frame:    {} bytes", MAX_FRAME_LEN);
    println!("  Max payload:  {} bytes", MAX_PAYLOAD);
    println!("  Broadcast ID: {}", NodeId::BROADCAST);
    println!();
    println!("Topics:");
    for value in 0x01..=0x0A {
        let topic = Topic::from_byte(value);
        println!("  0x{:02x}  {:<18} {:?}", value, topic.to_string(), topic.category());
    }
    println!("  0x10+ application-defined");
    println!();
    println!("Defaults:");
    println!("  max_hops              {}", defaults.max_hops);
    println!("  dedup_window_ms       {}", defaults.dedup_window_ms);
    println!("  dedup_capacity        {}", defaults.dedup_capacity);
    println!("  route_timeout_ms      {}", defaults.route_timeout_ms);
    println!("  max_routes            {}", defaults.max_routes);
    println!("  inclusion_timeout_ms  {}", defaults.inclusion_timeout_ms);
    println!("  max_inclusion_sessions {}", defaults.max_inclusion_sessions);
    println!();
    println!("Examples:");
    println!("  radiomesh simulate --nodes 8 --messages 20");
    println!("  radiomesh simulate --layout random --area 1500 --json");
    println!("  radiomesh include --devices 3");
    println!("  radiomesh encode -s 00000001 -d 00000002 -t cmd -m on");
    println!("  radiomesh decode <hex>");

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    let template = load_config(&cli.config)?;

    match cli.command {
        Commands::Decode { frame } => cmd_decode(frame),

        Commands::Encode {
            source,
            dest,
            topic,
            message,
            hop_count,
        } => cmd_encode(source, dest, topic, message, hop_count),

        Commands::Simulate {
            nodes,
            messages,
            layout,
            spacing,
            area,
            steps,
            seed,
            json,
        } => cmd_simulate(template, nodes, messages, layout, spacing, area, steps, seed, json),

        Commands::Include {
            devices,
            closed,
            steps,
        } => cmd_include(template, devices, closed, steps),

        Commands::Info => cmd_info(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_id() {
        assert_eq!(parse_node_id("0x0000002a").unwrap(), NodeId::from_u32(42));
        assert_eq!(parse_node_id("broadcast").unwrap(), NodeId::BROADCAST);
        assert!(parse_node_id("xyz").is_err());
    }

    #[test]
    fn test_parse_topic() {
        assert_eq!(parse_topic("PING").unwrap(), Topic::Ping);
        assert_eq!(parse_topic("0x20").unwrap(), Topic::Application(0x20));
        assert_eq!(parse_topic("6").unwrap(), Topic::IncludeRequest);
        assert!(parse_topic("nope").is_err());
    }

    #[test]
    fn test_hex_roundtrip_through_frame() {
        let packet = Packet::broadcast(NodeId::from_u32(1), Topic::Cmd, b"on".to_vec()).unwrap();
        let hex = to_hex(&packet.encode().unwrap());
        let bytes = parse_hex(&hex).unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("aé1").is_err());
        assert!(parse_hex("éé").is_err());
    }
}
