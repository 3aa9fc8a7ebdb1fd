//! Demo binary running a host and several peers over an in-memory transport.
//!
//! Configuration is loaded from `config.ron` and can be overridden via CLI flags.
//! Run with `cargo run -p flux-demo` for the default session.
//! Run with `cargo run -p flux-demo -- --peers 4 --ticks 300 --jitter-delay-ms 50`
//! to change its shape.

mod loopback;
mod node;

use std::collections::BTreeMap;

use clap::Parser;
use flux_actions::PeerId;
use flux_config::{CliArgs, Config, default_config_dir};
use flux_net::{NetworkError, UserId};
use glam::DVec3;
use tracing::info;

use crate::loopback::LoopbackHub;
use crate::node::{Node, TickStats};

/// Scripted session events, by tick.
struct Schedule {
    avatars: u32,
    request: u32,
    leave: u32,
}

impl Schedule {
    fn new(ticks: u32) -> Self {
        Self {
            avatars: 1,
            request: ticks / 3,
            leave: ticks * 2 / 3,
        }
    }
}

fn main() {
    let args = CliArgs::parse();

    // Resolve config directory; without one the defaults are used unsaved.
    let config_dir = args
        .config
        .clone()
        .or_else(|| default_config_dir().ok());

    let mut config = match &config_dir {
        Some(dir) => Config::load_or_create(dir).unwrap_or_else(|e| {
            eprintln!("Failed to load config: {e}, using defaults");
            Config::default()
        }),
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.as_ref().map(|dir| dir.join("logs"));
    if let Err(err) = flux_log::init_logging(log_dir.as_deref(), cfg!(debug_assertions), Some(&config)) {
        eprintln!("Failed to initialize logging: {err}");
    }

    info!(
        peers = args.peers,
        ticks = args.ticks,
        tick_rate = config.network.tick_rate,
        jitter_delay_ms = config.network.jitter_buffer_delay_ms,
        "starting session"
    );

    if let Err(err) = run(&args, &config) {
        tracing::error!("session failed: {err}");
        std::process::exit(1);
    }
}

fn run(args: &CliArgs, config: &Config) -> Result<(), NetworkError> {
    let host_id = PeerId::new("host");
    let mut nodes: BTreeMap<PeerId, Node> = BTreeMap::new();
    let mut host = Node::new(host_id.clone(), UserId::new("user-0"), host_id.clone(), config)?;
    let crate_uuid = host.spawn_object("crate", DVec3::new(0.0, 1.0, 0.0))?;

    for i in 1..=args.peers {
        let peer_id = PeerId::new(format!("peer-{i}"));
        let user_id = UserId::new(format!("user-{i}"));
        let record = host.admit(peer_id.clone(), user_id.clone())?;

        let mut peer = Node::new(peer_id.clone(), user_id, host_id.clone(), config)?;
        if let Some(host_record) = host.registry_record(&host_id) {
            peer.learn_peer(host_record);
        }
        peer.learn_peer(record);
        nodes.insert(peer_id, peer);
    }
    nodes.insert(host_id.clone(), host);

    let schedule = Schedule::new(args.ticks);
    let requester = PeerId::new("peer-1");
    let leaver = (args.peers >= 2).then(|| PeerId::new(format!("peer-{}", args.peers)));
    let mut hub = LoopbackHub::new();

    for tick in 0..args.ticks {
        for delivery in hub.due(tick) {
            if let Some(node) = nodes.get_mut(&delivery.to) {
                node.deliver(delivery.from, delivery.channel, delivery.bytes);
            }
        }

        if tick == schedule.avatars {
            for node in nodes.values_mut().filter(|node| !node.is_host()) {
                let offset = node.peer_ids().len() as f64;
                node.spawn_avatar("default", DVec3::new(offset, 0.0, -offset))?;
            }
        }
        if tick == schedule.request
            && let Some(node) = nodes.get_mut(&requester)
        {
            info!(peer = %requester, entity = %crate_uuid, "requesting authority");
            node.request_authority(&crate_uuid)?;
        }
        if tick == schedule.leave
            && let Some(leaver) = &leaver
            && nodes.remove(leaver).is_some()
        {
            hub.disconnect(leaver);
            if let Some(host) = nodes.get_mut(&host_id) {
                host.release(leaver)?;
            }
        }

        let members: Vec<PeerId> = nodes.keys().cloned().collect();
        for node in nodes.values_mut() {
            node.tick()?;
            let from = node.peer_id.clone();
            hub.collect(tick, &from, &mut node.outbox, &members);
        }
    }

    tracing::debug!(in_flight = hub.in_flight(), "messages left undelivered");
    report(&nodes, &crate_uuid, &host_id);
    Ok(())
}

fn report(nodes: &BTreeMap<PeerId, Node>, crate_uuid: &str, host_id: &PeerId) {
    let mut total = TickStats::default();
    let host_position = nodes
        .get(host_id)
        .and_then(|host| host.position_of(crate_uuid));

    for node in nodes.values() {
        let stats = node.stats();
        total += stats;
        let drift = match (host_position, node.position_of(crate_uuid)) {
            (Some(a), Some(b)) => a.distance(b),
            _ => f64::NAN,
        };
        info!(
            peer = %node.peer_id,
            objects = node.object_count(),
            history = node.history_len(),
            crate_authority = ?node.authority_of(crate_uuid).map(|peer| peer.to_string()),
            crate_drift = drift,
            frames_sent = stats.frames_sent,
            frames_applied = stats.frames_applied,
            "node summary"
        );
    }
    info!(
        actions_applied = total.actions_applied,
        frames_sent = total.frames_sent,
        frames_applied = total.frames_applied,
        frames_dropped = total.frames_dropped,
        "session complete"
    );
}
