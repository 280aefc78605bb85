//! `relaychat simulate`: drive one human message through the relay
//!
//! Runs a loopback host in-process: the human message is delivered to every
//! managed connection, replies come from the echo generator and are printed,
//! and chain events travel back through the event bus until it goes quiet.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::SimulateArgs;
use crate::bus::EventBus;
use crate::config::Config;
use crate::generation::{EchoGenerator, GeneratedReply};
use crate::history::{HistoryStore, InMemoryHistoryStore, JsonFileHistoryStore};
use crate::persona::Roster;
use crate::relay::{
    DelayRange, DeliveryTarget, InboundMessage, InboundOutcome, RandomSource, RelayCollaborators,
    RelayEngine, ReplyTransport, SeededRandom, ThreadRandom,
};

/// Prints delivered replies to stdout.
struct ConsoleTransport {
    roster: Arc<Roster>,
}

#[async_trait]
impl ReplyTransport for ConsoleTransport {
    async fn deliver(&self, target: &DeliveryTarget, reply: &GeneratedReply) -> Result<()> {
        let name = self
            .roster
            .get(&target.platform_id)
            .map(|p| p.persona_name.as_str())
            .unwrap_or("?");
        println!("[{}] {}: {}", target.session_id, name, reply.plain_text());
        Ok(())
    }
}

type Handled = (String, bool, InboundOutcome);

fn spawn_handle(tasks: &mut JoinSet<Handled>, engine: &Arc<RelayEngine>, message: InboundMessage) {
    let engine = Arc::clone(engine);
    tasks.spawn(async move {
        let platform_id = message.platform_id.clone();
        let is_chain = message.is_chain();
        let outcome = engine.handle_inbound(message).await;
        (platform_id, is_chain, outcome)
    });
}

fn report(roster: &Roster, (platform_id, is_chain, outcome): Handled) {
    let name = roster
        .get(&platform_id)
        .map(|p| p.persona_name.as_str())
        .unwrap_or(&platform_id);
    let via = if is_chain { "relayed message" } else { "message" };
    match outcome {
        InboundOutcome::Replied { fan_out, .. } => {
            let scheduled = fan_out.scheduled_count();
            if scheduled > 0 {
                println!("    ({name} relays to {scheduled} persona(s))");
            }
        }
        InboundOutcome::Declined | InboundOutcome::StopPropagation => {
            println!("    ({name} ignores the {via})");
        }
        InboundOutcome::Ignored(reason) => {
            tracing::debug!(persona = %name, ?reason, "Event ignored");
        }
        InboundOutcome::NoReply(reason) => {
            println!("    ({name} failed to reply: {reason:?})");
        }
    }
}

pub async fn execute(args: SimulateArgs, explicit: Option<&Path>) -> Result<()> {
    let config = Config::load(explicit).await?;
    let roster = Arc::new(config.build_roster()?);

    let mut settings = config.relay_settings();
    if args.fast {
        settings.initial_delay = DelayRange::NONE;
        settings.chain_delay = DelayRange::NONE;
        settings.reply_lock_release_delay = Duration::ZERO;
    }

    let history: Arc<dyn HistoryStore> = if args.persist {
        Arc::new(JsonFileHistoryStore::new(
            config.history_dir(),
            config.history.max_entries,
        ))
    } else {
        Arc::new(InMemoryHistoryStore::new(config.history.max_entries))
    };
    let random: Arc<dyn RandomSource> = match args.seed {
        Some(seed) => Arc::new(SeededRandom::new(seed)),
        None => Arc::new(ThreadRandom),
    };

    let bus = EventBus::new().into_arc();
    let mut inbox = bus.handle("simulator");
    let transport = Arc::new(ConsoleTransport {
        roster: Arc::clone(&roster),
    });
    let parts = RelayCollaborators::new(history, Arc::new(EchoGenerator), transport, bus.clone())
        .with_random(random);
    let engine = RelayEngine::new(
        Arc::clone(&roster),
        Arc::new(config.profile_directory()),
        settings,
        parts,
    )
    .into_arc();

    println!("[{}] {}: {}", args.session, args.sender_name, args.message);

    let message_id = Uuid::new_v4().to_string();
    let mut tasks = JoinSet::new();
    let recipients = if args.direct { 1 } else { roster.len() };
    for persona in roster.iter().take(recipients) {
        let message = if args.direct {
            InboundMessage::direct(&persona.platform_id, &args.sender, &args.message)
        } else {
            InboundMessage::group(&persona.platform_id, &args.session, &args.sender, &args.message)
        }
        .with_id(&message_id)
        .with_platform_kind("simulator")
        .with_sender_name(&args.sender_name)
        .with_self_id(&persona.physical_bot_id);
        spawn_handle(&mut tasks, &engine, message);
    }

    let quiet = Duration::from_secs(args.quiet_secs.max(1));
    loop {
        tokio::select! {
            Some(joined) = tasks.join_next() => match joined {
                Ok(handled) => report(&roster, handled),
                Err(err) => tracing::warn!(error = %err, "Relay task failed"),
            },
            received = tokio::time::timeout(quiet, inbox.recv()) => match received {
                Ok(Some(envelope)) => {
                    tracing::debug!(topic = %envelope.topic, "Relay event received");
                    spawn_handle(&mut tasks, &engine, envelope.event);
                }
                Ok(None) => break,
                Err(_) => {
                    if tasks.is_empty() && engine.scheduler().pending() == 0 {
                        break;
                    }
                }
            },
        }
    }

    engine.shutdown();
    let snapshot = engine.metrics().snapshot();
    println!();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{snapshot}");
    }
    Ok(())
}
