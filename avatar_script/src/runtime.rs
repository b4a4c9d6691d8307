use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use avatar_script::customization::CustomizationKind;
use avatar_script::diagnostics::{ConsoleSink, FeedbackSink, RecordingSink, StyledText};
use avatar_script::source::strip_comments;
use avatar_script::{HostConfig, HostServices, LoopbackTransport, Participant, ScriptInstance};

use crate::cli::{RunArgs, StripArgs};

/// Longest a single queued body may take before the session gives up.
const BODY_TIMEOUT: Duration = Duration::from_secs(30);
/// Frame delta handed to render handlers.
const RENDER_DELTA: f32 = 0.05;

/// Echoes chat to stdout and keeps a copy for the summary.
#[derive(Clone, Default)]
struct SessionSink {
    console: ConsoleSink,
    transcript: RecordingSink,
}

impl FeedbackSink for SessionSink {
    fn emit(&self, text: StyledText) {
        self.console.emit(text.clone());
        self.transcript.emit(text);
    }
}

#[derive(Debug, Serialize)]
struct InstanceSummary {
    participant: String,
    load_error: bool,
    init_instructions: u64,
    last_tick_instructions: u64,
    last_render_instructions: u64,
    registered_pings: usize,
    customizations: BTreeMap<&'static str, Vec<String>>,
    chat: Vec<String>,
}

impl InstanceSummary {
    fn capture(instance: &ScriptInstance, sink: &SessionSink) -> Self {
        let customizations = CustomizationKind::ALL
            .into_iter()
            .filter_map(|kind| {
                let accessors = instance.customizations().map(kind).accessors();
                (!accessors.is_empty()).then_some((kind.as_str(), accessors))
            })
            .collect();
        Self {
            participant: instance.participant().id.clone(),
            load_error: instance.load_error(),
            init_instructions: instance.init_instructions(),
            last_tick_instructions: instance.tick_instructions(),
            last_render_instructions: instance.render_instructions(),
            registered_pings: instance.registered_pings(),
            customizations,
            chat: sink.transcript.plain_lines(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    script: String,
    ticks_run: u32,
    ticks_skipped: u32,
    renders_run: u32,
    pings_delivered: usize,
    saved_source: String,
    local: InstanceSummary,
    peer: Option<InstanceSummary>,
}

struct Peer {
    instance: ScriptInstance,
    sink: SessionSink,
}

pub fn execute(args: RunArgs) -> Result<()> {
    let RunArgs {
        script,
        id,
        name,
        loaded_name,
        config,
        ticks,
        render_every,
        peer,
        events,
        summary_json,
    } = args;

    let source = fs::read_to_string(&script)
        .with_context(|| format!("reading script {}", script.display()))?;
    let config = HostConfig::from_json_file(config.as_deref()).context("loading host config")?;
    let transport = Arc::new(LoopbackTransport::new());

    let loaded_name = loaded_name.or_else(|| {
        script
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
    });
    let mut participant = Participant::local(id.clone(), name.clone());
    if let Some(loaded_name) = loaded_name {
        participant = participant.with_loaded_name(loaded_name);
    }

    let local_sink = SessionSink::default();
    let local = ScriptInstance::load(
        participant,
        &source,
        HostServices::from_config(&config, transport.clone(), Arc::new(local_sink.clone())),
    )
    .context("starting local script worker")?;

    let peer = if peer {
        let sink = SessionSink::default();
        let instance = ScriptInstance::load(
            Participant::remote(id, name),
            &source,
            HostServices::from_config(&config, transport.clone(), Arc::new(sink.clone())),
        )
        .context("starting peer script worker")?;
        transport
            .subscribe(instance.inbox())
            .context("announcing peer copy")?;
        Some(Peer { instance, sink })
    } else {
        None
    };

    settle(&local)?;
    if let Some(peer) = &peer {
        settle(&peer.instance)?;
    }

    for call in &events {
        match local.call_event(&call.name, call.args.clone()) {
            Some(handle) => {
                if handle.wait_timeout(BODY_TIMEOUT).is_none() {
                    bail!("event {} did not finish within {BODY_TIMEOUT:?}", call.name);
                }
            }
            None => log::warn!("[avatar_script] event '{}' is not in the catalog", call.name),
        }
    }

    let mut ticks_run = 0;
    let mut ticks_skipped = 0;
    let mut renders_run = 0;
    let mut pings_delivered = 0;
    for tick in 1..=ticks {
        if local.tick() {
            ticks_run += 1;
        } else {
            ticks_skipped += 1;
        }
        settle(&local)?;
        pings_delivered += transport.pump().context("routing pings")?;

        if let Some(peer) = &peer {
            peer.instance.tick();
            settle(&peer.instance)?;
        }

        if render_every > 0 && tick % render_every == 0 {
            if local.render(RENDER_DELTA) {
                renders_run += 1;
            }
            settle(&local)?;
            if let Some(peer) = &peer {
                peer.instance.render(RENDER_DELTA);
                settle(&peer.instance)?;
            }
        }
    }

    let summary = SessionSummary {
        script: script.display().to_string(),
        ticks_run,
        ticks_skipped,
        renders_run,
        pings_delivered,
        saved_source: local.serialize().source,
        local: InstanceSummary::capture(&local, &local_sink),
        peer: peer
            .as_ref()
            .map(|peer| InstanceSummary::capture(&peer.instance, &peer.sink)),
    };

    println!(
        "Session finished: {} ticks ({} skipped), {} renders, {} pings delivered",
        summary.ticks_run, summary.ticks_skipped, summary.renders_run, summary.pings_delivered
    );
    describe_instance("local", &summary.local);
    if let Some(peer) = &summary.peer {
        describe_instance("peer", peer);
    }

    if let Some(path) = summary_json.as_ref() {
        write_summary(path, &summary)?;
    }
    Ok(())
}

pub fn strip(args: StripArgs) -> Result<()> {
    let source = fs::read_to_string(&args.script)
        .with_context(|| format!("reading script {}", args.script.display()))?;
    println!("{}", strip_comments(&source));
    Ok(())
}

fn settle(instance: &ScriptInstance) -> Result<()> {
    if !instance.wait_idle_timeout(BODY_TIMEOUT) {
        bail!(
            "script for {} did not finish a body within {BODY_TIMEOUT:?}",
            instance.participant().id
        );
    }
    Ok(())
}

fn describe_instance(label: &str, summary: &InstanceSummary) {
    println!(
        "  {label:<5} {}: load_error={} init={} tick={} render={} pings={}",
        summary.participant,
        summary.load_error,
        summary.init_instructions,
        summary.last_tick_instructions,
        summary.last_render_instructions,
        summary.registered_pings
    );
}

fn write_summary(path: &Path, summary: &SessionSummary) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let json =
        serde_json::to_string_pretty(summary).context("serializing session summary to JSON")?;
    fs::write(path, json)
        .with_context(|| format!("writing session summary to {}", path.display()))?;
    println!("Saved session summary to {}", path.display());
    Ok(())
}
