use std::collections::VecDeque;
use std::sync::Mutex;

use avatar_wire::{
    decode_envelope, decode_payload, encode_batch, encode_message, Hello, MessageKind, PingBatch,
    ProtocolError, WirePing,
};

use crate::instance::PingInbox;
use crate::lock;
use crate::participant::Participant;
use crate::pings::{Ping, PingTransport};

/// In-process transport: frames every batch with the wire codec and
/// delivers it on [`LoopbackTransport::pump`] to the peer copies of the
/// sender's script.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    frames: Mutex<VecDeque<Vec<u8>>>,
    peers: Mutex<Vec<PingInbox>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a peer copy. It receives batches sent by the participant it runs for.
    pub fn subscribe(&self, inbox: PingInbox) -> Result<(), ProtocolError> {
        let hello = encode_message(MessageKind::Hello, &Hello::new(inbox.participant_id()))?;
        lock(&self.frames).push_back(hello);
        lock(&self.peers).push(inbox);
        Ok(())
    }

    pub fn pending_frames(&self) -> usize {
        lock(&self.frames).len()
    }

    /// Decodes every queued frame and routes its pings. Returns how many
    /// pings were handed to inboxes.
    pub fn pump(&self) -> Result<usize, ProtocolError> {
        let frames = std::mem::take(&mut *lock(&self.frames));
        let mut delivered = 0;
        for frame in frames {
            let (header, payload) = decode_envelope(&frame)?;
            match header.kind {
                MessageKind::Hello => {
                    let hello: Hello = decode_payload(payload)?;
                    log::debug!(
                        "[avatar_script] peer copy for {} joined ({})",
                        hello.participant,
                        hello.protocol
                    );
                }
                MessageKind::PingBatch => {
                    let batch: PingBatch = decode_payload(payload)?;
                    delivered += self.route(batch);
                }
            }
        }
        Ok(delivered)
    }

    fn route(&self, batch: PingBatch) -> usize {
        let peers = lock(&self.peers);
        let mut delivered = 0;
        for inbox in peers
            .iter()
            .filter(|inbox| inbox.participant_id() == batch.sender)
        {
            for ping in &batch.pings {
                let ping = Ping::from(ping.clone());
                inbox.submit(ping.id, ping.payload);
                delivered += 1;
            }
        }
        delivered
    }
}

impl PingTransport for LoopbackTransport {
    fn send_batch(&self, sender: &Participant, batch: Vec<Ping>) {
        let batch = PingBatch {
            sender: sender.id.clone(),
            pings: batch.into_iter().map(WirePing::from).collect(),
        };
        match encode_batch(&batch) {
            Ok(frame) => lock(&self.frames).push_back(frame),
            Err(err) => log::error!(
                "[avatar_script] failed to frame {} pings from {}: {err}",
                batch.pings.len(),
                sender.id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::LoggingConfig;
    use crate::diagnostics::RecordingSink;
    use crate::events::EventCatalog;
    use crate::instance::{HostServices, ScriptInstance};
    use crate::trust::TrustConfig;

    const WAIT: Duration = Duration::from_secs(10);
    const SCRIPT: &str = r#"
        heard = {}
        function wave(speed)
            table.insert(heard, speed)
            log("wave " .. speed)
        end
        pings.register("wave")
        sent = false
        function tick()
            if not sent then
                pings.send("wave", 3)
                sent = true
            end
        end
    "#;

    fn services(transport: &Arc<LoopbackTransport>, sink: &RecordingSink) -> HostServices {
        HostServices {
            trust: Arc::new(TrustConfig::default()),
            transport: transport.clone(),
            sink: Arc::new(sink.clone()),
            logging: LoggingConfig {
                log_others: true,
                ..LoggingConfig::default()
            },
            catalog: EventCatalog::standard(),
        }
    }

    #[test]
    fn batches_cross_the_wire_to_peer_copies() {
        let transport = Arc::new(LoopbackTransport::new());
        let local_sink = RecordingSink::new();
        let peer_sink = RecordingSink::new();
        let local = ScriptInstance::load(
            Participant::local("owner", "Owner"),
            SCRIPT,
            services(&transport, &local_sink),
        )
        .expect("local worker");
        let peer = ScriptInstance::load(
            Participant::remote("owner", "Owner"),
            SCRIPT,
            services(&transport, &peer_sink),
        )
        .expect("peer worker");
        assert!(local.wait_idle_timeout(WAIT));
        assert!(peer.wait_idle_timeout(WAIT));
        transport.subscribe(peer.inbox()).expect("hello frames");

        assert!(local.tick());
        assert!(local.wait_idle_timeout(WAIT));
        assert_eq!(transport.pending_frames(), 2);
        assert_eq!(transport.pump().expect("frames decode"), 1);

        assert!(peer.tick());
        assert!(peer.wait_idle_timeout(WAIT));
        assert!(peer_sink
            .plain_lines()
            .contains(&"[lua] Owner > wave 3".to_string()));
        assert!(local_sink.plain_lines().is_empty());
        assert!(!peer.load_error());
    }

    #[test]
    fn corrupt_frames_surface_protocol_errors() {
        let transport = LoopbackTransport::new();
        lock(&transport.frames).push_back(b"nope".to_vec());
        assert!(matches!(
            transport.pump(),
            Err(ProtocolError::TruncatedHeader)
        ));
    }
}
