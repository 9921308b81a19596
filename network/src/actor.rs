//! The network actor (C9–C13 wired together): a single task driving a
//! libp2p `Swarm` over the pure registry/admission/discovery/propagation
//! decisions the rest of this crate models as plain data, generalized
//! from the node's existing libp2p-based P2P module onto the transport
//! and message vocabulary described in §6.
//!
//! Gossipsub carries broadcast-class traffic (`inv`, `tx`, block
//! announcements); the request-response behaviour carries point-to-point
//! pairs (`get_headers`/`headers`, `get_block`/`block`, `get_peers`/
//! `peers`). `mdns` supplements the configured bootstrap list with LAN
//! discovery, and `identify` reports each peer's listen addresses back
//! to it so dialled addresses are never just "the one we connected on".

use crate::admission::Admission;
use crate::config::NetworkParams;
use crate::dedup::DedupCache;
use crate::discovery::plan_tick;
use crate::peer::{PeerRecord, PeerRegistry};
use crate::propagation::{PeerEvent, PeerState};
use crate::sync::{select_best_header_chain, select_header_peers, validate_header_chain, BlockDownloadWindow, HeaderChainCandidate};
use crate::wire::{BlockHeader, InvKind, WireMessage, BLOCK_TOPIC, STATUS_TOPIC, SYNC_PROTOCOL, TX_TOPIC};
use core::{Block, WriterHandle};
use futures::StreamExt;
use libp2p::gossipsub::{self, IdentTopic};
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identify, mdns, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm};
use shared::{BlockHeight, Hash256, NodeError, WriteOutcome};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

const IDENTIFY_PROTOCOL: &str = "/aixon/identify/1";

/// How many blocks of overlap a header-sync request looks back from the
/// local tip, so a fork diverging just below it is still discoverable
/// from a single `GetHeaders` round-trip rather than only chains that
/// extend the tip directly (§4.12).
const HEADER_SYNC_REWIND: BlockHeight = 16;

/// Up to how many peers header sync requests a range from in parallel
/// (§4.12 "request contiguous header ranges from up to K peers").
const HEADER_SYNC_FANOUT: usize = 3;

/// In-progress chain sync state (§4.12). `Idle` outside a sync; at most
/// one sync runs at a time.
enum SyncPhase {
    Idle,
    /// Awaiting `Headers` responses from `awaiting`, anchored at
    /// `(overlap_height, overlap_hash)`.
    HeaderSync {
        overlap_height: BlockHeight,
        overlap_hash: Hash256,
        target_height: BlockHeight,
        awaiting: HashSet<PeerId>,
        candidates: Vec<HeaderChainCandidate>,
    },
    /// Downloading the winning candidate's blocks from `peer` via a
    /// bounded window; `assembled` accumulates the contiguous prefix as
    /// it drains, in order, ready to submit once the window completes.
    BlockDownload {
        peer: PeerId,
        window: BlockDownloadWindow,
        assembled: Vec<Block>,
    },
}

#[derive(NetworkBehaviour)]
struct NodeBehaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: mdns::tokio::Behaviour,
    sync: request_response::cbor::Behaviour<WireMessage, WireMessage>,
    identify: identify::Behaviour,
}

/// What the actor knows about a connection that the pure [`PeerRegistry`]
/// does not track: its libp2p identity and gossip/request-response state.
struct ConnectedPeer {
    state: PeerState,
}

/// Drives the swarm, translating libp2p events into updates on the pure
/// [`PeerRegistry`]/[`Admission`]/[`Propagation`]-style state and
/// forwarding accepted transactions and blocks to the chain's
/// [`WriterHandle`] (§4.9–§4.13).
pub struct NetworkActor {
    swarm: Swarm<NodeBehaviour>,
    registry: PeerRegistry,
    admission: Admission,
    dedup: DedupCache,
    params: NetworkParams,
    writer: WriterHandle,
    connected: HashMap<PeerId, ConnectedPeer>,
    network_id: u32,
    genesis_hash: Hash256,
    block_topic: IdentTopic,
    tx_topic: IdentTopic,
    status_topic: IdentTopic,
    /// Each pending request's peer (or, for block requests, the height it
    /// asked for) paired with the timestamp it was sent, so the matching
    /// response or failure can feed a round-trip time or a failure into
    /// `registry` (§4.9 "quality... monotonically derived from
    /// success/failure history").
    pending_handshake_requests: HashMap<OutboundRequestId, (PeerId, i64)>,
    pending_header_sync_requests: HashMap<OutboundRequestId, (PeerId, i64)>,
    pending_block_requests: HashMap<OutboundRequestId, (BlockHeight, i64)>,
    sync_phase: SyncPhase,
    sync_blocks: HashMap<BlockHeight, Block>,
}

impl NetworkActor {
    /// Builds the actor and binds its listen address. Does not dial
    /// bootstrap peers yet; call [`NetworkActor::dial_bootstrap`] once
    /// the caller is ready to start the event loop.
    ///
    /// # Errors
    /// `NetworkError` wrapped in `NodeError` if the transport, behaviour,
    /// or listen address cannot be constructed.
    pub fn new(
        params: NetworkParams,
        writer: WriterHandle,
        network_id: u32,
        genesis_hash: Hash256,
        bind_address: IpAddr,
        p2p_port: u16,
    ) -> Result<Self, NodeError> {
        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)
            .map_err(transport_err)?
            .with_dns()
            .map_err(transport_err)?
            .with_behaviour(|key| {
                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(10))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .build()
                    .expect("static gossipsub config is always valid");
                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )
                .expect("static gossipsub behaviour config is always valid");
                let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), key.public().to_peer_id())?;
                let sync = request_response::cbor::Behaviour::new(
                    [(StreamProtocol::new(SYNC_PROTOCOL), ProtocolSupport::Full)],
                    request_response::Config::default(),
                );
                let identify = identify::Behaviour::new(identify::Config::new(
                    IDENTIFY_PROTOCOL.to_string(),
                    key.public(),
                ));
                Ok(NodeBehaviour { gossipsub, mdns, sync, identify })
            })
            .map_err(transport_err)?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(900)))
            .build();

        for topic in [BLOCK_TOPIC, TX_TOPIC, STATUS_TOPIC] {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&IdentTopic::new(topic))
                .map_err(|e| transport_err(e.to_string()))?;
        }

        let listen_addr: Multiaddr =
            format!("/ip4/{bind_address}/tcp/{p2p_port}").parse().map_err(|e| transport_err(format!("{e}")))?;
        swarm.listen_on(listen_addr).map_err(|e| transport_err(e.to_string()))?;

        Ok(Self {
            swarm,
            registry: PeerRegistry::new(),
            admission: Admission::new(params.clone()),
            dedup: DedupCache::new(params.dedup_capacity),
            params,
            writer,
            connected: HashMap::new(),
            network_id,
            genesis_hash,
            block_topic: IdentTopic::new(BLOCK_TOPIC),
            tx_topic: IdentTopic::new(TX_TOPIC),
            status_topic: IdentTopic::new(STATUS_TOPIC),
            pending_handshake_requests: HashMap::new(),
            pending_header_sync_requests: HashMap::new(),
            pending_block_requests: HashMap::new(),
            sync_phase: SyncPhase::Idle,
            sync_blocks: HashMap::new(),
        })
    }

    /// Snapshot of every known peer record (§6 boundary contract
    /// `get_peers`). Cloned out so the caller cannot observe the actor's
    /// internal registry mutate out from under it.
    #[must_use]
    pub fn peers_snapshot(&self) -> Vec<PeerRecord> {
        self.registry.iter().cloned().collect()
    }

    /// Dials every bootstrap address, registering each as a trusted,
    /// never-evicted peer (§4.10 "bootstrap connection").
    pub fn dial_bootstrap(&mut self, bootstrap: &[Multiaddr]) {
        for addr in bootstrap {
            if let Some(ip) = multiaddr_ip(addr) {
                let url = addr.to_string();
                self.registry.insert(PeerRecord::new(url.clone(), ip, now(), true));
                self.admission.trust(url);
            }
            if let Err(e) = self.swarm.dial(addr.clone()) {
                tracing::warn!(error = %e, %addr, "failed to dial bootstrap peer");
            }
        }
    }

    /// Runs the event loop until `shutdown` resolves, then returns so the
    /// caller can drain any in-flight writes before exiting (§5
    /// "Cancellation & timeouts", §4.14).
    pub async fn run(mut self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        let mut discovery_tick = tokio::time::interval(self.params.discovery_interval());
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
                _ = discovery_tick.tick() => self.run_discovery_tick().await,
                _ = &mut shutdown => {
                    tracing::info!("network actor shutting down");
                    break;
                }
            }
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!(%address, "listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                self.on_connected(peer_id, endpoint.get_remote_address().clone()).await;
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                self.on_disconnected(peer_id);
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Discovered(found))) => {
                for (peer_id, addr) in found {
                    tracing::debug!(%peer_id, %addr, "mdns discovered peer");
                    let _ = self.swarm.dial(addr);
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Mdns(mdns::Event::Expired(expired))) => {
                for (peer_id, _) in expired {
                    self.on_disconnected(peer_id);
                }
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            })) => {
                self.on_gossip_message(propagation_source, &message.data).await;
            }
            SwarmEvent::Behaviour(NodeBehaviourEvent::Sync(request_response::Event::Message {
                peer,
                message,
            })) => match message {
                request_response::Message::Request { request, channel, .. } => {
                    self.on_sync_request(peer, request, channel).await;
                }
                request_response::Message::Response { request_id, response } => {
                    self.on_sync_response(peer, request_id, response).await;
                }
            },
            SwarmEvent::Behaviour(NodeBehaviourEvent::Sync(request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            })) => {
                self.on_sync_outbound_failure(peer, request_id, error).await;
            }
            _ => {}
        }
    }

    async fn on_connected(&mut self, peer_id: PeerId, addr: Multiaddr) {
        let url = peer_id.to_string();
        let ip = multiaddr_ip(&addr).unwrap_or(IpAddr::from([0, 0, 0, 0]));
        if self.registry.get(&url).is_none() {
            if self.admission.admit(&self.registry, ip, now(), None).is_err() {
                tracing::warn!(%peer_id, "rejecting connection: admission policy declined the peer");
                let _ = self.swarm.disconnect_peer_id(peer_id);
                return;
            }
            self.registry.insert(PeerRecord::new(url.clone(), ip, now(), false));
        }
        self.connected.insert(peer_id, ConnectedPeer { state: PeerState::Handshaking });
        let best_height = self.writer.get_stats().await.height;
        let handshake = WireMessage::Handshake {
            version: env!("CARGO_PKG_VERSION").to_string(),
            network_id: self.network_id,
            genesis_hash: self.genesis_hash,
            best_height,
            node_id: url,
        };
        let request_id = self.swarm.behaviour_mut().sync.send_request(&peer_id, handshake);
        self.pending_handshake_requests.insert(request_id, (peer_id, now()));
    }

    fn on_disconnected(&mut self, peer_id: PeerId) {
        self.connected.remove(&peer_id);
    }

    async fn on_gossip_message(&mut self, source: PeerId, data: &[u8]) {
        let url = source.to_string();
        if !self.admission.check_rate_limit(&url, now()) {
            self.ban_peer(source);
            return;
        }
        let Ok(msg) = serde_json::from_slice::<WireMessage>(data) else {
            tracing::warn!(%source, "received malformed gossip payload");
            return;
        };
        self.handle_inbound(source, msg).await;
    }

    async fn on_sync_request(&mut self, peer: PeerId, request: WireMessage, channel: ResponseChannel<WireMessage>) {
        let response = self.build_response(&request).await;
        self.handle_inbound(peer, request).await;
        if let Some(response) = response {
            let _ = self.swarm.behaviour_mut().sync.send_response(channel, response);
        }
    }

    /// Routes a request-response reply to whichever in-flight request it
    /// answers: a header-sync range, a block-sync download, or (the
    /// fallback) ordinary inbound handling for handshakes/peers/data.
    async fn on_sync_response(&mut self, peer: PeerId, request_id: OutboundRequestId, response: WireMessage) {
        let url = peer.to_string();
        if let Some((_, sent_at)) = self.pending_header_sync_requests.remove(&request_id) {
            self.registry.record_success(&url, rt_ms(sent_at), now());
            self.on_headers_candidate(peer, response).await;
            return;
        }
        if let Some((height, sent_at)) = self.pending_block_requests.remove(&request_id) {
            self.registry.record_success(&url, rt_ms(sent_at), now());
            self.on_block_response(peer, height, response).await;
            return;
        }
        if let Some((_, sent_at)) = self.pending_handshake_requests.remove(&request_id) {
            self.registry.record_success(&url, rt_ms(sent_at), now());
        }
        self.handle_inbound(peer, response).await;
    }

    /// Starts header sync against up to `HEADER_SYNC_FANOUT` peers once a
    /// handshake reveals a peer taller than the local tip (§4.12). A sync
    /// already in progress is left alone; the next announcement that
    /// still beats the local tip will retry once it finishes.
    async fn maybe_start_header_sync(&mut self, announced_height: BlockHeight) {
        if !matches!(self.sync_phase, SyncPhase::Idle) {
            return;
        }
        let local_height = self.writer.get_stats().await.height;
        if announced_height <= local_height {
            return;
        }

        let overlap_height = local_height.saturating_sub(HEADER_SYNC_REWIND);
        let Some(overlap_block) = self.writer.get_block_by_height(overlap_height).await else { return };
        let overlap_hash = overlap_block.hash();

        let candidate_urls = select_header_peers(&self.registry, HEADER_SYNC_FANOUT, now());
        let mut awaiting = HashSet::new();
        for url in &candidate_urls {
            let Ok(peer_id) = url.parse::<PeerId>() else { continue };
            if !self.connected.contains_key(&peer_id) {
                continue;
            }
            let request_id = self.swarm.behaviour_mut().sync.send_request(
                &peer_id,
                WireMessage::GetHeaders { from_height: overlap_height + 1, to_height: announced_height + 1 },
            );
            self.pending_header_sync_requests.insert(request_id, (peer_id, now()));
            awaiting.insert(peer_id);
        }
        if awaiting.is_empty() {
            return;
        }

        tracing::info!(local_height, announced_height, peers = awaiting.len(), "starting header sync");
        self.sync_phase =
            SyncPhase::HeaderSync { overlap_height, overlap_hash, target_height: announced_height, awaiting, candidates: Vec::new() };
    }

    /// Records one peer's offered header range and, once every requested
    /// peer has answered (or failed), picks the best candidate and moves
    /// to block download (§4.12 "pick the header chain with greatest
    /// cumulative work").
    async fn on_headers_candidate(&mut self, peer: PeerId, response: WireMessage) {
        let WireMessage::Headers { headers } = response else { return };
        let SyncPhase::HeaderSync { awaiting, candidates, .. } = &mut self.sync_phase else { return };
        awaiting.remove(&peer);
        candidates.push(HeaderChainCandidate { peer: peer.to_string(), headers });
        if awaiting.is_empty() {
            self.finalize_header_sync().await;
        }
    }

    /// Selects the winning header candidate (if any validates) and starts
    /// a bounded block-download window against its peer; otherwise drops
    /// back to idle so the next handshake can retry (§4.12).
    async fn finalize_header_sync(&mut self) {
        let SyncPhase::HeaderSync { overlap_height, overlap_hash, target_height, candidates, .. } =
            std::mem::replace(&mut self.sync_phase, SyncPhase::Idle)
        else {
            return;
        };

        // A candidate that fails to validate offered either a fork with
        // insufficient work or a chain that does not actually link to the
        // overlap point; either way the offering peer is penalized
        // (§4.12 "invalid candidates are dropped, their peer penalized").
        for candidate in &candidates {
            if validate_header_chain(&candidate.headers, overlap_hash, overlap_height).is_err() {
                self.registry.record_failure(&candidate.peer, now());
            }
        }

        let Some(best) = select_best_header_chain(&candidates, overlap_hash, overlap_height) else {
            tracing::debug!("no peer offered a valid header chain during sync");
            return;
        };
        let Ok(peer) = best.peer.parse::<PeerId>() else { return };
        let Some(last) = best.headers.last() else { return };

        let window = BlockDownloadWindow::new(
            overlap_height + 1,
            (last.index + 1).min(target_height + 1),
            self.params.max_inflight_blocks,
        );
        self.sync_phase = SyncPhase::BlockDownload { peer, window, assembled: Vec::new() };
        self.pump_block_download().await;
    }

    /// Issues `GetBlock` requests for every height the window's in-flight
    /// budget still allows (§4.12 "bounded in-flight windows").
    async fn pump_block_download(&mut self) {
        let peer = match &self.sync_phase {
            SyncPhase::BlockDownload { peer, .. } => *peer,
            _ => return,
        };
        let heights: Vec<BlockHeight> = match &mut self.sync_phase {
            SyncPhase::BlockDownload { window, .. } => std::iter::from_fn(|| window.schedule(peer.to_string())).collect(),
            _ => return,
        };
        for height in heights {
            let request_id =
                self.swarm.behaviour_mut().sync.send_request(&peer, WireMessage::GetBlock { height: Some(height), hash: None });
            self.pending_block_requests.insert(request_id, (height, now()));
        }
    }

    /// Handles the reply to one in-flight `GetBlock` request: a mismatch
    /// or missing block is treated the same as a failure and the height
    /// is re-requested elsewhere (§4.12).
    async fn on_block_response(&mut self, peer: PeerId, height: BlockHeight, response: WireMessage) {
        let WireMessage::BlockMsg { block } = response else {
            self.registry.record_failure(&peer.to_string(), now());
            self.on_block_download_failed(height).await;
            return;
        };
        if block.index != height {
            self.registry.record_failure(&peer.to_string(), now());
            self.on_block_download_failed(height).await;
            return;
        }
        self.on_sync_block_received(block).await;
    }

    async fn on_block_download_failed(&mut self, height: BlockHeight) {
        if let SyncPhase::BlockDownload { window, .. } = &mut self.sync_phase {
            window.on_failed(height);
        }
        self.pump_block_download().await;
    }

    /// Records a downloaded block, drains whatever contiguous prefix is
    /// now ready, and either requests more or finishes the sync once the
    /// window is complete (§4.12 "reassembled in order").
    async fn on_sync_block_received(&mut self, block: Block) {
        let height = block.index;
        let hash = block.hash();
        self.sync_blocks.insert(height, block);

        let drained = match &mut self.sync_phase {
            SyncPhase::BlockDownload { window, .. } => {
                window.on_received(height, hash);
                window.drain_contiguous()
            }
            _ => return,
        };
        if let SyncPhase::BlockDownload { assembled, .. } = &mut self.sync_phase {
            for (h, _) in &drained {
                if let Some(b) = self.sync_blocks.remove(h) {
                    assembled.push(b);
                }
            }
        }

        let complete = matches!(&self.sync_phase, SyncPhase::BlockDownload { window, .. } if window.is_complete());
        if complete {
            self.finish_block_download().await;
        } else {
            self.pump_block_download().await;
        }
    }

    /// Submits the fully assembled fork to the writer's `try_switch_to`
    /// path and returns to idle (§4.6, §4.12).
    async fn finish_block_download(&mut self) {
        let SyncPhase::BlockDownload { assembled, .. } = std::mem::replace(&mut self.sync_phase, SyncPhase::Idle) else {
            return;
        };
        self.sync_blocks.clear();
        if assembled.is_empty() {
            return;
        }
        let now_ts = now();
        match self.writer.submit_fork(assembled, now_ts).await {
            WriteOutcome::Accepted(tip_hash) => {
                tracing::info!(%tip_hash, "synced to a new best chain");
                self.dedup.insert(tip_hash);
                self.relay(&WireMessage::Inv { kind: InvKind::Block, hashes: vec![tip_hash] });
            }
            WriteOutcome::Rejected { reason } => {
                tracing::warn!(?reason, "downloaded fork was rejected");
            }
            WriteOutcome::TransientError { .. } => {
                tracing::warn!("transient error applying downloaded fork");
            }
        }
    }

    /// A failed outbound sync request: release its slot in whichever
    /// phase issued it and keep the sync moving (§4.12 "re-requested
    /// elsewhere").
    async fn on_sync_outbound_failure(&mut self, peer: PeerId, request_id: OutboundRequestId, error: request_response::OutboundFailure) {
        tracing::warn!(%peer, %error, "sync request failed");
        self.registry.record_failure(&peer.to_string(), now());
        if let Some((height, _)) = self.pending_block_requests.remove(&request_id) {
            self.on_block_download_failed(height).await;
            return;
        }
        if let SyncPhase::HeaderSync { awaiting, .. } = &mut self.sync_phase {
            awaiting.remove(&peer);
        }
        if self.pending_header_sync_requests.remove(&request_id).is_some() {
            let awaiting_empty = matches!(&self.sync_phase, SyncPhase::HeaderSync { awaiting, .. } if awaiting.is_empty());
            if awaiting_empty {
                self.finalize_header_sync().await;
            }
        }
        self.pending_handshake_requests.remove(&request_id);
    }

    /// Builds the reply to a request-response pair before also running it
    /// through the same inbound handling as a gossip message, so a peer's
    /// own submitted tx or block still gets applied (§6 wire protocol).
    async fn build_response(&self, request: &WireMessage) -> Option<WireMessage> {
        match request {
            WireMessage::Handshake { .. } => {
                let best_height = self.writer.get_stats().await.height;
                Some(WireMessage::Handshake {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    network_id: self.network_id,
                    genesis_hash: self.genesis_hash,
                    best_height,
                    node_id: self.swarm.local_peer_id().to_string(),
                })
            }
            WireMessage::GetHeaders { from_height, to_height } => {
                let headers = self.collect_headers(*from_height, *to_height).await;
                Some(WireMessage::Headers { headers })
            }
            WireMessage::GetBlock { height, hash } => {
                let block = if let Some(height) = height {
                    self.writer.get_block_by_height(*height).await
                } else if let Some(hash) = hash {
                    self.writer.get_block_by_hash(*hash).await
                } else {
                    None
                };
                block.map(|block| WireMessage::BlockMsg { block })
            }
            WireMessage::GetPeers => Some(WireMessage::Peers { urls: self.registry.iter().map(|p| p.url.clone()).collect() }),
            WireMessage::GetData { kind: InvKind::Tx, hashes } => {
                let mut out = Vec::new();
                for hash in hashes {
                    if let Some(tx) = self.writer.get_tx(*hash).await {
                        out.push(WireMessage::Tx { tx });
                    }
                }
                out.into_iter().next()
            }
            _ => None,
        }
    }

    async fn collect_headers(&self, from_height: BlockHeight, to_height: BlockHeight) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut height = from_height;
        while height < to_height {
            let Some(block) = self.writer.get_block_by_height(height).await else { break };
            headers.push(BlockHeader::from(&block));
            height += 1;
        }
        headers
    }

    /// Applies an inbound message's effect on chain/mempool state and
    /// relays it onward via gossipsub if it is new (§4.13 "inbound
    /// dedup... relay to every other connected peer").
    async fn handle_inbound(&mut self, source: PeerId, msg: WireMessage) {
        match msg {
            WireMessage::Handshake { network_id, genesis_hash, best_height, .. } => {
                if network_id != self.network_id || genesis_hash != self.genesis_hash {
                    tracing::warn!(%source, "handshake mismatch, disconnecting");
                    let _ = self.swarm.disconnect_peer_id(source);
                    return;
                }
                if let Some(peer) = self.connected.get_mut(&source) {
                    peer.state = peer.state.advance(PeerEvent::HandshakeOk);
                }
                self.registry.set_chain_height(&source.to_string(), best_height);
                self.maybe_start_header_sync(best_height).await;
            }
            WireMessage::Tx { tx } => {
                let txid = tx.txid();
                if self.dedup.insert(txid) {
                    let _ = self.writer.submit_tx(tx).await;
                    self.relay(&WireMessage::Inv { kind: InvKind::Tx, hashes: vec![txid] });
                }
            }
            WireMessage::BlockMsg { block } => {
                let hash = block.hash();
                if self.dedup.insert(hash) {
                    let now_ts = chrono::Utc::now().timestamp();
                    let _ = self.writer.submit_block_from_peer(block, now_ts).await;
                    self.relay(&WireMessage::Inv { kind: InvKind::Block, hashes: vec![hash] });
                }
            }
            WireMessage::Inv { hashes, .. } => {
                for hash in hashes {
                    self.dedup.insert(hash);
                }
            }
            WireMessage::AnnouncePeer { url } => {
                if let Ok(addr) = url.parse::<Multiaddr>() {
                    let _ = self.swarm.dial(addr);
                }
            }
            _ => {}
        }
    }

    /// Publishes `msg` on its gossipsub topic. Gossipsub's own mesh does
    /// not echo a message back to the peer it heard it from, so unlike
    /// the hand-rolled per-peer queue in `propagation.rs`, no explicit
    /// source exclusion is needed here.
    fn relay(&mut self, msg: &WireMessage) {
        let Ok(payload) = serde_json::to_vec(msg) else { return };
        let topic = match msg {
            WireMessage::Inv { kind: InvKind::Tx, .. } | WireMessage::Tx { .. } => &self.tx_topic,
            WireMessage::Inv { kind: InvKind::Block, .. } | WireMessage::BlockMsg { .. } => &self.block_topic,
            _ => &self.status_topic,
        };
        let _ = self.swarm.behaviour_mut().gossipsub.publish(topic.clone(), payload);
    }

    fn ban_peer(&mut self, peer_id: PeerId) {
        let url = peer_id.to_string();
        let ban_until = now() + self.admission.ban_duration_for(&url);
        self.registry.ban(&url, ban_until);
        self.admission.record_offense(&url);
        if let Some(peer) = self.connected.get_mut(&peer_id) {
            peer.state = peer.state.advance(PeerEvent::RateLimitOrInvalidData);
        }
        let _ = self.swarm.disconnect_peer_id(peer_id);
    }

    /// One discovery/admission housekeeping pass: evicts idle peers and
    /// tops up toward `target_peers` by dialing registry candidates
    /// (§4.10).
    async fn run_discovery_tick(&mut self) {
        let connected_urls: Vec<String> = self.connected.keys().map(PeerId::to_string).collect();
        let plan = plan_tick(&self.registry, &self.params, &connected_urls, now());
        for url in &plan.evict {
            if let Ok(peer_id) = url.parse::<PeerId>() {
                let _ = self.swarm.disconnect_peer_id(peer_id);
            }
        }
        for url in &plan.connect {
            if let Some(addr) = self.registry.get(url).map(|p| p.url.clone()) {
                if let Ok(multiaddr) = addr.parse::<Multiaddr>() {
                    let _ = self.swarm.dial(multiaddr);
                }
            }
        }
        if !plan.rebalance_subnets.is_empty() {
            tracing::debug!(subnets = ?plan.rebalance_subnets, "subnets over-represented among connected peers");
        }
    }
}

fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Round-trip time in milliseconds since `sent_at`, for
/// `PeerRegistry::record_success`'s latency average. `now()`'s
/// second-granularity clock floors anything under a second to 0, which
/// undercounts latency on a healthy LAN but still tracks peers that are
/// actually slow.
fn rt_ms(sent_at: i64) -> f64 {
    (now() - sent_at).max(0) as f64 * 1000.0
}

fn transport_err(e: impl std::fmt::Display) -> NodeError {
    NodeError::from(shared::ConfigError::Invalid { key: "network.transport", reason: e.to_string() })
}
