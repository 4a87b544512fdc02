//! The per-participant protocol driver.
//!
//! A [`Validator`] owns the engine state for one participant and advances
//! it by reacting to messages on two bounded inbound channels: the
//! replicated on-chain channel (weights, commitments and proofs, nonce
//! commitments, withdrawal batches, partial signatures) and the private
//! off-chain channel (secret shares). Each channel is drained by one
//! long-lived receiver thread; a message whose precondition is not yet
//! satisfied is re-enqueued to self with a bounded backoff rather than
//! dropped, and a heartbeat is logged whenever a receiver has seen no
//! traffic for the configured interval.
//!
//! Phase transitions are monotonic and message-driven; the caller scripts
//! the phases by invoking the send routines. Once a participant is caught
//! cheating it stays flagged for the rest of the session, its messages are
//! ignored and its virtual keys leave the Lagrange basis.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand_core::{CryptoRng, RngCore};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use wsts_core::allocator::{allocate, KeyRange};
use wsts_core::keys::dkg::{self, round2 as dkg_round2};
use wsts_core::keys::{KeyPackage, PublicKeyPackage, SigningShare, VssCommitment};
use wsts_core::round1::{self, NonceCommitment, SigningCommitments, SigningNonces};
use wsts_core::round2::{
    aggregate, sign_weighted, verify_share_weighted, SignatureShare, SigningPackage,
};
use wsts_core::{KeyIndex, ParticipantId, Signature, VerifyingKey};

use crate::checkpoint::{
    assemble_next_checkpoint, CheckpointRecord, UtxoView, Withdrawal,
};
use crate::message::Message;
use crate::storage::{keys as store_keys, Namespace, Storage};
use crate::Error;

/// Driver configuration for one validator.
#[derive(Clone, Debug)]
pub struct Config {
    /// This validator's position.
    pub position: ParticipantId,
    /// Total participant count `P`.
    pub participants: u32,
    /// The secret polynomial degree `t`; signing requires `t + 1` honest
    /// virtual keys.
    pub threshold: u16,
    /// Total virtual key count `N`.
    pub max_keys: u64,
    /// The DKG context hash, fixed per deployment.
    pub context: [u8; 32],
    /// Gas fee deducted from the vault per checkpoint, in satoshis.
    pub gas_fee: u64,
    /// Bound of each inbound channel.
    pub channel_capacity: usize,
    /// Redelivery attempts before a too-early message is dropped.
    pub max_redelivery: u32,
    /// Base delay between redeliveries; grows linearly per attempt.
    pub redelivery_delay: Duration,
    /// Receiver keep-alive interval; a heartbeat is logged on expiry.
    pub heartbeat: Duration,
}

impl Config {
    /// A configuration with the default channel, redelivery, and
    /// keep-alive parameters.
    pub fn new(position: ParticipantId, participants: u32, threshold: u16, max_keys: u64) -> Self {
        Self {
            position,
            participants,
            threshold,
            max_keys,
            context: [0u8; 32],
            gas_fee: 1000,
            channel_capacity: 256,
            max_redelivery: 8,
            redelivery_delay: Duration::from_millis(50),
            heartbeat: Duration::from_secs(3),
        }
    }
}

/// The protocol phases, in order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Nothing exchanged yet.
    Init,
    /// Own weight announced.
    WeightsExchanged,
    /// Own polynomial commitments and proof broadcast.
    DkgCommitmentsSent,
    /// Own secret shares distributed.
    SharesDistributed,
    /// All shares verified, long-term keys derived.
    DkgComplete,
    /// Own nonce commitments broadcast.
    NoncesExchanged,
    /// A withdrawal batch is staged for the next checkpoint.
    WithdrawalsPending,
    /// Own partial signature produced and broadcast.
    PartialSigned,
    /// The aggregated signature is available.
    SignatureFinalized,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A message envelope carrying its redelivery count.
#[derive(Debug)]
struct Envelope {
    attempts: u32,
    bytes: Vec<u8>,
}

impl Envelope {
    fn fresh(bytes: Vec<u8>) -> Self {
        Self { attempts: 0, bytes }
    }
}

#[derive(Copy, Clone, Debug)]
enum Channel {
    OnChain,
    OffChain,
}

/// A peer's inbound endpoints: how this validator reaches one other
/// validator.
#[derive(Clone)]
pub struct PeerHandle {
    position: ParticipantId,
    on_chain: SyncSender<Envelope>,
    off_chain: SyncSender<Envelope>,
}

impl PeerHandle {
    /// The peer's position.
    pub fn position(&self) -> ParticipantId {
        self.position
    }

    /// Deliver a raw message on the peer's replicated channel.
    pub fn send_on_chain(&self, bytes: Vec<u8>) -> Result<(), Error> {
        self.on_chain
            .send(Envelope::fresh(bytes))
            .map_err(|_| Error::TransportClosed)
    }

    /// Deliver a raw message on the peer's private channel.
    pub fn send_off_chain(&self, bytes: Vec<u8>) -> Result<(), Error> {
        self.off_chain
            .send(Envelope::fresh(bytes))
            .map_err(|_| Error::TransportClosed)
    }
}

/// Mutable session state, serialized behind one lock and mutated only by
/// the receive loops and the caller-initiated send routines.
struct SessionState {
    phase: Phase,
    checkpoint_height: u64,
    dkg_round1_secret: Option<dkg::round1::SecretPackage>,
    dkg_round2_secret: Option<dkg_round2::SecretPackage>,
    commitments: BTreeMap<ParticipantId, VssCommitment>,
    key_package: Option<KeyPackage>,
    public_key_package: Option<PublicKeyPackage>,
    nonces: BTreeMap<u64, SigningNonces>,
    signing_packages: BTreeMap<u64, SigningPackage>,
    signature_shares: BTreeMap<u64, BTreeMap<ParticipantId, SignatureShare>>,
    final_signatures: BTreeMap<u64, Signature>,
    dishonest: BTreeSet<ParticipantId>,
    session_error: Option<String>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            phase: Phase::Init,
            checkpoint_height: 0,
            dkg_round1_secret: None,
            dkg_round2_secret: None,
            commitments: BTreeMap::new(),
            key_package: None,
            public_key_package: None,
            nonces: BTreeMap::new(),
            signing_packages: BTreeMap::new(),
            signature_shares: BTreeMap::new(),
            final_signatures: BTreeMap::new(),
            dishonest: BTreeSet::new(),
            session_error: None,
        }
    }

    fn advance(&mut self, phase: Phase, position: ParticipantId) {
        if phase > self.phase {
            debug!(
                position = position.get(),
                from = %self.phase,
                to = %phase,
                "phase transition"
            );
            self.phase = phase;
        }
    }

    fn honest_positions(&self, participants: u32) -> Vec<ParticipantId> {
        (1..=participants)
            .map(|p| ParticipantId::new(p).expect("positions start at 1"))
            .filter(|p| !self.dishonest.contains(p))
            .collect()
    }
}

struct Shared {
    config: Config,
    storage: Storage,
    utxo_view: Arc<dyn UtxoView>,
    state: Mutex<SessionState>,
    peers: Mutex<BTreeMap<ParticipantId, PeerHandle>>,
    on_chain_tx: SyncSender<Envelope>,
    off_chain_tx: SyncSender<Envelope>,
}

/// The receive-loop threads of one validator.
pub struct ValidatorThreads {
    on_chain: JoinHandle<()>,
    off_chain: JoinHandle<()>,
}

impl ValidatorThreads {
    /// Wait for both receive loops to exit (after a `Stop`).
    pub fn join(self) {
        let _ = self.on_chain.join();
        let _ = self.off_chain.join();
    }
}

/// One participant's protocol driver.
pub struct Validator {
    shared: Arc<Shared>,
    receivers: Mutex<Option<(Receiver<Envelope>, Receiver<Envelope>)>>,
}

impl Validator {
    /// Create a validator with its two bounded inbound channels.
    pub fn new(config: Config, storage: Storage, utxo_view: Arc<dyn UtxoView>) -> Self {
        let (on_chain_tx, on_chain_rx) = sync_channel(config.channel_capacity);
        let (off_chain_tx, off_chain_rx) = sync_channel(config.channel_capacity);

        let shared = Arc::new(Shared {
            config,
            storage,
            utxo_view,
            state: Mutex::new(SessionState::new()),
            peers: Mutex::new(BTreeMap::new()),
            on_chain_tx,
            off_chain_tx,
        });

        Self {
            shared,
            receivers: Mutex::new(Some((on_chain_rx, off_chain_rx))),
        }
    }

    /// This validator's inbound endpoints, to hand to its peers.
    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            position: self.shared.config.position,
            on_chain: self.shared.on_chain_tx.clone(),
            off_chain: self.shared.off_chain_tx.clone(),
        }
    }

    /// Register a peer. Self-handles are ignored.
    pub fn connect(&self, peer: PeerHandle) {
        if peer.position == self.shared.config.position {
            return;
        }
        let mut peers = self.shared.peers.lock().expect("peers lock poisoned");
        peers.insert(peer.position, peer);
    }

    /// Spawn the two receive loops. Can be done once per validator.
    pub fn spawn(&self) -> Result<ValidatorThreads, Error> {
        let (on_chain_rx, off_chain_rx) = self
            .receivers
            .lock()
            .expect("receiver lock poisoned")
            .take()
            .ok_or(Error::NotReady)?;

        let shared = Arc::clone(&self.shared);
        let on_chain = thread::spawn(move || run_receive_loop(shared, on_chain_rx, Channel::OnChain));
        let shared = Arc::clone(&self.shared);
        let off_chain =
            thread::spawn(move || run_receive_loop(shared, off_chain_rx, Channel::OffChain));

        Ok(ValidatorThreads { on_chain, off_chain })
    }

    /// Terminate both receive loops in-band.
    pub fn stop(&self) {
        let bytes = Message::Stop.serialize();
        let _ = self.shared.on_chain_tx.send(Envelope::fresh(bytes.clone()));
        let _ = self.shared.off_chain_tx.send(Envelope::fresh(bytes));
    }

    /// This validator's position.
    pub fn position(&self) -> ParticipantId {
        self.shared.config.position
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    /// Whether the signing session produced an aggregated signature.
    pub fn session_success(&self) -> bool {
        !self.state().final_signatures.is_empty()
    }

    /// The aggregated signature for a slot, once finalized.
    pub fn final_signature(&self, slot: u64) -> Option<Signature> {
        self.state().final_signatures.get(&slot).copied()
    }

    /// The group verifying key, once DKG is complete.
    pub fn group_verifying_key(&self) -> Option<VerifyingKey> {
        self.state()
            .key_package
            .as_ref()
            .map(|package| *package.verifying_key())
    }

    /// The terminal session error, if the session aborted.
    pub fn session_error(&self) -> Option<String> {
        self.state().session_error.clone()
    }

    /// The participants currently flagged as dishonest.
    pub fn dishonest(&self) -> BTreeSet<ParticipantId> {
        self.state().dishonest.clone()
    }

    /// The storage handle, shared with the validator.
    pub fn storage(&self) -> Storage {
        self.shared.storage.clone()
    }

    /// Flag a participant as dishonest for the rest of the session, e.g.
    /// after an operator decision that a peer has gone silent.
    pub fn mark_dishonest(&self, position: ParticipantId) {
        let mut state = self.state();
        warn!(
            position = self.shared.config.position.get(),
            dishonest = position.get(),
            "participant flagged dishonest"
        );
        state.dishonest.insert(position);
    }

    /// Seed the externally-created genesis checkpoint, making height 1 the
    /// next checkpoint to assemble.
    pub fn seed_genesis_checkpoint(&self, record: CheckpointRecord) {
        self.shared.storage.put(
            Namespace::Protocol,
            store_keys::checkpoint(0),
            record.serialize().to_vec(),
        );
        self.state().checkpoint_height = 1;
    }

    // Send routines, one per caller-scripted phase.

    /// Announce this validator's weight to every peer.
    pub fn send_vp_to_all(&self, weight: f64) -> Result<(), Error> {
        let position = self.shared.config.position;
        self.shared.storage.put(
            Namespace::Protocol,
            store_keys::vp(position.get()),
            weight.to_bits().to_be_bytes().to_vec(),
        );

        self.broadcast_on_chain(&Message::UpdateVp {
            source: position.get(),
            weight,
        })?;
        self.state().advance(Phase::WeightsExchanged, position);
        Ok(())
    }

    /// Run DKG part 1 and broadcast the commitment vector with its proof of
    /// knowledge.
    pub fn derive_and_send_proofs<R: RngCore + CryptoRng>(
        &self,
        rng: &mut R,
    ) -> Result<(), Error> {
        let config = &self.shared.config;
        let position = config.position;

        let (secret_package, package) = dkg::part1(
            position,
            config.threshold,
            config.max_keys,
            &config.context,
            rng,
        )?;

        let commitment_bytes = package.commitment().serialize()?;
        for (j, bytes) in commitment_bytes.iter().enumerate() {
            self.shared.storage.put(
                Namespace::Protocol,
                store_keys::poly_commitment(position.get(), j as u16),
                bytes.to_vec(),
            );
        }

        {
            let mut state = self.state();
            state
                .commitments
                .insert(position, package.commitment().clone());
            state.dkg_round1_secret = Some(secret_package);
        }

        self.broadcast_on_chain(&Message::UpdateProofs {
            source: position.get(),
            proof: package.proof_of_knowledge().serialize(),
            commitments: commitment_bytes,
        })?;
        self.state().advance(Phase::DkgCommitmentsSent, position);
        Ok(())
    }

    /// Derive the key ranges from the announced weights, run DKG part 2,
    /// and send every peer its private share batch.
    pub fn derive_and_send_secret_shares(&self) -> Result<(), Error> {
        let config = &self.shared.config;
        let position = config.position;

        // The latest announced weights decide how many keys everyone gets.
        let mut weights = Vec::with_capacity(config.participants as usize);
        for p in 1..=config.participants {
            let bytes = self
                .shared
                .storage
                .get(Namespace::Protocol, &store_keys::vp(p))
                .ok_or(Error::NotReady)?;
            let bits: [u8; 8] = bytes.as_slice().try_into().map_err(|_| Error::MalformedMessage)?;
            weights.push(f64::from_bits(u64::from_be_bytes(bits)));
        }
        let ranges = allocate(&weights, config.max_keys)?;
        for (p, range) in &ranges {
            self.shared.storage.put(
                Namespace::Protocol,
                store_keys::key_range(p.get()),
                range.serialize().to_vec(),
            );
        }
        debug!(
            position = position.get(),
            ?ranges,
            "derived virtual key ranges"
        );

        let secret_package = self
            .state()
            .dkg_round1_secret
            .take()
            .ok_or(Error::NotReady)?;
        let (round2_secret, mut packages) = dkg::part2(secret_package, &ranges)?;
        self.state().dkg_round2_secret = Some(round2_secret);

        // Own shares are stored directly rather than sent.
        let own_package = packages.remove(&position).expect("own range is allocated");
        for (key, share) in own_package.shares() {
            self.shared.storage.put(
                Namespace::Local,
                store_keys::secret_share(position.get(), key.get()),
                share.serialize().to_vec(),
            );
        }

        let peers = self.peers();
        for (recipient, package) in packages {
            let shares = package
                .shares()
                .iter()
                .map(|(key, share)| (key.get(), share.serialize()))
                .collect();
            let message = Message::SecretShares {
                source: position.get(),
                shares,
            };
            let peer = peers.get(&recipient).ok_or(Error::TransportClosed)?;
            peer.send_off_chain(message.serialize())?;
        }

        // Self-delivery runs the completeness check in case every peer's
        // shares already arrived before ours were stored.
        let trigger = Message::SecretShares {
            source: position.get(),
            shares: Vec::new(),
        };
        self.shared
            .off_chain_tx
            .send(Envelope::fresh(trigger.serialize()))
            .map_err(|_| Error::TransportClosed)?;

        self.state().advance(Phase::SharesDistributed, position);
        Ok(())
    }

    /// Generate nonce pairs for the given number of signing slots and
    /// broadcast the commitments.
    pub fn derive_and_send_nonces<R: RngCore + CryptoRng>(
        &self,
        slots: usize,
        rng: &mut R,
    ) -> Result<(), Error> {
        let position = self.shared.config.position;
        let (nonces, commitments) = round1::preprocess(slots, rng);

        let mut wire_commitments = Vec::with_capacity(slots);
        for (slot, slot_commitments) in commitments.iter().enumerate() {
            let hiding = slot_commitments.hiding().serialize()?;
            let binding = slot_commitments.binding().serialize()?;
            let mut bytes = Vec::with_capacity(66);
            bytes.extend_from_slice(&hiding);
            bytes.extend_from_slice(&binding);
            self.shared.storage.put(
                Namespace::Protocol,
                store_keys::nonce_commitments(slot as u64, position.get()),
                bytes,
            );
            wire_commitments.push((hiding, binding));
        }

        {
            let mut state = self.state();
            for (slot, slot_nonces) in nonces.into_iter().enumerate() {
                state.nonces.insert(slot as u64, slot_nonces);
            }
        }

        self.broadcast_on_chain(&Message::UpdateNonceCommitments {
            source: position.get(),
            commitments: wire_commitments,
        })?;
        self.state().advance(Phase::NoncesExchanged, position);
        Ok(())
    }

    /// Assemble the next checkpoint, compute the aggregate nonce for the
    /// slot, produce and self-verify this validator's weighted partial
    /// signature, and broadcast it.
    pub fn derive_tx_and_sign(&self, slot: u64) -> Result<(), Error> {
        let config = &self.shared.config;
        let position = config.position;

        let (key_package, public_key_package, honest) = {
            let state = self.state();
            (
                state.key_package.clone().ok_or(Error::NotReady)?,
                state.public_key_package.clone().ok_or(Error::NotReady)?,
                state.honest_positions(config.participants),
            )
        };

        let (_, sighash) = self.assemble_checkpoint(key_package.verifying_key())?;

        // The honest view for this slot: stored nonce commitments plus the
        // allocated ranges of every honest participant.
        let mut signing_commitments = BTreeMap::new();
        let mut key_ranges = BTreeMap::new();
        for p in &honest {
            let range_bytes = self
                .shared
                .storage
                .get(Namespace::Protocol, &store_keys::key_range(p.get()))
                .ok_or(Error::NotReady)?;
            let range_bytes: [u8; 16] =
                range_bytes.as_slice().try_into().map_err(|_| Error::MalformedMessage)?;
            key_ranges.insert(*p, KeyRange::deserialize(&range_bytes)?);

            let nonce_bytes = self
                .shared
                .storage
                .get(
                    Namespace::Protocol,
                    &store_keys::nonce_commitments(slot, p.get()),
                )
                .ok_or(Error::NotReady)?;
            if nonce_bytes.len() != 66 {
                return Err(Error::MalformedMessage);
            }
            let hiding =
                NonceCommitment::deserialize(&nonce_bytes[..33].try_into().expect("length checked"))?;
            let binding =
                NonceCommitment::deserialize(&nonce_bytes[33..].try_into().expect("length checked"))?;
            signing_commitments.insert(*p, SigningCommitments::new(hiding, binding));
        }

        let signing_package = SigningPackage::new(sighash, signing_commitments, key_ranges)?;

        // Persist the derived bound commitment shares R_i for the slot.
        for p in &honest {
            let share = signing_package.commitment_share(*p)?;
            self.shared.storage.put(
                Namespace::Protocol,
                store_keys::public_nonce_commitment(slot, p.get()),
                share.serialize()?.to_vec(),
            );
        }

        let mut state = self.state();
        // The slot's nonces are consumed here and destroyed, used or not.
        let mut nonces = state.nonces.remove(&slot).ok_or(Error::NotReady)?;
        let share = sign_weighted(&signing_package, &nonces, &key_package);
        nonces.zeroize();
        let share = share?;

        // Self-verification before broadcast: a partial that would not
        // convince peers is a bug worth failing loudly on.
        verify_share_weighted(position, &share, &signing_package, &public_key_package)?;

        self.shared.storage.put(
            Namespace::Protocol,
            store_keys::adapt_sig(slot, position.get()),
            share.serialize().to_vec(),
        );
        state.signing_packages.insert(slot, signing_package);
        state
            .signature_shares
            .entry(slot)
            .or_default()
            .insert(position, share);
        state.advance(Phase::PartialSigned, position);
        maybe_finalize(&self.shared, &mut state, slot);
        drop(state);

        self.broadcast_on_chain(&Message::UpdateAdaptSig {
            source: position.get(),
            slot,
            share: share.serialize(),
        })?;
        Ok(())
    }

    /// Assemble the next checkpoint transaction and sighash from the
    /// stored previous checkpoint and withdrawal batch.
    pub fn assemble_checkpoint(
        &self,
        group_key: &VerifyingKey,
    ) -> Result<(bitcoin::Transaction, [u8; 32]), Error> {
        let height = self.state().checkpoint_height;
        if height == 0 {
            return Err(Error::MissingCheckpoint { height: 0 });
        }
        let prev_bytes = self
            .shared
            .storage
            .get(Namespace::Protocol, &store_keys::checkpoint(height - 1))
            .ok_or(Error::MissingCheckpoint { height: height - 1 })?;
        let prev = CheckpointRecord::deserialize(&prev_bytes)?;

        let withdrawals = self
            .shared
            .storage
            .list_prefix(Namespace::Protocol, store_keys::TRANSACTIONS_PREFIX)
            .into_iter()
            .map(|(_, bytes)| Withdrawal::deserialize(&bytes))
            .collect::<Result<Vec<_>, Error>>()?;

        assemble_next_checkpoint(
            &prev,
            &*self.shared.utxo_view,
            &withdrawals,
            self.shared.config.gas_fee,
            group_key,
        )
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.shared.state.lock().expect("state lock poisoned")
    }

    fn peers(&self) -> BTreeMap<ParticipantId, PeerHandle> {
        self.shared.peers.lock().expect("peers lock poisoned").clone()
    }

    fn broadcast_on_chain(&self, message: &Message) -> Result<(), Error> {
        let bytes = message.serialize();
        for peer in self.peers().values() {
            peer.send_on_chain(bytes.clone())?;
        }
        Ok(())
    }
}

fn run_receive_loop(shared: Arc<Shared>, receiver: Receiver<Envelope>, channel: Channel) {
    let position = shared.config.position.get();
    loop {
        match receiver.recv_timeout(shared.config.heartbeat) {
            Ok(envelope) => {
                if handle_message(&shared, envelope, channel).is_break() {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                debug!(position, ?channel, "no new message; still alive");
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(position, ?channel, "receive loop stopped");
}

fn handle_message(shared: &Arc<Shared>, envelope: Envelope, channel: Channel) -> ControlFlow<()> {
    let position = shared.config.position.get();
    let message = match Message::deserialize(&envelope.bytes) {
        Ok(message) => message,
        Err(error) => {
            warn!(position, %error, "dropping undecodable message");
            return ControlFlow::Continue(());
        }
    };

    match (channel, message) {
        (_, Message::Stop) => return ControlFlow::Break(()),
        (Channel::OnChain, Message::UpdateVp { source, weight }) => {
            handle_update_vp(shared, source, weight);
        }
        (Channel::OnChain, Message::UpdateProofs { source, proof, commitments }) => {
            handle_update_proofs(shared, source, proof, commitments);
        }
        (Channel::OnChain, Message::UpdateNonceCommitments { source, commitments }) => {
            handle_nonce_commitments(shared, envelope, source, commitments);
        }
        (Channel::OnChain, Message::WithdrawBatch { withdrawals }) => {
            handle_withdraw_batch(shared, withdrawals);
        }
        (Channel::OnChain, Message::UpdateAdaptSig { source, slot, share }) => {
            handle_adapt_sig(shared, envelope, source, slot, share);
        }
        (Channel::OffChain, Message::SecretShares { source, shares }) => {
            handle_secret_shares(shared, envelope, source, shares);
        }
        (channel, message) => {
            warn!(
                position,
                ?channel,
                tag = message.tag(),
                "message arrived on the wrong channel"
            );
        }
    }
    ControlFlow::Continue(())
}

fn sender_position(shared: &Arc<Shared>, source: u32) -> Option<ParticipantId> {
    match ParticipantId::new(source) {
        Ok(position) if source <= shared.config.participants => Some(position),
        _ => {
            warn!(
                position = shared.config.position.get(),
                source, "message from unknown position"
            );
            None
        }
    }
}

fn reenqueue(shared: &Arc<Shared>, channel: Channel, envelope: Envelope, reason: &'static str) {
    let position = shared.config.position.get();
    if envelope.attempts >= shared.config.max_redelivery {
        warn!(
            position,
            reason,
            attempts = envelope.attempts,
            "dropping message: precondition still not met"
        );
        return;
    }

    debug!(position, reason, attempts = envelope.attempts, "re-enqueueing message");
    let sender = match channel {
        Channel::OnChain => shared.on_chain_tx.clone(),
        Channel::OffChain => shared.off_chain_tx.clone(),
    };
    let delay = shared.config.redelivery_delay * (envelope.attempts + 1);
    thread::spawn(move || {
        thread::sleep(delay);
        let _ = sender.send(Envelope {
            attempts: envelope.attempts + 1,
            bytes: envelope.bytes,
        });
    });
}

fn handle_update_vp(shared: &Arc<Shared>, source: u32, weight: f64) {
    if sender_position(shared, source).is_none() {
        return;
    }
    shared.storage.put(
        Namespace::Protocol,
        store_keys::vp(source),
        weight.to_bits().to_be_bytes().to_vec(),
    );
}

fn handle_update_proofs(
    shared: &Arc<Shared>,
    source: u32,
    proof: [u8; 64],
    commitments: Vec<[u8; 33]>,
) {
    let position = shared.config.position.get();
    let Some(sender) = sender_position(shared, source) else {
        return;
    };

    let mut state = shared.state.lock().expect("state lock poisoned");
    if state.dishonest.contains(&sender) {
        return;
    }

    let parsed = VssCommitment::deserialize(commitments.iter())
        .and_then(|commitment| Ok((Signature::deserialize(&proof)?, commitment)));
    let (proof, commitment) = match parsed {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(position, source, %error, "undecodable proof broadcast; flagging sender");
            state.dishonest.insert(sender);
            return;
        }
    };

    if let Err(error) =
        dkg::verify_proof_of_knowledge(sender, &shared.config.context, &commitment, &proof)
    {
        warn!(position, source, %error, "secret proof rejected; flagging sender");
        state.dishonest.insert(sender);
        return;
    }

    for (j, bytes) in commitments.iter().enumerate() {
        shared.storage.put(
            Namespace::Protocol,
            store_keys::poly_commitment(source, j as u16),
            bytes.to_vec(),
        );
    }
    state.commitments.insert(sender, commitment);
    debug!(position, source, "stored polynomial commitments");
}

fn handle_nonce_commitments(
    shared: &Arc<Shared>,
    envelope: Envelope,
    source: u32,
    commitments: Vec<([u8; 33], [u8; 33])>,
) {
    let position = shared.config.position.get();
    let Some(sender) = sender_position(shared, source) else {
        return;
    };

    {
        let state = shared.state.lock().expect("state lock poisoned");
        if state.dishonest.contains(&sender) {
            return;
        }
        // Nonces are only meaningful from a dealer whose proof checked out;
        // a reordered delivery gets another chance.
        if !state.commitments.contains_key(&sender) {
            drop(state);
            reenqueue(shared, Channel::OnChain, envelope, "proofs not yet verified");
            return;
        }
    }

    debug!(
        position,
        source,
        slots = commitments.len(),
        "storing nonce commitments"
    );
    for (slot, (hiding, binding)) in commitments.iter().enumerate() {
        let mut bytes = Vec::with_capacity(66);
        bytes.extend_from_slice(hiding);
        bytes.extend_from_slice(binding);
        shared.storage.put(
            Namespace::Protocol,
            store_keys::nonce_commitments(slot as u64, source),
            bytes,
        );
    }
}

fn handle_withdraw_batch(shared: &Arc<Shared>, withdrawals: Vec<Withdrawal>) {
    let position = shared.config.position.get();

    // Replace-by-batch: the newest broadcast batch wins wholesale.
    shared
        .storage
        .remove_prefix(Namespace::Protocol, store_keys::TRANSACTIONS_PREFIX);
    for (index, withdrawal) in withdrawals.iter().enumerate() {
        shared.storage.put(
            Namespace::Protocol,
            store_keys::transaction(index as u32),
            withdrawal.serialize(),
        );
    }
    debug!(position, count = withdrawals.len(), "stored withdrawal batch");

    let mut state = shared.state.lock().expect("state lock poisoned");
    if state.phase >= Phase::NoncesExchanged {
        state.advance(Phase::WithdrawalsPending, shared.config.position);
    }
}

fn handle_adapt_sig(
    shared: &Arc<Shared>,
    envelope: Envelope,
    source: u32,
    slot: u64,
    share: [u8; 64],
) {
    let position = shared.config.position.get();
    let Some(sender) = sender_position(shared, source) else {
        return;
    };

    let mut state = shared.state.lock().expect("state lock poisoned");
    if state.dishonest.contains(&sender) {
        return;
    }

    // Partial signatures can outrun the nonce round; without the aggregate
    // nonce there is nothing to verify against yet.
    let Some(signing_package) = state.signing_packages.get(&slot).cloned() else {
        drop(state);
        reenqueue(shared, Channel::OnChain, envelope, "aggregate nonce not yet derived");
        return;
    };
    let Some(public_key_package) = state.public_key_package.clone() else {
        drop(state);
        reenqueue(shared, Channel::OnChain, envelope, "key derivation incomplete");
        return;
    };

    let share = match SignatureShare::deserialize(&share) {
        Ok(share) => share,
        Err(error) => {
            warn!(position, source, %error, "undecodable partial signature; flagging sender");
            state.dishonest.insert(sender);
            return;
        }
    };

    if let Err(error) =
        verify_share_weighted(sender, &share, &signing_package, &public_key_package)
    {
        warn!(position, source, %error, "partial signature rejected; flagging sender");
        state.dishonest.insert(sender);
        return;
    }

    shared.storage.put(
        Namespace::Protocol,
        store_keys::adapt_sig(slot, source),
        share.serialize().to_vec(),
    );
    state
        .signature_shares
        .entry(slot)
        .or_default()
        .insert(sender, share);
    debug!(position, source, slot, "stored partial signature");

    maybe_finalize(shared, &mut state, slot);
}

/// Aggregate once every currently-honest participant's partial signature
/// for the slot has been stored.
fn maybe_finalize(shared: &Arc<Shared>, state: &mut SessionState, slot: u64) {
    let position = shared.config.position;

    let Some(signing_package) = state.signing_packages.get(&slot).cloned() else {
        return;
    };
    let Some(public_key_package) = state.public_key_package.clone() else {
        return;
    };
    let Some(shares) = state.signature_shares.get(&slot) else {
        return;
    };

    let honest = state.honest_positions(shared.config.participants);
    if shares.len() < honest.len() || state.final_signatures.contains_key(&slot) {
        return;
    }

    match aggregate(&signing_package, shares, &public_key_package) {
        Ok(signature) => {
            info!(
                position = position.get(),
                slot,
                "aggregated signature finalized"
            );
            state.final_signatures.insert(slot, signature);
            state.advance(Phase::SignatureFinalized, position);
        }
        Err(error) => {
            warn!(position = position.get(), slot, %error, "aggregation failed; session aborted");
            state.session_error = Some(error.to_string());
        }
    }
}

fn handle_secret_shares(
    shared: &Arc<Shared>,
    envelope: Envelope,
    source: u32,
    shares: Vec<(u64, [u8; 32])>,
) {
    let config = &shared.config;
    let position = config.position;
    let Some(sender) = sender_position(shared, source) else {
        return;
    };

    // Shares can arrive before this validator has derived the key ranges.
    let Some(range_bytes) = shared
        .storage
        .get(Namespace::Protocol, &store_keys::key_range(position.get()))
    else {
        reenqueue(shared, Channel::OffChain, envelope, "key range not yet derived");
        return;
    };
    let Ok(range_bytes) = <[u8; 16]>::try_from(range_bytes.as_slice()) else {
        warn!(position = position.get(), "corrupt key range record");
        return;
    };
    let Ok(own_range) = KeyRange::deserialize(&range_bytes) else {
        warn!(position = position.get(), "corrupt key range record");
        return;
    };

    for (key, share) in &shares {
        let in_range = KeyIndex::new(*key)
            .map(|key| own_range.contains(key))
            .unwrap_or(false);
        if !in_range {
            // Never store a foreign share; just log the offense.
            let error = Error::ShareOutOfRange {
                participant: source,
                key: *key,
            };
            warn!(position = position.get(), %error, "dropping share");
            continue;
        }
        shared.storage.put(
            Namespace::Local,
            store_keys::secret_share(source, *key),
            share.to_vec(),
        );
    }
    debug!(
        position = position.get(),
        source = sender.get(),
        count = shares.len(),
        "processed share batch"
    );

    // Completeness: one share per owned key from each of the P dealers.
    let expected = own_range.len() * config.participants as u64;
    let stored = shared
        .storage
        .count_prefix(Namespace::Local, store_keys::SECRET_SHARES_PREFIX) as u64;
    if stored < expected {
        debug!(
            position = position.get(),
            missing = expected - stored,
            "waiting for more shares"
        );
        return;
    }

    let mut state = shared.state.lock().expect("state lock poisoned");
    if state.key_package.is_some() {
        return;
    }
    if state.commitments.len() < config.participants as usize {
        drop(state);
        reenqueue(shared, Channel::OffChain, envelope, "commitments incomplete");
        return;
    }
    finish_dkg(shared, &mut state, own_range);
}

/// Batch-verify all received shares, derive the long-term and public
/// signing shares, and settle the group key. Dealers caught distributing
/// inconsistent shares are excluded and the derivation re-runs with the
/// remaining contributions.
fn finish_dkg(shared: &Arc<Shared>, state: &mut SessionState, own_range: KeyRange) {
    let config = &shared.config;
    let position = config.position;

    let Some(round2_secret) = state.dkg_round2_secret.clone() else {
        warn!(position = position.get(), "shares complete but round 2 state is missing");
        return;
    };

    // Rebuild the per-dealer packages from the persisted shares.
    let mut received: BTreeMap<ParticipantId, dkg_round2::Package> = BTreeMap::new();
    for source in 1..=config.participants {
        let dealer = ParticipantId::new(source).expect("positions start at 1");
        let mut dealer_shares = BTreeMap::new();
        for key in own_range.iter() {
            let Some(bytes) = shared
                .storage
                .get(Namespace::Local, &store_keys::secret_share(source, key.get()))
            else {
                warn!(
                    position = position.get(),
                    source, "share accounting mismatch; aborting derivation"
                );
                return;
            };
            let Ok(bytes) = <[u8; 32]>::try_from(bytes.as_slice()) else {
                warn!(position = position.get(), source, "corrupt stored share");
                return;
            };
            let share = match SigningShare::deserialize(&bytes) {
                Ok(share) => share,
                Err(error) => {
                    warn!(position = position.get(), source, %error, "corrupt stored share");
                    return;
                }
            };
            dealer_shares.insert(key, share);
        }
        received.insert(dealer, dkg_round2::Package::new(dealer_shares));
    }

    loop {
        let commitments: BTreeMap<ParticipantId, VssCommitment> = state
            .commitments
            .iter()
            .filter(|(p, _)| !state.dishonest.contains(p))
            .map(|(p, c)| (*p, c.clone()))
            .collect();
        let contributions: BTreeMap<ParticipantId, dkg_round2::Package> = received
            .iter()
            .filter(|(p, _)| !state.dishonest.contains(p))
            .map(|(p, c)| (*p, c.clone()))
            .collect();

        match dkg::part3(&round2_secret, &commitments, &contributions) {
            Ok((key_package, public_key_package)) => {
                for (key, share) in key_package.signing_shares() {
                    shared.storage.put(
                        Namespace::Local,
                        store_keys::long_term_share(key.get()),
                        share.serialize().to_vec(),
                    );
                }
                // The per-dealer shares have served their purpose.
                shared
                    .storage
                    .remove_prefix(Namespace::Local, store_keys::SECRET_SHARES_PREFIX);

                info!(
                    position = position.get(),
                    group_key = ?key_package.verifying_key(),
                    "DKG complete"
                );
                state.key_package = Some(key_package);
                state.public_key_package = Some(public_key_package);
                state.advance(Phase::DkgComplete, position);
                return;
            }
            Err(wsts_core::Error::InvalidSecretShare { culprit }) => {
                warn!(
                    position = position.get(),
                    culprit = culprit.get(),
                    "share batch verification failed; excluding dealer and retrying"
                );
                state.dishonest.insert(culprit);
            }
            Err(error) => {
                warn!(position = position.get(), %error, "key derivation failed");
                state.session_error = Some(error.to_string());
                return;
            }
        }
    }
}
