//! Per-link legacy pairing engine.
//!
//! Every link carries an [`EngineState`]. Links only record inbound events;
//! the work itself is done by the dispatcher, and only the link that holds
//! the [`SetupArena`](setup::SetupArena) may run pairing or re-encryption.

mod exchange;
mod initiator;
mod responder;
pub(crate) mod setup;

use bt_hci::param::ConnHandle;
use embassy_time::Instant;

use super::constants::{SMP_PDU_MAX, TIMEOUT};
use super::events::{PairingStatus, ReencryptionStatus, SecurityEvent};
use super::gateway::CryptoSource;
use super::store::DeviceStore;
use super::types::{AuthReq, Command, KeyDistributionFlags, KeypressAction, PairingFeatures, Reason};
use super::{EventSink, SecurityManager, Transport};
use crate::config::AUTH_REQ_MITM;
use crate::cursor::WriteCursor;
use crate::{Address, Error};

/// Link role, as seen by the security manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Role {
    /// Central: sends the Pairing Request and starts encryption
    Initiator,
    /// Peripheral: answers the Pairing Request and the LTK request
    Responder,
}

impl Role {
    pub(crate) fn idle_state(self) -> EngineState {
        match self {
            Role::Initiator => EngineState::InitiatorConnected,
            Role::Responder => EngineState::ResponderIdle,
        }
    }
}

/// Progress of the device store lookup for a peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IdentityLookup {
    /// Waiting for the resolver
    W4Ready,
    /// Lookup running
    Started,
    /// The peer is a bonded device
    Succeeded,
    /// The peer is not known
    Failed,
}

impl IdentityLookup {
    pub(crate) fn is_finished(self) -> bool {
        matches!(self, IdentityLookup::Succeeded | IdentityLookup::Failed)
    }
}

/// Authorization decided by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthorizationState {
    /// Not decided yet
    Unknown,
    /// Authorization granted
    Granted,
    /// Authorization declined
    Declined,
}

/// Security manager timer of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Timer {
    Stopped,
    /// Starts counting at the next poll
    Armed,
    Running(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum EngineState {
    /// No further SMP traffic is handled
    Timeout,
    SendPairingFailed(Reason),

    ResponderIdle,
    ResponderSendSecurityRequest,
    ResponderPh1W4PairingRequest,
    ResponderPh1PairingRequestReceived,
    ResponderPh1SendPairingResponse,
    ResponderPh1W4PairingConfirm,
    ResponderPh2W4PairingRandom,
    ResponderPh2W4LtkRequest,
    ResponderPh2SendLtkReply,
    ResponderPh0ReceivedLtkW4Irk,
    ResponderPh0ReceivedLtkRequest,
    ResponderPh0SendLtkNegativeReply,
    ResponderPh4YGetEnc,
    ResponderPh4YW4Enc,
    ResponderPh4LtkGetEnc,
    ResponderPh4LtkW4Enc,
    ResponderPh4SendLtkReply,

    InitiatorConnected,
    InitiatorPh4HasLtk,
    InitiatorPh1W2SendPairingRequest,
    InitiatorPh1W4PairingResponse,
    InitiatorPh2W4PairingConfirm,
    InitiatorPh2W4PairingRandom,
    InitiatorPh3SendStartEncryption,
    ReencryptionFailed,

    Ph1W4UserResponse,
    Ph1W2TkRandom,
    Ph1W4TkRandom,
    Ph2W2Random,
    Ph2W4Random,
    Ph2C1GetEncA,
    Ph2C1W4EncA,
    Ph2C1GetEncB,
    Ph2C1W4EncB,
    Ph2SendConfirm,
    Ph2C1GetEncC,
    Ph2C1W4EncC,
    Ph2C1GetEncD,
    Ph2C1W4EncD,
    Ph2CalcStk,
    Ph2W4Stk,
    Ph2SendPairingRandom,
    Ph2W4ConnectionEncrypted,
    Ph3W2Random,
    Ph3W4Random,
    Ph3YGetEnc,
    Ph3YW4Enc,
    Ph3LtkGetEnc,
    Ph3LtkW4Enc,
    Ph3CsrkGetEnc,
    Ph3CsrkW4Enc,
    Ph3Distribute,
    Ph3W4Keys,
    Ph4W4ConnectionEncrypted,
}

impl EngineState {
    /// Waiting for the pairing setup to become free.
    pub(crate) fn is_promotable(&self) -> bool {
        matches!(
            self,
            EngineState::ResponderPh1PairingRequestReceived
                | EngineState::ResponderPh0ReceivedLtkRequest
                | EngineState::InitiatorPh4HasLtk
                | EngineState::InitiatorPh1W2SendPairingRequest
        )
    }

    /// The next step starts a cipher or random request.
    pub(crate) fn needs_crypto(&self) -> bool {
        matches!(
            self,
            EngineState::Ph1W2TkRandom
                | EngineState::Ph2W2Random
                | EngineState::Ph2C1GetEncA
                | EngineState::Ph2C1GetEncB
                | EngineState::Ph2C1GetEncC
                | EngineState::Ph2C1GetEncD
                | EngineState::Ph2CalcStk
                | EngineState::Ph3W2Random
                | EngineState::Ph3YGetEnc
                | EngineState::Ph3LtkGetEnc
                | EngineState::Ph3CsrkGetEnc
                | EngineState::ResponderPh4YGetEnc
                | EngineState::ResponderPh4LtkGetEnc
        )
    }
}

/// Security state of one connection.
#[derive(Debug, Clone)]
pub(crate) struct LinkSecurity {
    pub(crate) handle: ConnHandle,
    pub(crate) role: Role,
    pub(crate) peer: Address,
    pub(crate) local: Address,
    pub(crate) state: EngineState,

    pub(crate) key_size: u8,
    pub(crate) authenticated: bool,
    pub(crate) authorization: AuthorizationState,
    pub(crate) encrypted: bool,

    pub(crate) lookup: IdentityLookup,
    /// Device store index of the peer
    pub(crate) index: Option<usize>,

    /// The application asked for security
    pub(crate) pairing_requested: bool,
    /// Security Request received from the peer
    pub(crate) security_request: Option<AuthReq>,
    /// Pairing Request waiting for the setup
    pub(crate) pairing_request: Option<PairingFeatures>,
    pub(crate) ltk_ediv: u16,
    pub(crate) ltk_rand: u64,

    pub(crate) timer: Timer,
    /// A pairing was started and not reported complete yet
    pub(crate) pairing_active: bool,
}

impl LinkSecurity {
    pub(crate) fn new(handle: ConnHandle, role: Role, local: Address, peer: Address) -> Self {
        Self {
            handle,
            role,
            peer,
            local,
            state: role.idle_state(),
            key_size: 0,
            authenticated: false,
            authorization: AuthorizationState::Unknown,
            encrypted: false,
            lookup: IdentityLookup::W4Ready,
            index: None,
            pairing_requested: false,
            security_request: None,
            pairing_request: None,
            ltk_ediv: 0,
            ltk_rand: 0,
            timer: Timer::Stopped,
            pairing_active: false,
        }
    }
}

/// A received SMP PDU with a valid opcode and length.
pub(crate) struct SmpPdu<'d> {
    pub(crate) command: Command,
    pub(crate) payload: &'d [u8],
}

impl<'d> SmpPdu<'d> {
    pub(crate) fn parse(data: &'d [u8]) -> Result<Self, Reason> {
        let (&opcode, payload) = data.split_first().ok_or(Reason::InvalidParameters)?;
        let command = Command::try_from(opcode).map_err(|_| Reason::CommandNotSupported)?;
        if matches!(command, Command::PairingPublicKey | Command::PairingDhKeyCheck) {
            return Err(Reason::CommandNotSupported);
        }
        if payload.len() != usize::from(command.payload_size()) {
            return Err(Reason::InvalidParameters);
        }
        Ok(Self { command, payload })
    }
}

impl<C, S, E, const LINKS: usize, const QUEUE: usize> SecurityManager<C, S, E, LINKS, QUEUE>
where
    C: CryptoSource + Transport,
    S: DeviceStore,
    E: EventSink,
{
    /// Handle an SMP PDU received on `handle`.
    pub fn handle_pdu(&mut self, handle: ConnHandle, data: &[u8]) -> Result<(), Error> {
        let idx = self.link_index(handle).ok_or(Error::NotFound)?;
        if self.links[idx].state == EngineState::Timeout {
            debug!("[smp] {:?} timed out, PDU ignored", handle);
            return Ok(());
        }
        let pdu = match SmpPdu::parse(data) {
            Ok(pdu) => pdu,
            Err(reason) => {
                warn!("[smp] {:?} invalid PDU: {}", handle, reason);
                self.fail(idx, reason);
                return Ok(());
            }
        };
        trace!("[smp] {:?} received {}", handle, pdu.command);
        match (pdu.command, self.links[idx].role) {
            (Command::PairingRequest, Role::Responder) => self.handle_pairing_request(idx, pdu.payload),
            (Command::PairingResponse, Role::Initiator) => self.handle_pairing_response(idx, pdu.payload),
            (Command::SecurityRequest, Role::Initiator) => self.handle_security_request(idx, pdu.payload),
            (Command::PairingConfirm, _) => self.handle_pairing_confirm(idx, pdu.payload),
            (Command::PairingRandom, _) => self.handle_pairing_random(idx, pdu.payload),
            (Command::PairingFailed, _) => {
                let reason = Reason::try_from(pdu.payload[0]).unwrap_or(Reason::UnspecifiedReason);
                self.peer_failed(idx, reason);
                Ok(())
            }
            (Command::KeypressNotification, _) => {
                match KeypressAction::try_from(pdu.payload[0]) {
                    Ok(action) => self.events.on_event(SecurityEvent::KeypressNotification { handle, action }),
                    Err(_) => debug!("[smp] {:?} unknown keypress notification", handle),
                }
                Ok(())
            }
            (
                Command::EncryptionInformation
                | Command::CentralIdentification
                | Command::IdentityInformation
                | Command::IdentityAddressInformation
                | Command::SigningInformation,
                _,
            ) => self.handle_key_pdu(idx, pdu.command, pdu.payload),
            (command, role) => {
                warn!("[smp] {:?} {} not supported as {:?}", handle, command, role);
                self.fail(idx, Reason::CommandNotSupported);
                Ok(())
            }
        }
    }

    /// The controller reported an encryption change on `handle`.
    pub fn handle_encryption_change(&mut self, handle: ConnHandle, success: bool) -> Result<(), Error> {
        let idx = self.link_index(handle).ok_or(Error::NotFound)?;
        let owner = self.arena.is_owner(handle);
        match self.links[idx].state {
            EngineState::Ph2W4ConnectionEncrypted if owner => {
                if !success {
                    self.fail(idx, Reason::UnspecifiedReason);
                    return Ok(());
                }
                let setup = &self.arena.setup;
                let link = &mut self.links[idx];
                link.encrypted = true;
                link.key_size = setup.key_size;
                link.authenticated = setup.authenticated;
                info!("[smp] {:?} encrypted with STK", handle);
                // the responder distributes first
                if link.role == Role::Initiator && !setup.expect.is_empty() {
                    link.state = EngineState::Ph3W4Keys;
                } else {
                    self.start_local_distribution(idx);
                }
            }
            EngineState::Ph4W4ConnectionEncrypted if owner => {
                let link = &mut self.links[idx];
                link.state = link.role.idle_state();
                self.arena.release(handle);
                if success {
                    link.encrypted = true;
                    info!("[smp] {:?} encrypted with stored LTK", handle);
                    self.events.on_event(SecurityEvent::ReencryptionComplete {
                        handle,
                        status: ReencryptionStatus::Success,
                    });
                } else {
                    warn!("[smp] {:?} encryption with stored LTK failed", handle);
                    self.events.on_event(SecurityEvent::ReencryptionComplete {
                        handle,
                        status: ReencryptionStatus::Failed,
                    });
                    if link.role == Role::Initiator {
                        link.state = EngineState::ReencryptionFailed;
                        self.events.on_event(SecurityEvent::BondLost { handle });
                    }
                }
            }
            _ => {
                if success {
                    self.links[idx].encrypted = true;
                }
            }
        }
        Ok(())
    }

    /// Serve a requested pairing, Security Request or LTK request once the
    /// peer lookup has finished.
    pub(crate) fn serve_deferred(&mut self, idx: usize) {
        let link = &mut self.links[idx];
        let handle = link.handle;
        match link.state {
            EngineState::ResponderPh0ReceivedLtkW4Irk => {
                if link.index.is_some() {
                    link.state = EngineState::ResponderPh0ReceivedLtkRequest;
                } else {
                    info!("[smp] {:?} LTK requested by unknown peer", handle);
                    link.state = EngineState::ResponderPh0SendLtkNegativeReply;
                    self.events.on_event(SecurityEvent::BondLost { handle });
                }
            }
            EngineState::ResponderIdle if link.pairing_requested => {
                link.pairing_requested = false;
                link.state = EngineState::ResponderSendSecurityRequest;
            }
            EngineState::InitiatorConnected | EngineState::ReencryptionFailed
                if link.pairing_requested || link.security_request.is_some() =>
            {
                let forced = link.state == EngineState::ReencryptionFailed;
                let mitm = link.security_request.is_some_and(|auth| auth.man_in_the_middle());
                link.pairing_requested = false;
                link.security_request = None;
                let stored = link
                    .index
                    .and_then(|index| self.store.encryption(index))
                    .filter(|info| info.has_ltk());
                link.state = match stored {
                    Some(info) if !forced && (!mitm || info.authenticated) => EngineState::InitiatorPh4HasLtk,
                    _ => EngineState::InitiatorPh1W2SendPairingRequest,
                };
            }
            _ => {}
        }
    }

    /// Hand the setup to the first link waiting for it.
    pub(crate) fn promote(&mut self) -> Result<bool, Error> {
        if self.arena.owner().is_some() {
            return Ok(false);
        }
        let Some(idx) = self.links.iter().position(|l| l.state.is_promotable()) else {
            return Ok(false);
        };
        let handle = self.links[idx].handle;
        self.arena.acquire(handle);
        match self.links[idx].state {
            EngineState::ResponderPh1PairingRequestReceived => self.start_responder_pairing(idx),
            EngineState::ResponderPh0ReceivedLtkRequest => self.start_responder_reencryption(idx),
            EngineState::InitiatorPh4HasLtk => self.start_initiator_reencryption(idx)?,
            EngineState::InitiatorPh1W2SendPairingRequest => self.start_initiator_pairing(idx)?,
            _ => {}
        }
        Ok(true)
    }

    /// Advance the link holding the setup by one step.
    pub(crate) fn active_step(&mut self) -> Result<bool, Error> {
        let Some(handle) = self.arena.owner() else {
            return Ok(false);
        };
        let Some(idx) = self.link_index(handle) else {
            self.arena.release(handle);
            return Ok(true);
        };
        let state = self.links[idx].state;
        if state.needs_crypto() {
            if self.gateway.is_busy() {
                return Ok(false);
            }
            self.crypto_step(idx, state)?;
            return Ok(true);
        }
        match state {
            EngineState::ResponderPh1SendPairingResponse => {
                let pres = self.arena.setup.pres;
                self.send(idx, Command::PairingResponse, &pres[1..])?;
                self.links[idx].state = EngineState::ResponderPh1W4PairingConfirm;
            }
            EngineState::Ph2SendConfirm => {
                let confirm = super::crypto::reversed(&self.arena.setup.local_confirm);
                self.send(idx, Command::PairingConfirm, &confirm)?;
                let link = &mut self.links[idx];
                link.state = match link.role {
                    Role::Initiator => EngineState::InitiatorPh2W4PairingConfirm,
                    Role::Responder => EngineState::ResponderPh2W4PairingRandom,
                };
            }
            EngineState::Ph2SendPairingRandom => {
                let random = super::crypto::reversed(&self.arena.setup.local_random);
                self.send(idx, Command::PairingRandom, &random)?;
                self.links[idx].state = EngineState::ResponderPh2W4LtkRequest;
            }
            EngineState::ResponderPh2SendLtkReply => {
                let stk = crate::LongTermKey::from_be_bytes(self.arena.setup.stk);
                self.controller.long_term_key_reply(handle, &stk)?;
                self.links[idx].state = EngineState::Ph2W4ConnectionEncrypted;
            }
            EngineState::InitiatorPh3SendStartEncryption => {
                let stk = crate::LongTermKey::from_be_bytes(self.arena.setup.stk);
                self.controller.start_encryption(handle, &stk, 0, 0)?;
                self.links[idx].state = EngineState::Ph2W4ConnectionEncrypted;
            }
            EngineState::ResponderPh4SendLtkReply => {
                let ltk = crate::LongTermKey::from_be_bytes(self.arena.setup.local_ltk);
                self.controller.long_term_key_reply(handle, &ltk)?;
                self.links[idx].state = EngineState::Ph4W4ConnectionEncrypted;
            }
            EngineState::Ph3Distribute => self.distribute_next(idx)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Answer to a [`SecurityEvent::JustWorksRequest`] or [`SecurityEvent::PassKeyInput`].
    pub(crate) fn user_response(&mut self, handle: ConnHandle, response: setup::UserResponse) -> Result<(), Error> {
        let idx = self.link_index(handle).ok_or(Error::NotFound)?;
        if !self.arena.is_owner(handle) || !self.arena.setup.waiting_for_user() {
            return Err(Error::InvalidState);
        }
        let setup = &mut self.arena.setup;
        match response {
            setup::UserResponse::Decline => {
                info!("[smp] {:?} pairing declined by user", handle);
                self.fail(idx, Reason::PasskeyEntryFailed);
                return Ok(());
            }
            setup::UserResponse::Passkey(passkey) if setup.method.is_passkey() => {
                setup.tk = super::crypto::tk_from_passkey(passkey);
            }
            setup::UserResponse::Confirm if !setup.method.is_passkey() => {}
            _ => return Err(Error::InvalidState),
        }
        setup.user_response = response;
        let link = &mut self.links[idx];
        if link.state == EngineState::Ph1W4UserResponse {
            link.state = EngineState::Ph2W2Random;
        }
        Ok(())
    }

    /// Send an SMP PDU, restarting a running timer.
    pub(crate) fn send(&mut self, idx: usize, command: Command, payload: &[u8]) -> Result<(), Error> {
        let mut buf = [0; SMP_PDU_MAX];
        let mut w = WriteCursor::new(&mut buf);
        w.write_u8(command.into())?;
        w.append(payload)?;
        let len = w.len();
        let link = &mut self.links[idx];
        trace!("[smp] {:?} sending {}", link.handle, command);
        self.controller.send_pdu(link.handle, &buf[..len])?;
        if link.timer != Timer::Stopped {
            link.timer = Timer::Running(self.now + TIMEOUT);
        }
        Ok(())
    }

    /// A pairing begins on the link: arm the timer and report it.
    ///
    /// Inbound events carry no clock, so the deadline is fixed by the next poll.
    pub(crate) fn start_pairing(&mut self, idx: usize) {
        let link = &mut self.links[idx];
        link.pairing_active = true;
        link.timer = Timer::Armed;
        info!("[smp] {:?} pairing started", link.handle);
        self.events.on_event(SecurityEvent::PairingStarted { handle: link.handle });
    }

    /// Abort the pairing on a link and tell the peer why.
    pub(crate) fn fail(&mut self, idx: usize, reason: Reason) {
        let link = &mut self.links[idx];
        let handle = link.handle;
        warn!("[smp] {:?} pairing failed: {}", handle, reason);
        link.timer = Timer::Stopped;
        link.state = EngineState::SendPairingFailed(reason);
        link.pairing_request = None;
        let active = core::mem::replace(&mut link.pairing_active, false);
        self.arena.release(handle);
        if active {
            self.events.on_event(SecurityEvent::PairingComplete {
                handle,
                status: PairingStatus::Failed(reason),
            });
        }
    }

    /// The peer aborted the pairing.
    fn peer_failed(&mut self, idx: usize, reason: Reason) {
        let link = &mut self.links[idx];
        let handle = link.handle;
        if !link.pairing_active && !self.arena.is_owner(handle) {
            debug!("[smp] {:?} Pairing Failed outside pairing, ignored", handle);
            return;
        }
        warn!("[smp] {:?} pairing failed by peer: {}", handle, reason);
        link.timer = Timer::Stopped;
        link.state = link.role.idle_state();
        link.pairing_request = None;
        let active = core::mem::replace(&mut link.pairing_active, false);
        self.arena.release(handle);
        if active {
            self.events.on_event(SecurityEvent::PairingComplete {
                handle,
                status: PairingStatus::Failed(reason),
            });
        }
    }

    /// AuthReq sent in our Pairing Request/Response and Security Request.
    pub(crate) fn local_auth_req(&self) -> u8 {
        self.config.auth_req & (0b11 | AUTH_REQ_MITM)
    }

    /// Our half of the Phase 1 feature exchange.
    pub(crate) fn local_features(&self, peer: &Address) -> PairingFeatures {
        let oob = self.config.oob_data.and_then(|hook| hook(peer)).is_some();
        let mut keys = KeyDistributionFlags::IDENTITY_KEY;
        if self.config.bonding() {
            keys |= KeyDistributionFlags::ENCRYPTION_KEY | KeyDistributionFlags::SIGNING_KEY;
        }
        PairingFeatures {
            io_capabilities: self.config.io_capabilities.into(),
            use_oob: oob.into(),
            security_properties: AuthReq::from(self.local_auth_req()),
            maximum_encryption_key_size: self.config.max_key_size(),
            initiator_key_distribution: KeyDistributionFlags::from(keys),
            responder_key_distribution: KeyDistributionFlags::from(keys),
        }
    }
}
