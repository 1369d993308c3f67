#![warn(missing_docs)]
//! # Bluetooth Security Manager
// ([Vol 3] Part H)
//!
//! [`SecurityManager`] owns the controller glue, the device store and the
//! event sink. Inbound events only record state; [`SecurityManager::poll`]
//! then advances the sub-machines one step at a time, in priority order:
//! derived keys, address update, CMAC, address resolution, simple link
//! replies, promotion of a waiting link, and the link holding the pairing setup.

mod address_update;
mod cmac;
pub(crate) mod constants;
mod crypto;
mod derived_keys;
mod events;
mod gateway;
mod pairing;
mod resolution;
mod store;
mod types;

use bt_hci::param::{BdAddr, ConnHandle};
pub use cmac::{CmacMessage, SignedWrite};
pub use constants::SIGNED_WRITE_MAX_PAYLOAD;
use embassy_time::Instant;
pub use events::{EventSink, PairingStatus, ReencryptionStatus, SecurityEvent};
pub use gateway::CryptoSource;
use heapless::Vec;
pub use pairing::{AuthorizationState, IdentityLookup, Role};
pub use store::{DeviceStore, IdentityInfo, MemoryStore};
pub use types::{KeypressAction, PassKey, Reason};

use self::address_update::AddressUpdate;
use self::cmac::CmacEngine;
use self::constants::TIMEOUT;
use self::derived_keys::DerivedKeys;
use self::gateway::{CryptoContext, CryptoGateway, RequestKind};
use self::pairing::setup::{SetupArena, UserResponse};
use self::pairing::{EngineState, LinkSecurity, Timer};
use self::resolution::{AddressResolution, ResolutionMode, Resolved};
use crate::{Address, Error, LongTermKey, SecurityConfig, SignatureKey};

/// Controller operations needed by the security manager.
pub trait Transport {
    /// Send an SMP PDU (opcode and parameters) on the LE security manager channel.
    fn send_pdu(&mut self, handle: ConnHandle, pdu: &[u8]) -> Result<(), Error>;
    /// Start encryption as initiator (HCI LE Enable Encryption).
    fn start_encryption(&mut self, handle: ConnHandle, ltk: &LongTermKey, ediv: u16, rand: u64) -> Result<(), Error>;
    /// Answer an LTK request (HCI LE Long Term Key Request Reply).
    fn long_term_key_reply(&mut self, handle: ConnHandle, ltk: &LongTermKey) -> Result<(), Error>;
    /// Reject an LTK request (HCI LE Long Term Key Request Negative Reply).
    fn long_term_key_negative_reply(&mut self, handle: ConnHandle) -> Result<(), Error>;
    /// Apply a new random device address.
    fn set_random_address(&mut self, address: BdAddr) -> Result<(), Error>;
}

/// Security manager serving up to `LINKS` connections, with a queue of
/// `QUEUE` pending address resolution requests.
pub struct SecurityManager<C, S, E, const LINKS: usize, const QUEUE: usize> {
    config: SecurityConfig,
    controller: C,
    store: S,
    events: E,
    gateway: CryptoGateway,
    keys: DerivedKeys,
    address: AddressUpdate,
    cmac: CmacEngine<SignedWrite>,
    resolution: AddressResolution<QUEUE>,
    links: Vec<LinkSecurity, LINKS>,
    arena: SetupArena,
    now: Instant,
}

impl<C, S, E, const LINKS: usize, const QUEUE: usize> SecurityManager<C, S, E, LINKS, QUEUE>
where
    C: CryptoSource + Transport,
    S: DeviceStore,
    E: EventSink,
{
    /// Create a security manager. Nothing happens until [`start`](Self::start).
    pub fn new(config: SecurityConfig, controller: C, store: S, events: E) -> Self {
        Self {
            keys: DerivedKeys::new(&config),
            address: AddressUpdate::new(&config),
            config,
            controller,
            store,
            events,
            gateway: CryptoGateway::default(),
            cmac: CmacEngine::new(),
            resolution: AddressResolution::new(),
            links: Vec::new(),
            arena: SetupArena::new(),
            now: Instant::from_ticks(0),
        }
    }

    /// The controller is ready: derive the local keys.
    pub fn start(&mut self) {
        info!("[security manager] starting");
        self.keys.start();
    }

    /// Have the local keys been derived?
    pub fn is_ready(&self) -> bool {
        self.keys.is_ready()
    }

    /// Configuration in use.
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Controller glue.
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Controller glue.
    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    /// Device store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Device store.
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Event sink.
    pub fn events(&self) -> &E {
        &self.events
    }

    /// Event sink.
    pub fn events_mut(&mut self) -> &mut E {
        &mut self.events
    }

    /// A connection was established.
    ///
    /// `local` and `peer` are the addresses used by the connection.
    pub fn link_up(&mut self, handle: ConnHandle, role: Role, local: Address, peer: Address) -> Result<(), Error> {
        if self.link_index(handle).is_some() {
            return Err(Error::InvalidState);
        }
        let mut link = LinkSecurity::new(handle, role, local, peer);
        if role == Role::Responder && self.config.request_security {
            link.pairing_requested = true;
        }
        info!("[security manager] link {:?} up as {:?}, peer {}", handle, role, peer);
        self.links.push(link).map_err(|_| Error::OutOfMemory)
    }

    /// A connection was closed.
    pub fn link_down(&mut self, handle: ConnHandle) {
        let Some(idx) = self.link_index(handle) else {
            return;
        };
        info!("[security manager] link {:?} down", handle);
        self.arena.release(handle);
        self.resolution.cancel(handle);
        self.links.swap_remove(idx);
    }

    /// Process timers, then advance until no sub-machine has work ready.
    pub fn poll(&mut self, now: Instant) -> Result<(), Error> {
        self.now = now;
        self.process_timers(now);
        while self.advance()? {}
        Ok(())
    }

    /// Perform at most one step of work. Returns `Ok(false)` when nothing is ready.
    ///
    /// Timers restarted here count from the instant of the last [`poll`](Self::poll).
    pub fn advance(&mut self) -> Result<bool, Error> {
        if !self.gateway.is_busy() && self.keys.step(&mut self.gateway, &mut self.controller)? {
            return Ok(true);
        }
        if !self.keys.is_ready() {
            return Ok(false);
        }

        if let Some(address) = self.address.take_address() {
            info!("[address update] new random address {:?}", address);
            self.controller.set_random_address(address)?;
            self.events.on_event(SecurityEvent::RandomAddressUpdated { address });
            return Ok(true);
        }
        if self.address.needs_crypto() && !self.gateway.is_busy() {
            let irk = self.keys.irk();
            return self.address.step(&mut self.gateway, &mut self.controller, &irk);
        }

        if !self.gateway.is_busy() && self.cmac.step(&mut self.gateway, &mut self.controller)? {
            return Ok(true);
        }

        if self.resolution_step()? {
            return Ok(true);
        }

        if self.basic_step()? {
            return Ok(true);
        }

        if self.promote()? {
            return Ok(true);
        }

        self.active_step()
    }

    /// Deliver the result of [`CryptoSource::start_encrypt`].
    pub fn handle_encrypt_result(&mut self, result: [u8; 16]) -> Result<(), Error> {
        let Some(context) = self.gateway.complete(RequestKind::Cipher) else {
            return Ok(());
        };
        match context {
            CryptoContext::DerivedKeys => {
                if self.keys.handle_result(&result) {
                    info!("[security manager] ready");
                    self.events.on_event(SecurityEvent::Ready);
                    self.address.start();
                }
            }
            CryptoContext::AddressUpdate => self.address.handle_cipher(&result),
            CryptoContext::Cmac => {
                if let Some(mac) = self.cmac.handle_result(&result) {
                    let mut signature = [0; 8];
                    signature.copy_from_slice(&mac[..8]);
                    self.events.on_event(SecurityEvent::SignatureComputed { signature });
                }
            }
            CryptoContext::Resolution => {
                if let Some(resolved) = self.resolution.handle_result(&result) {
                    self.resolution_done(resolved);
                }
            }
            CryptoContext::Link(handle) => match self.owned_link(handle) {
                Some(idx) => self.link_cipher_result(idx, &result),
                None => debug!("[security manager] cipher result for {:?} dropped", handle),
            },
        }
        Ok(())
    }

    /// Deliver the result of [`CryptoSource::start_random`], 16 octets.
    pub fn handle_random_result(&mut self, random: &[u8]) -> Result<(), Error> {
        if random.len() < 16 {
            return Err(Error::InvalidValue);
        }
        let Some(context) = self.gateway.complete(RequestKind::Random) else {
            return Ok(());
        };
        match context {
            CryptoContext::AddressUpdate => self.address.handle_random(random),
            CryptoContext::Link(handle) => match self.owned_link(handle) {
                Some(idx) => self.link_random_result(idx, random),
                None => debug!("[security manager] random for {:?} dropped", handle),
            },
            context => warn!("[security manager] random for {:?} dropped", context),
        }
        Ok(())
    }

    /// Ask for security on a link: pairing or encryption with a stored key
    /// as initiator, a Security Request as responder.
    pub fn request_pairing(&mut self, handle: ConnHandle) -> Result<(), Error> {
        let idx = self.link_index(handle).ok_or(Error::NotFound)?;
        let link = &mut self.links[idx];
        match (link.role, link.state) {
            (Role::Initiator, EngineState::ReencryptionFailed) => {
                link.pairing_requested = false;
                link.state = EngineState::InitiatorPh1W2SendPairingRequest;
            }
            (Role::Initiator, EngineState::InitiatorConnected)
            | (Role::Responder, EngineState::ResponderIdle) => {
                link.pairing_requested = true;
                if link.lookup.is_finished() {
                    self.serve_deferred(idx);
                }
            }
            (_, state) => {
                debug!("[security manager] pairing request ignored in {:?}", state);
            }
        }
        Ok(())
    }

    /// Accept Just Works pairing.
    pub fn just_works_confirm(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.user_response(handle, UserResponse::Confirm)
    }

    /// Passkey typed by the user.
    pub fn passkey_input(&mut self, handle: ConnHandle, passkey: u32) -> Result<(), Error> {
        if passkey > 999_999 {
            return Err(Error::InvalidValue);
        }
        self.user_response(handle, UserResponse::Passkey(passkey))
    }

    /// Reject the pairing the user was asked about.
    pub fn bonding_decline(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.user_response(handle, UserResponse::Decline)
    }

    /// Ask the application to authorize a link.
    pub fn request_authorization(&mut self, handle: ConnHandle) -> Result<(), Error> {
        let idx = self.link_index(handle).ok_or(Error::NotFound)?;
        match self.links[idx].authorization {
            AuthorizationState::Unknown => self.events.on_event(SecurityEvent::AuthorizationRequest { handle }),
            state => self.events.on_event(SecurityEvent::AuthorizationResult {
                handle,
                granted: state == AuthorizationState::Granted,
            }),
        }
        Ok(())
    }

    /// Authorize a link.
    pub fn authorization_grant(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.set_authorization(handle, AuthorizationState::Granted)
    }

    /// Refuse to authorize a link.
    pub fn authorization_decline(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.set_authorization(handle, AuthorizationState::Declined)
    }

    /// Sign `message` with `key`. The signature is delivered as
    /// [`SecurityEvent::SignatureComputed`].
    pub fn signed_write_start(&mut self, key: &SignatureKey, message: SignedWrite) -> Result<(), Error> {
        self.cmac.start(&key.to_be_bytes(), message)
    }

    /// Can a signature computation be started?
    pub fn cmac_ready(&self) -> bool {
        self.cmac.is_ready()
    }

    /// Queue a lookup of `address` in the device store. The result is
    /// delivered as an `IdentityResolving…` event.
    ///
    /// Returns [`Error::Busy`] when the address is already queued or the queue
    /// is full. Retry once a queued lookup completes.
    pub fn address_resolution_lookup(&mut self, address: Address) -> Result<(), Error> {
        self.resolution.enqueue(address)
    }

    /// Key size of an encrypted link, 0 if not encrypted.
    pub fn encryption_key_size(&self, handle: ConnHandle) -> Option<u8> {
        let link = self.link(handle)?;
        Some(if link.encrypted { link.key_size } else { 0 })
    }

    /// Is the link encrypted with an authenticated key?
    pub fn authenticated(&self, handle: ConnHandle) -> bool {
        self.link(handle).is_some_and(|l| l.encrypted && l.authenticated)
    }

    /// Authorization state of a link.
    pub fn authorization_state(&self, handle: ConnHandle) -> Option<AuthorizationState> {
        self.link(handle).map(|l| l.authorization)
    }

    /// Identity resolution state of a link.
    pub fn identity_lookup_state(&self, handle: ConnHandle) -> Option<IdentityLookup> {
        self.link(handle).map(|l| l.lookup)
    }

    /// Device store index of the peer, once resolved.
    pub fn device_index(&self, handle: ConnHandle) -> Option<usize> {
        self.link(handle).and_then(|l| l.index)
    }

    fn link(&self, handle: ConnHandle) -> Option<&LinkSecurity> {
        self.links.iter().find(|l| l.handle == handle)
    }

    fn link_index(&self, handle: ConnHandle) -> Option<usize> {
        self.links.iter().position(|l| l.handle == handle)
    }

    /// Index of the link if it holds the pairing setup.
    fn owned_link(&self, handle: ConnHandle) -> Option<usize> {
        if self.arena.is_owner(handle) {
            self.link_index(handle)
        } else {
            None
        }
    }

    fn set_authorization(&mut self, handle: ConnHandle, state: AuthorizationState) -> Result<(), Error> {
        let idx = self.link_index(handle).ok_or(Error::NotFound)?;
        let link = &mut self.links[idx];
        link.authorization = state;
        let granted = state == AuthorizationState::Granted;
        if let Some(index) = link.index {
            if let Some(mut info) = self.store.encryption(index) {
                info.authorized = granted;
                self.store.set_encryption(index, info)?;
            }
        }
        self.events.on_event(SecurityEvent::AuthorizationResult { handle, granted });
        Ok(())
    }

    fn process_timers(&mut self, now: Instant) {
        self.address.process_timer(now);
        for idx in 0..self.links.len() {
            match self.links[idx].timer {
                Timer::Armed => self.links[idx].timer = Timer::Running(now + TIMEOUT),
                Timer::Running(at) if now >= at => self.timeout(idx),
                _ => {}
            }
        }
    }

    fn timeout(&mut self, idx: usize) {
        let link = &mut self.links[idx];
        let handle = link.handle;
        warn!("[smp] {:?} pairing timed out", handle);
        link.state = EngineState::Timeout;
        link.timer = Timer::Stopped;
        let active = core::mem::replace(&mut link.pairing_active, false);
        self.arena.release(handle);
        if active {
            self.events.on_event(SecurityEvent::PairingComplete {
                handle,
                status: PairingStatus::Timeout,
            });
        }
    }

    /// Start lookups (links first), then run the current one.
    fn resolution_step(&mut self) -> Result<bool, Error> {
        if self.resolution.is_idle() {
            if let Some(link) = self.links.iter_mut().find(|l| l.lookup == IdentityLookup::W4Ready) {
                link.lookup = IdentityLookup::Started;
                let (handle, address) = (link.handle, link.peer);
                self.resolution.start(address, ResolutionMode::ForConnection(handle));
                self.events.on_event(SecurityEvent::IdentityResolvingStarted {
                    handle: Some(handle),
                    address,
                });
                return Ok(true);
            }
            if let Some(address) = self.resolution.dequeue() {
                self.resolution.start(address, ResolutionMode::General);
                self.events.on_event(SecurityEvent::IdentityResolvingStarted { handle: None, address });
                return Ok(true);
            }
            return Ok(false);
        }
        if self.resolution.is_waiting() || self.gateway.is_busy() {
            return Ok(false);
        }
        if let Some(resolved) = self.resolution.step(&mut self.gateway, &mut self.controller, &self.store)? {
            self.resolution_done(resolved);
        }
        Ok(true)
    }

    fn resolution_done(&mut self, resolved: Resolved) {
        let handle = match resolved.mode {
            ResolutionMode::ForConnection(handle) => Some(handle),
            ResolutionMode::General => None,
        };
        let address = resolved.address;
        self.events.on_event(match resolved.index {
            Some(index) => SecurityEvent::IdentityResolvingSucceeded { handle, address, index },
            None => SecurityEvent::IdentityResolvingFailed { handle, address },
        });
        let Some(idx) = handle.and_then(|h| self.link_index(h)) else {
            return;
        };
        let link = &mut self.links[idx];
        link.index = resolved.index;
        link.lookup = if resolved.index.is_some() {
            IdentityLookup::Succeeded
        } else {
            IdentityLookup::Failed
        };
        self.serve_deferred(idx);
    }

    /// Link actions that need neither the setup nor the crypto gateway.
    fn basic_step(&mut self) -> Result<bool, Error> {
        for idx in 0..self.links.len() {
            let (handle, role, state) = {
                let link = &self.links[idx];
                (link.handle, link.role, link.state)
            };
            match state {
                EngineState::SendPairingFailed(reason) => {
                    let next = role.idle_state();
                    self.send(idx, types::Command::PairingFailed, &[reason.into()])?;
                    self.links[idx].state = next;
                    return Ok(true);
                }
                EngineState::ResponderSendSecurityRequest => {
                    let auth_req = self.local_auth_req();
                    self.send(idx, types::Command::SecurityRequest, &[auth_req])?;
                    self.links[idx].state = EngineState::ResponderPh1W4PairingRequest;
                    return Ok(true);
                }
                EngineState::ResponderPh0SendLtkNegativeReply => {
                    self.controller.long_term_key_negative_reply(handle)?;
                    self.links[idx].state = EngineState::ResponderIdle;
                    return Ok(true);
                }
                _ => {}
            }
        }
        Ok(false)
    }
}
