//! Phases shared by both roles: method selection, confirm and random
//! exchange, STK generation, key distribution and bonding.

use super::setup::{local_inputs, Negotiated, PairingMethod, UserResponse};
use super::{EngineState, Role, SecurityManager, Timer};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::security_manager::crypto::{
    c1_p1, c1_p2, d1_block, dm_block, dm_result, passkey_from_random, reversed, s1_block, tk_from_passkey, truncate,
    xor, Block,
};
use crate::security_manager::events::{PairingStatus, SecurityEvent};
use crate::security_manager::gateway::{CryptoContext, CryptoSource};
use crate::security_manager::store::DeviceStore;
use crate::security_manager::types::{Command, KeySet, PassKey, Reason};
use crate::security_manager::{EventSink, Transport};
use crate::{Address, EncryptionInformation, Error, IdentityResolvingKey, SignatureKey};

/// Crypto operation requested by a link step.
enum Request {
    Random,
    Cipher { key: Block, plaintext: Block },
}

impl<C, S, E, const LINKS: usize, const QUEUE: usize> SecurityManager<C, S, E, LINKS, QUEUE>
where
    C: CryptoSource + Transport,
    S: DeviceStore,
    E: EventSink,
{
    /// Record the negotiated method and ask the user whatever it needs.
    pub(super) fn select_method(&mut self, idx: usize, negotiated: Negotiated, bonding: bool) {
        let (handle, role, peer) = {
            let link = &self.links[idx];
            (link.handle, link.role, link.peer)
        };
        let method = negotiated.method;
        info!(
            "[smp legacy] {:?} method {:?}, key size {}, bonding {}",
            handle, method, negotiated.key_size, bonding
        );
        let setup = &mut self.arena.setup;
        setup.method = method;
        setup.key_size = negotiated.key_size;
        setup.authenticated = method != PairingMethod::JustWorks;
        setup.bonding = bonding;
        setup.tk = [0; 16];

        match method {
            PairingMethod::JustWorks => {
                setup.user_response = UserResponse::Pending;
                self.events.on_event(SecurityEvent::JustWorksRequest { handle, address: peer });
            }
            PairingMethod::OutOfBand => match self.config.oob_data.and_then(|hook| hook(&peer)) {
                Some(tk) => setup.tk = tk,
                None => {
                    self.fail(idx, Reason::OobNotAvailable);
                    return;
                }
            },
            _ => {
                if local_inputs(method, role) {
                    setup.user_response = UserResponse::Pending;
                    self.events.on_event(SecurityEvent::PassKeyInput { handle });
                }
                if method.displays(role) {
                    match self.config.fixed_passkey {
                        Some(passkey) => {
                            let passkey = passkey % 1_000_000;
                            setup.tk = tk_from_passkey(passkey);
                            self.events.on_event(SecurityEvent::PassKeyDisplay {
                                handle,
                                passkey: PassKey(passkey),
                            });
                        }
                        None => {
                            self.links[idx].state = EngineState::Ph1W2TkRandom;
                            return;
                        }
                    }
                }
            }
        }
        self.links[idx].state = self.after_method(idx);
    }

    fn after_method(&self, idx: usize) -> EngineState {
        match self.links[idx].role {
            Role::Responder => EngineState::ResponderPh1SendPairingResponse,
            Role::Initiator if self.arena.setup.waiting_for_user() => EngineState::Ph1W4UserResponse,
            Role::Initiator => EngineState::Ph2W2Random,
        }
    }

    /// Start the cipher or random request of `state`.
    pub(super) fn crypto_step(&mut self, idx: usize, state: EngineState) -> Result<(), Error> {
        let link = &self.links[idx];
        let setup = &self.arena.setup;
        let er = *self.keys.er();
        let dhk = *self.keys.dhk();
        let (request, next) = match state {
            EngineState::Ph1W2TkRandom => (Request::Random, EngineState::Ph1W4TkRandom),
            EngineState::Ph2W2Random => (Request::Random, EngineState::Ph2W4Random),
            EngineState::Ph3W2Random => (Request::Random, EngineState::Ph3W4Random),
            EngineState::Ph2C1GetEncA | EngineState::Ph2C1GetEncC => {
                let random = if state == EngineState::Ph2C1GetEncA {
                    &setup.local_random
                } else {
                    &setup.peer_random
                };
                let p1 = c1_p1(&setup.preq, &setup.pres, &setup.initiator, &setup.responder);
                let next = if state == EngineState::Ph2C1GetEncA {
                    EngineState::Ph2C1W4EncA
                } else {
                    EngineState::Ph2C1W4EncC
                };
                let plaintext = xor(random, &p1);
                (Request::Cipher { key: setup.tk, plaintext }, next)
            }
            EngineState::Ph2C1GetEncB | EngineState::Ph2C1GetEncD => {
                let p2 = c1_p2(&setup.initiator, &setup.responder);
                let next = if state == EngineState::Ph2C1GetEncB {
                    EngineState::Ph2C1W4EncB
                } else {
                    EngineState::Ph2C1W4EncD
                };
                let plaintext = xor(&setup.scratch, &p2);
                (Request::Cipher { key: setup.tk, plaintext }, next)
            }
            EngineState::Ph2CalcStk => {
                // r1 is always the responder's random
                let plaintext = match link.role {
                    Role::Responder => s1_block(&setup.local_random, &setup.peer_random),
                    Role::Initiator => s1_block(&setup.peer_random, &setup.local_random),
                };
                (Request::Cipher { key: setup.tk, plaintext }, EngineState::Ph2W4Stk)
            }
            EngineState::Ph3YGetEnc | EngineState::ResponderPh4YGetEnc => {
                let next = if state == EngineState::Ph3YGetEnc {
                    EngineState::Ph3YW4Enc
                } else {
                    EngineState::ResponderPh4YW4Enc
                };
                let plaintext = dm_block(setup.local_rand);
                (Request::Cipher { key: dhk, plaintext }, next)
            }
            EngineState::Ph3LtkGetEnc | EngineState::ResponderPh4LtkGetEnc => {
                let next = if state == EngineState::Ph3LtkGetEnc {
                    EngineState::Ph3LtkW4Enc
                } else {
                    EngineState::ResponderPh4LtkW4Enc
                };
                let plaintext = d1_block(setup.local_div, 0);
                (Request::Cipher { key: er, plaintext }, next)
            }
            EngineState::Ph3CsrkGetEnc => {
                let plaintext = d1_block(setup.local_div, 1);
                (Request::Cipher { key: er, plaintext }, EngineState::Ph3CsrkW4Enc)
            }
            state => {
                warn!("[smp legacy] no crypto step in {:?}", state);
                return Ok(());
            }
        };
        let context = CryptoContext::Link(link.handle);
        match request {
            Request::Random => self.gateway.start_random(&mut self.controller, context)?,
            Request::Cipher { key, plaintext } => {
                self.gateway
                    .start_cipher(&mut self.controller, &key, &plaintext, context)?
            }
        }
        self.links[idx].state = next;
        Ok(())
    }

    /// A cipher result for the link holding the setup.
    pub(crate) fn link_cipher_result(&mut self, idx: usize, result: &Block) {
        let (role, state) = (self.links[idx].role, self.links[idx].state);
        let setup = &mut self.arena.setup;
        let next = match state {
            EngineState::Ph2C1W4EncA => {
                setup.scratch = *result;
                EngineState::Ph2C1GetEncB
            }
            EngineState::Ph2C1W4EncB => {
                setup.local_confirm = *result;
                EngineState::Ph2SendConfirm
            }
            EngineState::Ph2C1W4EncC => {
                setup.scratch = *result;
                EngineState::Ph2C1GetEncD
            }
            EngineState::Ph2C1W4EncD if *result != setup.peer_confirm => {
                return self.fail(idx, Reason::ConfirmValueFailed);
            }
            EngineState::Ph2C1W4EncD => EngineState::Ph2CalcStk,
            EngineState::Ph2W4Stk => {
                setup.stk = truncate(result, setup.key_size);
                match role {
                    Role::Responder => EngineState::Ph2SendPairingRandom,
                    Role::Initiator => EngineState::InitiatorPh3SendStartEncryption,
                }
            }
            EngineState::Ph3YW4Enc => {
                setup.local_ediv = dm_result(result) ^ setup.local_div;
                EngineState::Ph3LtkGetEnc
            }
            EngineState::Ph3LtkW4Enc => {
                setup.local_ltk = truncate(result, setup.key_size);
                if setup.send.contains(KeySet::SIGNING_INFORMATION) {
                    EngineState::Ph3CsrkGetEnc
                } else {
                    EngineState::Ph3Distribute
                }
            }
            EngineState::Ph3CsrkW4Enc => {
                setup.local_csrk = *result;
                EngineState::Ph3Distribute
            }
            EngineState::ResponderPh4YW4Enc => {
                setup.local_div = dm_result(result) ^ setup.local_ediv;
                EngineState::ResponderPh4LtkGetEnc
            }
            EngineState::ResponderPh4LtkW4Enc => {
                setup.local_ltk = truncate(result, setup.key_size);
                EngineState::ResponderPh4SendLtkReply
            }
            state => {
                warn!("[smp legacy] cipher result in {:?}, dropped", state);
                state
            }
        };
        self.links[idx].state = next;
    }

    /// A random result for the link holding the setup.
    pub(crate) fn link_random_result(&mut self, idx: usize, random: &[u8]) {
        let link = &mut self.links[idx];
        let setup = &mut self.arena.setup;
        match link.state {
            EngineState::Ph1W4TkRandom => {
                let passkey = passkey_from_random(random);
                setup.tk = tk_from_passkey(passkey);
                self.events.on_event(SecurityEvent::PassKeyDisplay {
                    handle: link.handle,
                    passkey: PassKey(passkey),
                });
                let next = self.after_method(idx);
                self.links[idx].state = next;
            }
            EngineState::Ph2W4Random => {
                setup.local_random.copy_from_slice(&random[..16]);
                link.state = EngineState::Ph2C1GetEncA;
            }
            EngineState::Ph3W4Random => {
                let mut r = ReadCursor::new(random);
                let (Ok(rand), Ok(div)) = (r.read_u64_le(), r.read_u16_le()) else {
                    return;
                };
                setup.local_rand = rand;
                setup.local_div = div;
                link.state = EngineState::Ph3YGetEnc;
            }
            state => warn!("[smp legacy] random in {:?}, dropped", state),
        }
    }

    pub(super) fn handle_pairing_confirm(&mut self, idx: usize, payload: &[u8]) -> Result<(), Error> {
        let handle = self.links[idx].handle;
        let owner = self.arena.is_owner(handle);
        let mut confirm = [0; 16];
        confirm.copy_from_slice(payload);
        let confirm = reversed(&confirm);
        match self.links[idx].state {
            EngineState::ResponderPh1W4PairingConfirm if owner => {
                self.arena.setup.peer_confirm = confirm;
                self.links[idx].state = if self.arena.setup.waiting_for_user() {
                    EngineState::Ph1W4UserResponse
                } else {
                    EngineState::Ph2W2Random
                };
            }
            EngineState::InitiatorPh2W4PairingConfirm if owner => {
                if confirm == self.arena.setup.local_confirm {
                    // a reflected confirm value
                    self.fail(idx, Reason::UnspecifiedReason);
                    return Ok(());
                }
                self.arena.setup.peer_confirm = confirm;
                let random = reversed(&self.arena.setup.local_random);
                self.links[idx].state = EngineState::InitiatorPh2W4PairingRandom;
                self.send(idx, Command::PairingRandom, &random)?;
            }
            _ => self.fail(idx, Reason::UnspecifiedReason),
        }
        Ok(())
    }

    pub(super) fn handle_pairing_random(&mut self, idx: usize, payload: &[u8]) -> Result<(), Error> {
        let handle = self.links[idx].handle;
        match self.links[idx].state {
            EngineState::ResponderPh2W4PairingRandom | EngineState::InitiatorPh2W4PairingRandom
                if self.arena.is_owner(handle) =>
            {
                let mut random = [0; 16];
                random.copy_from_slice(payload);
                self.arena.setup.peer_random = reversed(&random);
                self.links[idx].state = EngineState::Ph2C1GetEncC;
            }
            _ => self.fail(idx, Reason::UnspecifiedReason),
        }
        Ok(())
    }

    pub(super) fn handle_key_pdu(&mut self, idx: usize, command: Command, payload: &[u8]) -> Result<(), Error> {
        let handle = self.links[idx].handle;
        let bit = match command {
            Command::EncryptionInformation => KeySet::ENCRYPTION_INFORMATION,
            Command::CentralIdentification => KeySet::CENTRAL_IDENTIFICATION,
            Command::IdentityInformation => KeySet::IDENTITY_INFORMATION,
            Command::IdentityAddressInformation => KeySet::IDENTITY_ADDRESS_INFORMATION,
            _ => KeySet::SIGNING_INFORMATION,
        };
        if self.links[idx].state != EngineState::Ph3W4Keys
            || !self.arena.is_owner(handle)
            || !self.arena.setup.expect.contains(bit)
        {
            warn!("[smp legacy] {:?} unexpected {}", handle, command);
            self.fail(idx, Reason::UnspecifiedReason);
            return Ok(());
        }

        let setup = &mut self.arena.setup;
        let mut r = ReadCursor::new(payload);
        match command {
            Command::EncryptionInformation => setup.peer_ltk = reversed(&r.read_array()?),
            Command::CentralIdentification => {
                setup.peer_ediv = r.read_u16_le()?;
                setup.peer_rand = r.read_u64_le()?;
            }
            Command::IdentityInformation => setup.peer_irk = reversed(&r.read_array()?),
            Command::IdentityAddressInformation => {
                let kind = r.read_u8()?;
                let addr: [u8; 6] = r.read_array()?;
                setup.peer_identity = Some(if kind == 0 {
                    Address::public(addr)
                } else {
                    Address::random(addr)
                });
            }
            _ => setup.peer_csrk = reversed(&r.read_array()?),
        }
        trace!("[smp legacy] {:?} received {}", handle, command);
        setup.expect.remove(bit);
        setup.received.insert(bit);

        if setup.expect.is_empty() {
            match self.links[idx].role {
                Role::Responder => self.pairing_done(idx),
                Role::Initiator => self.start_local_distribution(idx),
            }
        }
        Ok(())
    }

    /// Phase 3: send our keys, generating them first when needed.
    pub(super) fn start_local_distribution(&mut self, idx: usize) {
        let setup = &self.arena.setup;
        if setup.send.is_empty() {
            self.after_local_distribution(idx);
        } else if setup.needs_local_keys() {
            self.links[idx].state = EngineState::Ph3W2Random;
        } else {
            self.links[idx].state = EngineState::Ph3Distribute;
        }
    }

    fn after_local_distribution(&mut self, idx: usize) {
        if self.links[idx].role == Role::Responder && !self.arena.setup.expect.is_empty() {
            self.links[idx].state = EngineState::Ph3W4Keys;
        } else {
            self.pairing_done(idx);
        }
    }

    /// Send the next key PDU, in distribution order.
    pub(super) fn distribute_next(&mut self, idx: usize) -> Result<(), Error> {
        let Some(bit) = self.arena.setup.send.first() else {
            self.after_local_distribution(idx);
            return Ok(());
        };
        let setup = &self.arena.setup;
        let mut buf = [0; 16];
        let mut w = WriteCursor::new(&mut buf);
        let command = match bit {
            KeySet::ENCRYPTION_INFORMATION => {
                w.append(&reversed(&setup.local_ltk))?;
                Command::EncryptionInformation
            }
            KeySet::CENTRAL_IDENTIFICATION => {
                w.write_u16_le(setup.local_ediv)?;
                w.append(&setup.local_rand.to_le_bytes())?;
                Command::CentralIdentification
            }
            KeySet::IDENTITY_INFORMATION => {
                w.append(&self.keys.irk().to_le_bytes())?;
                Command::IdentityInformation
            }
            KeySet::IDENTITY_ADDRESS_INFORMATION => {
                let identity = self.config.identity_address;
                w.write_u8(identity.type_octet())?;
                w.append(identity.addr.raw())?;
                Command::IdentityAddressInformation
            }
            _ => {
                w.append(&reversed(&setup.local_csrk))?;
                Command::SigningInformation
            }
        };
        let len = w.len();
        self.send(idx, command, &buf[..len])?;
        self.arena.setup.send.remove(bit);
        if self.arena.setup.send.is_empty() {
            self.after_local_distribution(idx);
        }
        Ok(())
    }

    /// Both sides distributed their keys.
    fn pairing_done(&mut self, idx: usize) {
        let handle = self.links[idx].handle;
        if self.arena.setup.bonding {
            if let Err(e) = self.store_bond(idx) {
                warn!("[smp legacy] {:?} bond not stored: {:?}", handle, e);
            }
        }
        let link = &mut self.links[idx];
        link.timer = Timer::Stopped;
        link.pairing_active = false;
        link.state = link.role.idle_state();
        self.arena.release(handle);
        info!("[smp legacy] {:?} pairing complete", handle);
        self.events.on_event(SecurityEvent::PairingComplete {
            handle,
            status: PairingStatus::Success,
        });
    }

    fn store_bond(&mut self, idx: usize) -> Result<(), Error> {
        let link = &self.links[idx];
        let setup = &self.arena.setup;
        let handle = link.handle;
        let identity = setup.peer_identity.unwrap_or(link.peer);
        let irk = if setup.received.contains(KeySet::IDENTITY_INFORMATION) {
            IdentityResolvingKey::from_be_bytes(setup.peer_irk)
        } else {
            IdentityResolvingKey::new(0)
        };

        // keys of an earlier bond with this identity are stale
        if !irk.is_null() {
            for index in 0..self.store.capacity() {
                if let Some(info) = self.store.identity(index) {
                    if info.address == identity && !info.irk.is_null() && info.irk != irk {
                        debug!("[smp legacy] removing stale record {}", index);
                        self.store.remove(index);
                    }
                }
            }
        }

        let index = self.store.add(identity, irk)?;
        let mut info = EncryptionInformation {
            key_size: setup.key_size,
            authenticated: setup.authenticated,
            authorized: link.authorization == super::AuthorizationState::Granted,
            ..Default::default()
        };
        if setup.received.contains(KeySet::ENCRYPTION_INFORMATION)
            && setup.received.contains(KeySet::CENTRAL_IDENTIFICATION)
        {
            info.ediv = setup.peer_ediv;
            info.rand = setup.peer_rand;
            info.ltk = crate::LongTermKey::from_be_bytes(setup.peer_ltk);
        }
        self.store.set_encryption(index, info)?;
        if setup.received.contains(KeySet::SIGNING_INFORMATION) {
            self.store
                .set_remote_signing(index, SignatureKey::from_be_bytes(setup.peer_csrk))?;
            self.store.set_remote_counter(index, 0)?;
        }
        if setup.local_csrk != [0; 16] {
            self.store
                .set_local_signing(index, SignatureKey::from_be_bytes(setup.local_csrk))?;
            self.store.set_local_counter(index, 0)?;
        }

        let link = &mut self.links[idx];
        link.index = Some(index);
        link.lookup = super::IdentityLookup::Succeeded;
        info!("[smp legacy] {:?} bonded as {} at {}", handle, identity, index);
        self.events.on_event(SecurityEvent::IdentityCreated {
            handle,
            identity,
            index,
        });
        Ok(())
    }
}
