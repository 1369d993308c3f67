//! Peripheral side of legacy pairing and re-encryption.

use bt_hci::param::ConnHandle;

use super::setup::negotiate;
use super::{AuthorizationState, EngineState, Role, SecurityManager};
use crate::cursor::ReadCursor;
use crate::security_manager::events::SecurityEvent;
use crate::security_manager::gateway::CryptoSource;
use crate::security_manager::store::DeviceStore;
use crate::security_manager::types::{BondingFlag, Command, KeySet, PairingFeatures, Reason};
use crate::security_manager::{EventSink, Transport};
use crate::Error;

impl<C, S, E, const LINKS: usize, const QUEUE: usize> SecurityManager<C, S, E, LINKS, QUEUE>
where
    C: CryptoSource + Transport,
    S: DeviceStore,
    E: EventSink,
{
    /// The controller asks for the LTK of an encryption started by the peer.
    pub fn handle_ltk_request(&mut self, handle: ConnHandle, rand: u64, ediv: u16) -> Result<(), Error> {
        let idx = self.link_index(handle).ok_or(Error::NotFound)?;
        let link = &mut self.links[idx];
        if link.role != Role::Responder {
            return Err(Error::InvalidState);
        }
        match link.state {
            EngineState::ResponderPh2W4LtkRequest => {
                link.state = EngineState::ResponderPh2SendLtkReply;
            }
            EngineState::ResponderIdle | EngineState::ResponderPh1W4PairingRequest => {
                if ediv == 0 && rand == 0 {
                    debug!("[smp legacy] {:?} LTK request without EDIV/Rand", handle);
                    link.state = EngineState::ResponderPh0SendLtkNegativeReply;
                    return Ok(());
                }
                link.ltk_ediv = ediv;
                link.ltk_rand = rand;
                if !link.lookup.is_finished() {
                    link.state = EngineState::ResponderPh0ReceivedLtkW4Irk;
                } else if link.index.is_some() {
                    link.state = EngineState::ResponderPh0ReceivedLtkRequest;
                } else {
                    info!("[smp legacy] {:?} LTK requested by unknown peer", handle);
                    link.state = EngineState::ResponderPh0SendLtkNegativeReply;
                    self.events.on_event(SecurityEvent::BondLost { handle });
                }
            }
            state => {
                warn!("[smp legacy] {:?} LTK request in {:?}, rejected", handle, state);
                self.controller.long_term_key_negative_reply(handle)?;
            }
        }
        Ok(())
    }

    pub(super) fn handle_pairing_request(&mut self, idx: usize, payload: &[u8]) -> Result<(), Error> {
        let link = &mut self.links[idx];
        if !matches!(
            link.state,
            EngineState::ResponderIdle | EngineState::ResponderSendSecurityRequest | EngineState::ResponderPh1W4PairingRequest
        ) {
            self.fail(idx, Reason::UnspecifiedReason);
            return Ok(());
        }
        let Ok(request) = ReadCursor::new(payload).read::<PairingFeatures>() else {
            self.fail(idx, Reason::InvalidParameters);
            return Ok(());
        };
        debug!("[smp legacy] {:?} pairing request {}", link.handle, request);
        link.pairing_requested = false;
        link.pairing_request = Some(request);
        link.state = EngineState::ResponderPh1PairingRequestReceived;
        self.start_pairing(idx);
        Ok(())
    }

    /// Negotiate against the stored Pairing Request. The link holds the setup.
    pub(super) fn start_responder_pairing(&mut self, idx: usize) {
        let link = &mut self.links[idx];
        let Some(request) = link.pairing_request.take() else {
            self.fail(idx, Reason::UnspecifiedReason);
            return;
        };
        let (local, peer) = (link.local, link.peer);
        let features = self.local_features(&peer);
        let response = PairingFeatures {
            initiator_key_distribution: request
                .initiator_key_distribution
                .intersect(features.initiator_key_distribution),
            responder_key_distribution: request
                .responder_key_distribution
                .intersect(features.responder_key_distribution),
            ..features
        };
        debug!("[smp legacy] pairing response {}", response);

        let setup = &mut self.arena.setup;
        setup.preq = request.to_pdu(Command::PairingRequest);
        setup.pres = response.to_pdu(Command::PairingResponse);
        setup.initiator = peer;
        setup.responder = local;
        setup.send = KeySet::from_flags(response.responder_key_distribution);
        setup.expect = KeySet::from_flags(response.initiator_key_distribution);

        match negotiate(
            &request,
            &response,
            Role::Responder,
            self.config.min_key_size(),
            self.config.max_key_size(),
            self.config.accepted_methods,
        ) {
            Ok(negotiated) => {
                let bonding = request.security_properties.bond() == BondingFlag::Bonding
                    && response.security_properties.bond() == BondingFlag::Bonding;
                self.select_method(idx, negotiated, bonding);
            }
            Err(reason) => self.fail(idx, reason),
        }
    }

    /// Rebuild the LTK handed out when bonding from EDIV and Rand. The link holds the setup.
    pub(super) fn start_responder_reencryption(&mut self, idx: usize) {
        let link = &mut self.links[idx];
        let handle = link.handle;
        let Some(info) = link.index.and_then(|index| self.store.encryption(index)) else {
            info!("[smp legacy] {:?} no encryption information, bond lost", handle);
            link.state = EngineState::ResponderPh0SendLtkNegativeReply;
            self.arena.release(handle);
            self.events.on_event(SecurityEvent::BondLost { handle });
            return;
        };
        link.key_size = info.key_size;
        link.authenticated = info.authenticated;
        if info.authorized {
            link.authorization = AuthorizationState::Granted;
        }
        let setup = &mut self.arena.setup;
        setup.local_ediv = link.ltk_ediv;
        setup.local_rand = link.ltk_rand;
        setup.key_size = info.key_size;
        link.state = EngineState::ResponderPh4YGetEnc;
        info!("[smp legacy] {:?} re-encryption with EDIV {:04x}", handle, link.ltk_ediv);
        self.events.on_event(SecurityEvent::ReencryptionStarted { handle });
    }
}
