//! Central side of legacy pairing and re-encryption.

use super::setup::negotiate;
use super::{EngineState, SecurityManager};
use crate::codec::Decode;
use crate::cursor::ReadCursor;
use crate::security_manager::events::SecurityEvent;
use crate::security_manager::gateway::CryptoSource;
use crate::security_manager::store::DeviceStore;
use crate::security_manager::types::{AuthReq, BondingFlag, Command, KeySet, PairingFeatures, Reason};
use crate::security_manager::{EventSink, Transport};
use crate::Error;

impl<C, S, E, const LINKS: usize, const QUEUE: usize> SecurityManager<C, S, E, LINKS, QUEUE>
where
    C: CryptoSource + Transport,
    S: DeviceStore,
    E: EventSink,
{
    /// Send the Pairing Request. The link holds the setup.
    pub(super) fn start_initiator_pairing(&mut self, idx: usize) -> Result<(), Error> {
        let (local, peer) = (self.links[idx].local, self.links[idx].peer);
        let request = self.local_features(&peer);
        debug!("[smp legacy] pairing request {}", request);
        let setup = &mut self.arena.setup;
        setup.preq = request.to_pdu(Command::PairingRequest);
        setup.initiator = local;
        setup.responder = peer;
        let preq = setup.preq;

        self.start_pairing(idx);
        self.links[idx].state = EngineState::InitiatorPh1W4PairingResponse;
        self.send(idx, Command::PairingRequest, &preq[1..])
    }

    pub(super) fn handle_pairing_response(&mut self, idx: usize, payload: &[u8]) -> Result<(), Error> {
        let handle = self.links[idx].handle;
        if self.links[idx].state != EngineState::InitiatorPh1W4PairingResponse || !self.arena.is_owner(handle) {
            self.fail(idx, Reason::UnspecifiedReason);
            return Ok(());
        }
        let Ok(response) = ReadCursor::new(payload).read::<PairingFeatures>() else {
            self.fail(idx, Reason::InvalidParameters);
            return Ok(());
        };
        debug!("[smp legacy] pairing response {}", response);
        let request = PairingFeatures::decode(&self.arena.setup.preq[1..])?;
        let negotiated = match negotiate(
            &request,
            &response,
            super::Role::Initiator,
            self.config.min_key_size(),
            self.config.max_key_size(),
            self.config.accepted_methods,
        ) {
            Ok(negotiated) => negotiated,
            Err(reason) => {
                self.fail(idx, reason);
                return Ok(());
            }
        };

        let setup = &mut self.arena.setup;
        setup.pres = response.to_pdu(Command::PairingResponse);
        setup.send = KeySet::from_flags(
            response
                .initiator_key_distribution
                .intersect(request.initiator_key_distribution),
        );
        setup.expect = KeySet::from_flags(response.responder_key_distribution);
        let bonding = request.security_properties.bond() == BondingFlag::Bonding
            && response.security_properties.bond() == BondingFlag::Bonding;
        self.select_method(idx, negotiated, bonding);
        Ok(())
    }

    /// Encrypt with the LTK the peer distributed when bonding.
    pub(super) fn start_initiator_reencryption(&mut self, idx: usize) -> Result<(), Error> {
        let link = &mut self.links[idx];
        let handle = link.handle;
        let info = link
            .index
            .and_then(|index| self.store.encryption(index))
            .filter(|info| info.has_ltk());
        let Some(info) = info else {
            debug!("[smp legacy] {:?} no stored LTK, pairing instead", handle);
            link.state = EngineState::InitiatorPh1W2SendPairingRequest;
            return self.start_initiator_pairing(idx);
        };
        link.key_size = info.key_size;
        link.authenticated = info.authenticated;
        if info.authorized {
            link.authorization = super::AuthorizationState::Granted;
        }
        link.state = EngineState::Ph4W4ConnectionEncrypted;
        info!("[smp legacy] {:?} encrypting with stored LTK", handle);
        self.events.on_event(SecurityEvent::ReencryptionStarted { handle });
        self.controller.start_encryption(handle, &info.ltk, info.ediv, info.rand)
    }

    pub(super) fn handle_security_request(&mut self, idx: usize, payload: &[u8]) -> Result<(), Error> {
        let link = &mut self.links[idx];
        match link.state {
            EngineState::InitiatorConnected | EngineState::ReencryptionFailed => {
                let auth_req = AuthReq::from(payload[0]);
                debug!("[smp legacy] {:?} security request {}", link.handle, auth_req);
                link.security_request = Some(auth_req);
                if link.lookup.is_finished() {
                    self.serve_deferred(idx);
                }
            }
            state => debug!("[smp legacy] security request in {:?}, ignored", state),
        }
        Ok(())
    }
}
