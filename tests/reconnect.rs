use trouble_security::prelude::*;

mod common;
use common::*;

fn reconnected() -> Pair {
    init_logger();
    let mut pair = Pair::new(central_config(), peripheral_config());
    pair.connect();
    pair.central.request_pairing(pair.handle).unwrap();
    pair.run();
    assert_eq!(
        pair.central.events().pairing_status(pair.handle),
        Some(PairingStatus::Success)
    );
    pair.disconnect();
    pair.connect();
    pair
}

fn reencryption_status(sm: &Manager, handle: ConnHandle) -> Option<ReencryptionStatus> {
    sm.events().events.iter().rev().find_map(|e| match e {
        SecurityEvent::ReencryptionComplete { handle: h, status } if *h == handle => Some(*status),
        _ => None,
    })
}

#[test]
fn peers_recognized_after_reconnect() {
    let pair = reconnected();
    let handle = pair.handle;
    for sm in [&pair.central, &pair.peripheral] {
        assert_eq!(sm.identity_lookup_state(handle), Some(IdentityLookup::Succeeded));
        assert_eq!(sm.device_index(handle), Some(0));
        assert_eq!(sm.encryption_key_size(handle), Some(0));
    }
}

#[test]
fn reencrypt_with_stored_ltk() {
    let mut pair = reconnected();
    let handle = pair.handle;
    let stored = pair.central.store().encryption(0).unwrap();
    let sent = pair.central.controller().pdus.len();

    pair.central.request_pairing(handle).unwrap();
    pair.run();

    assert_eq!(
        pair.central.controller().hci.last(),
        Some(&Hci::StartEncryption {
            handle,
            ltk: stored.ltk,
            ediv: stored.ediv,
            rand: stored.rand,
        })
    );
    assert_eq!(
        pair.peripheral.controller().hci.last(),
        Some(&Hci::LtkReply { handle, ltk: stored.ltk })
    );
    for sm in [&pair.central, &pair.peripheral] {
        assert_eq!(reencryption_status(sm, handle), Some(ReencryptionStatus::Success));
        assert_eq!(sm.encryption_key_size(handle), Some(16));
    }
    // no SMP traffic
    assert_eq!(pair.central.controller().pdus.len(), sent);
}

#[test]
fn peripheral_lost_bond() {
    let mut pair = reconnected();
    let handle = pair.handle;
    pair.disconnect();
    pair.peripheral.store_mut().remove(0);
    pair.connect();
    assert_eq!(pair.peripheral.identity_lookup_state(handle), Some(IdentityLookup::Failed));

    pair.central.request_pairing(handle).unwrap();
    pair.run();

    assert_eq!(
        pair.peripheral.controller().hci.last(),
        Some(&Hci::LtkNegativeReply { handle })
    );
    let lost = |e: &SecurityEvent| matches!(e, SecurityEvent::BondLost { handle: h } if *h == handle);
    assert_eq!(pair.peripheral.events().count(lost), 1);
    assert_eq!(pair.central.events().count(lost), 1);
    assert_eq!(reencryption_status(&pair.central, handle), Some(ReencryptionStatus::Failed));
    assert_eq!(pair.central.encryption_key_size(handle), Some(0));

    // pairing again restores the bond
    pair.central.request_pairing(handle).unwrap();
    pair.run();
    assert_eq!(pair.central.events().pairing_status(handle), Some(PairingStatus::Success));
    assert_eq!(pair.peripheral.events().pairing_status(handle), Some(PairingStatus::Success));
    assert_eq!(pair.peripheral.store().len(), 1);
    assert_eq!(pair.central.store().len(), 1);
}

#[test]
fn mitm_security_request_repairs_unauthenticated_bond() {
    let mut pair = reconnected();
    let handle = pair.handle;
    let paired = pair
        .central
        .events()
        .count(|e| matches!(e, SecurityEvent::PairingStarted { .. }));

    // Security Request asking for MITM protection
    pair.central.handle_pdu(handle, &[0x0b, 0x05]).unwrap();
    pair.run();

    let started = pair
        .central
        .events()
        .count(|e| matches!(e, SecurityEvent::PairingStarted { .. }));
    assert_eq!(started, paired + 1);
    assert_eq!(reencryption_status(&pair.central, handle), None);
    // Just Works cannot give MITM protection
    assert_eq!(pair.central.events().pairing_status(handle), Some(PairingStatus::Success));
    assert!(!pair.central.authenticated(handle));
}

#[test]
fn authorization_persisted_with_bond() {
    let mut pair = reconnected();
    let handle = pair.handle;

    pair.peripheral.request_authorization(handle).unwrap();
    assert_eq!(
        pair.peripheral.events().events.last(),
        Some(&SecurityEvent::AuthorizationRequest { handle })
    );
    pair.peripheral.authorization_grant(handle).unwrap();
    assert_eq!(
        pair.peripheral.authorization_state(handle),
        Some(AuthorizationState::Granted)
    );
    assert!(pair.peripheral.store().encryption(0).unwrap().authorized);

    pair.disconnect();
    pair.connect();
    assert_eq!(
        pair.peripheral.authorization_state(handle),
        Some(AuthorizationState::Unknown)
    );
    pair.central.request_pairing(handle).unwrap();
    pair.run();
    assert_eq!(
        pair.peripheral.authorization_state(handle),
        Some(AuthorizationState::Granted)
    );

    pair.peripheral.request_authorization(handle).unwrap();
    assert_eq!(
        pair.peripheral.events().events.last(),
        Some(&SecurityEvent::AuthorizationResult { handle, granted: true })
    );
}
