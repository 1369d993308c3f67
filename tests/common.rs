#![allow(dead_code)]

use std::collections::VecDeque;

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use embassy_time::{Duration, Instant};
use rand_chacha::ChaCha12Rng;
use rand_core::{RngCore, SeedableRng};
use trouble_security::prelude::*;

pub type Manager = SecurityManager<MockController, MemoryStore<4>, Recorder, 3, 2>;

pub const CENTRAL_ADDRESS: [u8; 6] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06];
pub const PERIPHERAL_ADDRESS: [u8; 6] = [0x11, 0x12, 0x13, 0x14, 0x15, 0xd6];

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn aes(key: &[u8; 16], plaintext: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(&aes::Block::from(*key));
    let mut block = aes::Block::from(*plaintext);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// HCI commands issued by the security manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hci {
    StartEncryption {
        handle: ConnHandle,
        ltk: LongTermKey,
        ediv: u16,
        rand: u64,
    },
    LtkReply {
        handle: ConnHandle,
        ltk: LongTermKey,
    },
    LtkNegativeReply {
        handle: ConnHandle,
    },
    SetRandomAddress(BdAddr),
}

#[derive(Debug, Clone, Copy)]
pub enum Pending {
    Cipher([u8; 16]),
    Random([u8; 16]),
}

/// Controller computing AES locally and taking randoms from a seeded generator.
pub struct MockController {
    rng: ChaCha12Rng,
    pub pending: Option<Pending>,
    pub ciphers: usize,
    /// PDUs not delivered yet
    pub outbox: VecDeque<(ConnHandle, Vec<u8>)>,
    /// Every PDU sent
    pub pdus: Vec<(ConnHandle, Vec<u8>)>,
    /// HCI commands not delivered yet
    pub commands: VecDeque<Hci>,
    /// Every HCI command issued
    pub hci: Vec<Hci>,
}

impl MockController {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha12Rng::seed_from_u64(seed),
            pending: None,
            ciphers: 0,
            outbox: VecDeque::new(),
            pdus: Vec::new(),
            commands: VecDeque::new(),
            hci: Vec::new(),
        }
    }

    fn command(&mut self, command: Hci) {
        self.commands.push_back(command);
        self.hci.push(command);
    }

    /// Opcodes sent on `handle`, in order.
    pub fn opcodes(&self, handle: ConnHandle) -> Vec<u8> {
        self.pdus.iter().filter(|(h, _)| *h == handle).map(|(_, pdu)| pdu[0]).collect()
    }
}

impl CryptoSource for MockController {
    fn start_encrypt(&mut self, key: &[u8; 16], plaintext: &[u8; 16]) -> Result<(), Error> {
        assert!(self.pending.is_none(), "crypto request while one is outstanding");
        self.ciphers += 1;
        self.pending = Some(Pending::Cipher(aes(key, plaintext)));
        Ok(())
    }

    fn start_random(&mut self) -> Result<(), Error> {
        assert!(self.pending.is_none(), "crypto request while one is outstanding");
        let mut random = [0; 16];
        self.rng.fill_bytes(&mut random);
        self.pending = Some(Pending::Random(random));
        Ok(())
    }
}

impl Transport for MockController {
    fn send_pdu(&mut self, handle: ConnHandle, pdu: &[u8]) -> Result<(), Error> {
        self.outbox.push_back((handle, pdu.to_vec()));
        self.pdus.push((handle, pdu.to_vec()));
        Ok(())
    }

    fn start_encryption(&mut self, handle: ConnHandle, ltk: &LongTermKey, ediv: u16, rand: u64) -> Result<(), Error> {
        self.command(Hci::StartEncryption {
            handle,
            ltk: *ltk,
            ediv,
            rand,
        });
        Ok(())
    }

    fn long_term_key_reply(&mut self, handle: ConnHandle, ltk: &LongTermKey) -> Result<(), Error> {
        self.command(Hci::LtkReply { handle, ltk: *ltk });
        Ok(())
    }

    fn long_term_key_negative_reply(&mut self, handle: ConnHandle) -> Result<(), Error> {
        self.command(Hci::LtkNegativeReply { handle });
        Ok(())
    }

    fn set_random_address(&mut self, address: BdAddr) -> Result<(), Error> {
        self.command(Hci::SetRandomAddress(address));
        Ok(())
    }
}

/// Event sink keeping every event.
#[derive(Default)]
pub struct Recorder {
    pub events: Vec<SecurityEvent>,
}

impl EventSink for Recorder {
    fn on_event(&mut self, event: SecurityEvent) {
        self.events.push(event);
    }
}

impl Recorder {
    pub fn pairing_status(&self, handle: ConnHandle) -> Option<PairingStatus> {
        self.events.iter().rev().find_map(|e| match e {
            SecurityEvent::PairingComplete { handle: h, status } if *h == handle => Some(*status),
            _ => None,
        })
    }

    pub fn passkey_shown(&self, handle: ConnHandle) -> Option<PassKey> {
        self.events.iter().rev().find_map(|e| match e {
            SecurityEvent::PassKeyDisplay { handle: h, passkey } if *h == handle => Some(*passkey),
            _ => None,
        })
    }

    pub fn count(&self, f: impl Fn(&SecurityEvent) -> bool) -> usize {
        self.events.iter().filter(|e| f(e)).count()
    }
}

pub fn manager(config: SecurityConfig, seed: u64) -> Manager {
    let mut sm = Manager::new(config, MockController::new(seed), MemoryStore::new(), Recorder::default());
    sm.start();
    sm
}

/// Poll and answer crypto requests until the manager is idle. Returns `true`
/// if anything happened.
pub fn drive(sm: &mut Manager, now: Instant) -> bool {
    let mut progress = false;
    loop {
        sm.poll(now).unwrap();
        match sm.controller_mut().pending.take() {
            Some(Pending::Cipher(result)) => sm.handle_encrypt_result(result).unwrap(),
            Some(Pending::Random(random)) => sm.handle_random_result(&random).unwrap(),
            None => return progress,
        }
        progress = true;
    }
}

pub fn central_config() -> SecurityConfig {
    SecurityConfig {
        identity_address: Address::public(CENTRAL_ADDRESS),
        er: Some([0x11; 16]),
        ir: Some([0x22; 16]),
        ..Default::default()
    }
}

pub fn peripheral_config() -> SecurityConfig {
    SecurityConfig {
        identity_address: Address::random(PERIPHERAL_ADDRESS),
        er: Some([0x33; 16]),
        ir: Some([0x44; 16]),
        ..Default::default()
    }
}

/// A central and a peripheral connected back to back on one handle.
pub struct Pair {
    pub central: Manager,
    pub peripheral: Manager,
    pub now: Instant,
    pub handle: ConnHandle,
    /// Answer Just Works requests automatically
    pub auto_confirm: bool,
    seen: [usize; 2],
    started_ltk: Option<LongTermKey>,
}

impl Pair {
    pub fn new(central: SecurityConfig, peripheral: SecurityConfig) -> Self {
        let mut pair = Self {
            central: manager(central, 1),
            peripheral: manager(peripheral, 2),
            now: Instant::from_secs(1),
            handle: ConnHandle::new(0x40),
            auto_confirm: true,
            seen: [0, 0],
            started_ltk: None,
        };
        pair.run();
        pair
    }

    pub fn connect(&mut self) {
        self.central
            .link_up(
                self.handle,
                Role::Initiator,
                Address::public(CENTRAL_ADDRESS),
                Address::random(PERIPHERAL_ADDRESS),
            )
            .unwrap();
        self.peripheral
            .link_up(
                self.handle,
                Role::Responder,
                Address::random(PERIPHERAL_ADDRESS),
                Address::public(CENTRAL_ADDRESS),
            )
            .unwrap();
        self.run();
    }

    pub fn disconnect(&mut self) {
        self.central.link_down(self.handle);
        self.peripheral.link_down(self.handle);
        self.central.controller_mut().outbox.clear();
        self.peripheral.controller_mut().outbox.clear();
        self.started_ltk = None;
    }

    pub fn advance_time(&mut self, duration: Duration) {
        self.now += duration;
        self.run();
    }

    /// Exchange PDUs and HCI events until both sides are idle.
    pub fn run(&mut self) {
        for _ in 0..1000 {
            let mut progress = drive(&mut self.central, self.now);
            progress |= drive(&mut self.peripheral, self.now);
            progress |= self.confirm_just_works();

            while let Some((handle, pdu)) = self.central.controller_mut().outbox.pop_front() {
                self.peripheral.handle_pdu(handle, &pdu).unwrap();
                progress = true;
            }
            while let Some((handle, pdu)) = self.peripheral.controller_mut().outbox.pop_front() {
                self.central.handle_pdu(handle, &pdu).unwrap();
                progress = true;
            }
            while let Some(command) = self.central.controller_mut().commands.pop_front() {
                if let Hci::StartEncryption { handle, ltk, ediv, rand } = command {
                    self.started_ltk = Some(ltk);
                    self.peripheral.handle_ltk_request(handle, rand, ediv).unwrap();
                }
                progress = true;
            }
            while let Some(command) = self.peripheral.controller_mut().commands.pop_front() {
                match command {
                    Hci::LtkReply { handle, ltk } => {
                        let success = self.started_ltk.take() == Some(ltk);
                        self.peripheral.handle_encryption_change(handle, success).unwrap();
                        self.central.handle_encryption_change(handle, success).unwrap();
                    }
                    Hci::LtkNegativeReply { handle } => {
                        self.started_ltk = None;
                        self.central.handle_encryption_change(handle, false).unwrap();
                    }
                    _ => {}
                }
                progress = true;
            }
            if !progress {
                return;
            }
        }
        panic!("no quiescence");
    }

    fn confirm_just_works(&mut self) -> bool {
        if !self.auto_confirm {
            return false;
        }
        let [central, peripheral] = &mut self.seen;
        confirm_just_works(&mut self.central, central) | confirm_just_works(&mut self.peripheral, peripheral)
    }
}

/// Confirm every Just Works request emitted since `seen`.
pub fn confirm_just_works(sm: &mut Manager, seen: &mut usize) -> bool {
    let requests: Vec<ConnHandle> = sm.events().events[*seen..]
        .iter()
        .filter_map(|e| match e {
            SecurityEvent::JustWorksRequest { handle, .. } => Some(*handle),
            _ => None,
        })
        .collect();
    *seen = sm.events().events.len();
    for handle in &requests {
        sm.just_works_confirm(*handle).unwrap();
    }
    !requests.is_empty()
}
