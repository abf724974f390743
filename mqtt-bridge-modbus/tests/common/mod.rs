//! A simulated Modbus-RTU slave behind an in-memory line.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mbx_bridge_framework::{BridgeHealth, MemoryLink};
use mqtt_bridge_modbus::bridge::Bridge;
use mqtt_bridge_modbus::bus::{BusTiming, ModbusBus, PassiveLink, SerialLink, append_crc, crc16};
use mqtt_bridge_modbus::model::BusConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const ROOT: &str = "mbx_root";

/// Register map and fault switches shared with the slave task.
#[derive(Default)]
struct SlaveState {
    registers: Mutex<HashMap<(u8, u16), u16>>,
    requests: Mutex<Vec<Vec<u8>>>,
    corrupt_crc: AtomicBool,
    delay_ms: AtomicU64,
    silent: Mutex<HashSet<u8>>,
}

/// Answers every slave id from one register map.
#[derive(Clone, Default)]
pub struct SimulatedSlave {
    state: Arc<SlaveState>,
}

impl SimulatedSlave {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_register(&self, slave_id: u8, address: u16, value: u16) {
        self.state
            .registers
            .lock()
            .unwrap()
            .insert((slave_id, address), value);
    }

    pub fn register(&self, slave_id: u8, address: u16) -> Option<u16> {
        self.state
            .registers
            .lock()
            .unwrap()
            .get(&(slave_id, address))
            .copied()
    }

    /// Flip the CRC of every following response.
    pub fn corrupt_crc(&self, corrupt: bool) {
        self.state.corrupt_crc.store(corrupt, Ordering::SeqCst);
    }

    /// Delay before each response.
    pub fn set_delay(&self, delay: Duration) {
        self.state
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Stop answering requests addressed to `slave_id`.
    pub fn silence(&self, slave_id: u8) {
        self.state.silent.lock().unwrap().insert(slave_id);
    }

    /// Raw request frames seen so far.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Bus whose port opens a fresh line served by this slave.
    pub fn bus(&self, timing: BusTiming) -> Arc<ModbusBus> {
        let slave = self.clone();
        let opener = move |_: &BusConfig| -> io::Result<Box<dyn SerialLink>> {
            let (near, far) = tokio::io::duplex(1024);
            tokio::spawn(slave.clone().serve(far));
            Ok(Box::new(PassiveLink::new(near)))
        };
        Arc::new(ModbusBus::new(opener, timing))
    }

    async fn serve(self, mut line: DuplexStream) {
        let mut request = [0u8; 8];
        while line.read_exact(&mut request).await.is_ok() {
            self.state.requests.lock().unwrap().push(request.to_vec());
            if crc16(&request[..6]) != u16::from_le_bytes([request[6], request[7]]) {
                continue;
            }
            if self.state.silent.lock().unwrap().contains(&request[0]) {
                continue;
            }

            let mut response = self.respond(&request);
            if self.state.corrupt_crc.load(Ordering::SeqCst) {
                if let Some(last) = response.last_mut() {
                    *last ^= 0xFF;
                }
            }

            let delay = self.state.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            if line.write_all(&response).await.is_err() {
                break;
            }
        }
    }

    fn respond(&self, request: &[u8; 8]) -> Vec<u8> {
        let slave_id = request[0];
        let function = request[1];
        let address = u16::from_be_bytes([request[2], request[3]]);
        let operand = u16::from_be_bytes([request[4], request[5]]);
        let mut registers = self.state.registers.lock().unwrap();

        let mut body = vec![slave_id, function];
        match function {
            1 | 2 => {
                let bytes = operand.div_ceil(8) as usize;
                let mut packed = vec![0u8; bytes];
                for bit in 0..operand {
                    let on = registers
                        .get(&(slave_id, address.wrapping_add(bit)))
                        .is_some_and(|v| *v != 0);
                    if on {
                        packed[(bit / 8) as usize] |= 1 << (bit % 8);
                    }
                }
                body.push(bytes as u8);
                body.extend(packed);
            }
            3 | 4 => {
                body.push((operand * 2) as u8);
                for offset in 0..operand {
                    let word = registers
                        .get(&(slave_id, address.wrapping_add(offset)))
                        .copied()
                        .unwrap_or(0);
                    body.extend(word.to_be_bytes());
                }
            }
            5 => {
                registers.insert((slave_id, address), u16::from(operand == 0xFF00));
                body.extend(&request[2..6]);
            }
            6 => {
                registers.insert((slave_id, address), operand);
                body.extend(&request[2..6]);
            }
            _ => {
                body = vec![slave_id, function | 0x80, 0x01];
            }
        }

        append_crc(&mut body);
        body
    }
}

pub fn fast_timing() -> BusTiming {
    BusTiming {
        guard: Duration::from_micros(10),
        response_timeout: Duration::from_millis(100),
        first_byte_window: Duration::from_millis(5),
    }
}

/// Write a Modbus configuration document into `dir`.
pub fn write_config(dir: &Path, document: &str) -> PathBuf {
    let path = dir.join("config.json");
    std::fs::write(&path, document).unwrap();
    path
}

/// Bridge over the slave's bus and a memory link.
pub fn bridge(slave: &SimulatedSlave, timing: BusTiming) -> (Bridge, Arc<MemoryLink>, Arc<BridgeHealth>) {
    let link = Arc::new(MemoryLink::new(ROOT));
    let health = Arc::new(BridgeHealth::new("modbus"));
    let bridge = Bridge::new(link.clone(), slave.bus(timing), health.clone());
    (bridge, link, health)
}
