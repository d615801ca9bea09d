//! Virtual wire between two in-memory NIC ports
//!
//! Each port delivers what it transmits into the other port's receive
//! queue. Lets the stack run without hardware during bring-up, and lets a
//! test hold the far end of the cable while the stack owns the near one.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{DeviceError, LinkStatus, NetworkDevice, TransmitError};
use crate::net::ethernet::{MAX_FRAME_SIZE, MacAddr};

/// Default per-direction queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

struct Lane {
    /// Frames in flight towards one port
    frames: VecDeque<Vec<u8>>,
    /// Whether the sending port currently has a free transmit descriptor
    tx_ready: bool,
}

struct WireState {
    /// Index 0 carries frames towards port A, index 1 towards port B
    lanes: [Lane; 2],
    max_queue_size: usize,
}

/// One end of a [`VirtualWire`]
pub struct WirePort {
    mac_addr: MacAddr,
    /// Lane this port receives from
    side: usize,
    state: Arc<Mutex<WireState>>,
    name: &'static str,
}

/// Constructor for connected port pairs
pub struct VirtualWire;

impl VirtualWire {
    /// Create two connected ports
    ///
    /// # Arguments
    /// * `mac_a` - MAC address reported by the first port
    /// * `mac_b` - MAC address reported by the second port
    pub fn pair(mac_a: MacAddr, mac_b: MacAddr) -> (WirePort, WirePort) {
        Self::with_depth(mac_a, mac_b, DEFAULT_QUEUE_DEPTH)
    }

    /// Create two connected ports with a bounded queue in each direction
    pub fn with_depth(mac_a: MacAddr, mac_b: MacAddr, max_queue_size: usize) -> (WirePort, WirePort) {
        let lane = || Lane {
            frames: VecDeque::new(),
            tx_ready: true,
        };
        let state = Arc::new(Mutex::new(WireState {
            lanes: [lane(), lane()],
            max_queue_size,
        }));
        (
            WirePort {
                mac_addr: mac_a,
                side: 0,
                state: state.clone(),
                name: "wire0",
            },
            WirePort {
                mac_addr: mac_b,
                side: 1,
                state,
                name: "wire1",
            },
        )
    }
}

impl WirePort {
    fn peer_side(&self) -> usize {
        1 - self.side
    }

    /// Inject a frame towards the other port (test/peer side helper)
    pub fn send(&self, frame: &[u8]) -> Result<(), TransmitError> {
        let mut state = self.state.lock();
        let max = state.max_queue_size;
        let lane = &mut state.lanes[self.peer_side()];
        if lane.frames.len() >= max {
            return Err(TransmitError::BufferFull);
        }
        lane.frames.push_back(frame.to_vec());
        Ok(())
    }

    /// Take the next frame sent by the other port
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.state.lock().lanes[self.side].frames.pop_front()
    }

    /// Take every frame sent by the other port
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.state.lock().lanes[self.side].frames.drain(..).collect()
    }

    /// Number of frames waiting for this port
    pub fn pending(&self) -> usize {
        self.state.lock().lanes[self.side].frames.len()
    }

    /// Simulate the other port running out of transmit descriptors
    pub fn set_peer_tx_ready(&self, ready: bool) {
        self.state.lock().lanes[self.side].tx_ready = ready;
    }
}

impl NetworkDevice for WirePort {
    fn mac_address(&self) -> MacAddr {
        self.mac_addr
    }

    fn init(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn halt(&mut self) {
        self.state.lock().lanes[self.side].frames.clear();
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), TransmitError> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(TransmitError::PacketTooLarge);
        }
        if !self.can_transmit() {
            return Err(TransmitError::BufferFull);
        }
        self.send(frame)
    }

    fn can_transmit(&self) -> bool {
        let state = self.state.lock();
        let lane = &state.lanes[self.peer_side()];
        lane.tx_ready && lane.frames.len() < state.max_queue_size
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.recv()
    }

    fn link_status(&self) -> LinkStatus {
        LinkStatus::Up
    }

    fn device_name(&self) -> &str {
        self.name
    }
}
