// Network Device Abstraction Layer
pub mod loopback;

use alloc::vec::Vec;
use core::fmt;

use crate::net::ethernet::MacAddr;

/// link status of a network interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
    Unknown,
}

/// Errors that can occur while bringing a device up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// No controller answered at the configured address
    NotPresent,
    /// Controller reset or self-test failed
    ResetFailed,
    /// Descriptor ring setup failed
    RingSetupFailed,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotPresent => write!(f, "Network controller not present"),
            DeviceError::ResetFailed => write!(f, "Network controller reset failed"),
            DeviceError::RingSetupFailed => write!(f, "Descriptor ring setup failed"),
        }
    }
}

/// Errors that can occur during packet transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitError {
    /// Packet too large for the device
    PacketTooLarge,
    /// TX buffer is full, try again later
    BufferFull,
    /// Device is not ready
    NotReady,
    /// Hardware error during transmission
    HardwareError,
}

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransmitError::PacketTooLarge => write!(f, "Frame too large for device"),
            TransmitError::BufferFull => write!(f, "No free transmit descriptor"),
            TransmitError::NotReady => write!(f, "Device not ready"),
            TransmitError::HardwareError => write!(f, "Hardware transmit error"),
        }
    }
}

/// Network device trait that the NIC driver implements
///
/// The core never blocks on the device: it probes `can_transmit` before
/// pushing a frame and pulls received frames one at a time from `receive`.
pub trait NetworkDevice {
    /// Get the MAC address of this device
    fn mac_address(&self) -> MacAddr;

    /// Reset the controller and set up its descriptor rings
    fn init(&mut self) -> Result<(), DeviceError>;

    /// Stop the controller; called before handing control to a loaded image
    fn halt(&mut self);

    /// Driver housekeeping (reclaiming completed descriptors, refilling RX)
    ///
    /// Called once per network tick before frames are pulled.
    fn pump(&mut self) {}

    /// Transmit a frame
    ///
    /// # Arguments
    /// * `frame` - The raw Ethernet frame to transmit (including header)
    ///
    /// # Returns
    /// * `Ok(())` if the frame was handed to a descriptor
    /// * `Err(TransmitError)` if transmission failed
    fn transmit(&mut self, frame: &[u8]) -> Result<(), TransmitError>;

    /// Whether a transmit descriptor is free
    fn can_transmit(&self) -> bool;

    /// Receive a frame if one is available
    ///
    /// # Returns
    /// * `Some(frame)` if a frame was received
    /// * `None` if no frame is available
    fn receive(&mut self) -> Option<Vec<u8>>;

    /// Get the current link status
    fn link_status(&self) -> LinkStatus;

    /// Get device name/identifier
    fn device_name(&self) -> &str;
}
