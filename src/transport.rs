//! Command/response channel to the instrument.
//!
//! The instrument enumerates as a vendor-specific USB device with one bulk OUT
//! endpoint for ASCII commands (optionally followed by binary payload) and one
//! bulk IN endpoint returning a single packet of at most 64 bytes per command.

use futures::executor::block_on;
use log::{debug, info};
use nusb::transfer::RequestBuffer;

use crate::errors::{DriverError, Result};

/// Default USB vendor ID of the instrument.
pub const DEFAULT_VID: u16 = 0xa0a0;
/// Default USB product ID of the instrument.
pub const DEFAULT_PID: u16 = 0x0002;
/// Size of one response packet.
pub const RESPONSE_SIZE: usize = 64;

const ENDPOINT_OUT: u8 = 0x01;
const ENDPOINT_IN: u8 = 0x81;
const INTERFACE: u8 = 0;

/// A blocking request/response channel: one command in flight at a time.
pub trait Transport: Send {
    fn query(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// Strings reported by the USB device descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Bulk-endpoint transport built on `nusb`.
pub struct UsbTransport {
    interface: nusb::Interface,
    identity: DeviceIdentity,
}

impl UsbTransport {
    /// Open the first device matching `vid`/`pid` and claim its interface.
    pub fn open(vid: u16, pid: u16) -> Result<Self> {
        let info = nusb::list_devices()?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(DriverError::DeviceNotFound { vid, pid })?;

        let identity = DeviceIdentity {
            manufacturer: info.manufacturer_string().map(str::to_string),
            product: info.product_string().map(str::to_string),
            serial_number: info.serial_number().map(str::to_string),
        };

        let device = info.open()?;
        let interface = device.claim_interface(INTERFACE)?;

        info!(
            "USB interface connected: {} {} (serial {})",
            identity.manufacturer.as_deref().unwrap_or("?"),
            identity.product.as_deref().unwrap_or("?"),
            identity.serial_number.as_deref().unwrap_or("?"),
        );

        Ok(Self {
            interface,
            identity,
        })
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }
}

impl Transport for UsbTransport {
    fn query(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        block_on(self.interface.bulk_out(ENDPOINT_OUT, command.to_vec())).into_result()?;
        let response = block_on(
            self.interface
                .bulk_in(ENDPOINT_IN, RequestBuffer::new(RESPONSE_SIZE)),
        )
        .into_result()?;
        debug!(
            "usb: {:?} -> {:02X?}",
            String::from_utf8_lossy(command),
            response
        );
        Ok(response)
    }
}
