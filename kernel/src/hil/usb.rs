// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Interface to USB device controller hardware.
//!
//! A device controller moves data for a USB protocol layer (the client). The
//! client configures endpoints, submits buffers as transfer requests and
//! gets each buffer back through [`DeviceClient::transfer_complete`] once the
//! controller retires the request. Control requests that the controller does
//! not handle itself are forwarded to [`DeviceClient::setup`].

use core::fmt;

use crate::ErrorCode;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Decodes the `bmAttributes` field of an endpoint descriptor.
    pub fn from_attributes(attributes: u8) -> TransferType {
        match attributes & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

/// Endpoint number and direction, encoded as in `bEndpointAddress`.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct EndpointAddress(u8);

impl EndpointAddress {
    pub fn new(endpoint: usize, direction: TransferDirection) -> Self {
        EndpointAddress(
            endpoint as u8 & 0xf
                | match direction {
                    TransferDirection::HostToDevice => 0,
                    TransferDirection::DeviceToHost => 1,
                } << 7,
        )
    }

    pub const fn new_const(endpoint: usize, direction: TransferDirection) -> Self {
        EndpointAddress(endpoint as u8 & 0xf | (direction as u8) << 7)
    }

    pub const fn from_raw(address: u8) -> Self {
        EndpointAddress(address & 0x8f)
    }

    pub const fn raw(&self) -> u8 {
        self.0
    }

    pub const fn number(&self) -> usize {
        (self.0 & 0xf) as usize
    }

    pub fn direction(&self) -> TransferDirection {
        match self.0 & (1 << 7) {
            0 => TransferDirection::HostToDevice,
            _ => TransferDirection::DeviceToHost,
        }
    }

    pub fn is_in(&self) -> bool {
        self.direction() == TransferDirection::DeviceToHost
    }
}

impl fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ep{}{}",
            self.number(),
            if self.is_in() { "in" } else { "out" }
        )
    }
}

#[derive(Copy, Clone, Debug)]
pub struct EndpointDescriptor {
    pub endpoint_address: EndpointAddress,
    pub transfer_type: TransferType,
    /// `wMaxPacketSize`, including the additional-transactions bits 11-12 of
    /// high-bandwidth isochronous endpoints.
    pub max_packet_size: u16,
    // Poll for device data every `interval` frames
    pub interval: u8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceSpeed {
    Unknown,
    Low,
    Full,
    High,
}

/// USB device states, chapter 9.1 of the USB 2.0 specification.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    NotAttached,
    Attached,
    Powered,
    Default,
    Address,
    Configured,
    Suspended,
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceRequestType(u8);

impl DeviceRequestType {
    pub const fn new(raw: u8) -> Self {
        DeviceRequestType(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub fn transfer_direction(self) -> TransferDirection {
        match self.0 & (1 << 7) {
            0 => TransferDirection::HostToDevice,
            _ => TransferDirection::DeviceToHost,
        }
    }

    pub fn request_type(self) -> RequestType {
        match (self.0 & (0b11 << 5)) >> 5 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    pub fn recipient(self) -> Recipient {
        match self.0 & 0b11111 {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }
}

impl fmt::Debug for DeviceRequestType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{{:?}, {:?}, {:?}}}",
            self.transfer_direction(),
            self.request_type(),
            self.recipient()
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
    Reserved,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
    Reserved,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FeatureSelector {
    DeviceRemoteWakeup,
    EndpointHalt,
    TestMode,
    Unknown,
}

impl FeatureSelector {
    pub fn get(value: u16) -> Self {
        match value {
            0 => FeatureSelector::EndpointHalt,
            1 => FeatureSelector::DeviceRemoteWakeup,
            2 => FeatureSelector::TestMode,
            _ => FeatureSelector::Unknown,
        }
    }
}

/// The 8-byte SETUP packet of a control transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SetupData {
    pub request_type: DeviceRequestType,
    pub request_code: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupData {
    /// Create a `SetupData` structure from a packet received from the wire
    pub fn from_bytes(p: &[u8; 8]) -> Self {
        SetupData {
            request_type: DeviceRequestType(p[0]),
            request_code: p[1],
            value: u16::from_le_bytes([p[2], p[3]]),
            index: u16::from_le_bytes([p[4], p[5]]),
            length: u16::from_le_bytes([p[6], p[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type.0,
            self.request_code,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// If the `SetupData` represents a standard device request, return it
    pub fn get_standard_request(&self) -> Option<StandardRequest> {
        match self.request_type.request_type() {
            RequestType::Standard => match self.request_code {
                0 => Some(StandardRequest::GetStatus {
                    recipient_index: self.index,
                }),
                1 => Some(StandardRequest::ClearFeature {
                    feature: FeatureSelector::get(self.value),
                    recipient_index: self.index,
                }),
                3 => Some(StandardRequest::SetFeature {
                    feature: FeatureSelector::get(self.value),
                    test_mode: (self.index >> 8) as u8,
                    recipient_index: self.index & 0xff,
                }),
                5 => Some(StandardRequest::SetAddress {
                    device_address: self.value,
                }),
                6 => Some(StandardRequest::GetDescriptor {
                    descriptor_type: (self.value >> 8) as u8,
                    descriptor_index: (self.value & 0xff) as u8,
                    lang_id: self.index,
                    requested_length: self.length,
                }),
                8 => Some(StandardRequest::GetConfiguration),
                9 => Some(StandardRequest::SetConfiguration {
                    configuration_value: (self.value & 0xff) as u8,
                }),
                10 => Some(StandardRequest::GetInterface {
                    interface: self.index,
                }),
                11 => Some(StandardRequest::SetInterface),
                12 => Some(StandardRequest::SynchFrame),
                _ => None,
            },
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StandardRequest {
    GetStatus {
        recipient_index: u16,
    },
    ClearFeature {
        feature: FeatureSelector,
        recipient_index: u16,
    },
    SetFeature {
        feature: FeatureSelector,
        test_mode: u8,
        recipient_index: u16,
    },
    SetAddress {
        device_address: u16,
    },
    GetDescriptor {
        descriptor_type: u8,
        descriptor_index: u8,
        lang_id: u16,
        requested_length: u16,
    },
    GetConfiguration,
    SetConfiguration {
        configuration_value: u8,
    },
    GetInterface {
        interface: u16,
    },
    SetInterface,
    SynchFrame,
}

/// Per-request options.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// End the transfer with a short or zero-length packet when the length
    /// is a multiple of the endpoint's max packet size.
    pub zero: bool,
    /// Do not raise a completion interrupt for this request. It is still
    /// retired once a later request on the endpoint completes.
    pub no_interrupt: bool,
}

impl RequestFlags {
    pub const NONE: RequestFlags = RequestFlags {
        zero: false,
        no_interrupt: false,
    };
}

/// Handle for a submitted request, valid until the request is retired.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RequestId(u32);

impl RequestId {
    pub const fn new(raw: u32) -> Self {
        RequestId(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// Why a request finished without transferring its data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TransferError {
    /// The endpoint halted (STALL handshake).
    Stalled,
    /// Buffer overrun/underrun, or a transmit that ended early.
    Protocol,
    /// Bus-level transaction error (CRC, timeout, bit stuffing).
    Transaction,
    /// Cancelled with [`UsbDeviceController::request_cancel`].
    ConnectionReset,
    /// Retired because the endpoint was disabled or flushed, or the
    /// controller was reset.
    Shutdown,
}

impl From<TransferError> for ErrorCode {
    fn from(err: TransferError) -> ErrorCode {
        match err {
            TransferError::Stalled => ErrorCode::FAIL,
            TransferError::Protocol => ErrorCode::SIZE,
            TransferError::Transaction => ErrorCode::NOACK,
            TransferError::ConnectionReset => ErrorCode::CANCEL,
            TransferError::Shutdown => ErrorCode::OFF,
        }
    }
}

/// USB device controller interface.
pub trait UsbDeviceController<'a> {
    fn set_client(&self, client: &'a dyn DeviceClient<'a>);

    /// Configures a non-control endpoint.
    fn endpoint_enable(&self, descriptor: &EndpointDescriptor) -> Result<(), ErrorCode>;

    /// Disables an endpoint, retiring its queued requests with
    /// `TransferError::Shutdown`.
    fn endpoint_disable(&self, endpoint: EndpointAddress) -> Result<(), ErrorCode>;

    /// Queues `length` bytes of `buffer` for transfer on `endpoint`. On
    /// endpoint 0 the direction is that of the current control transfer.
    ///
    /// On error the buffer is handed back and no completion follows.
    fn request_submit(
        &self,
        endpoint: EndpointAddress,
        buffer: &'a mut [u8],
        length: usize,
        flags: RequestFlags,
    ) -> Result<RequestId, (ErrorCode, &'a mut [u8])>;

    /// Cancels a queued request. The request completes with
    /// `TransferError::ConnectionReset` before this returns. Returns `INVAL`
    /// if `id` is not queued on `endpoint`.
    fn request_cancel(&self, endpoint: EndpointAddress, id: RequestId) -> Result<(), ErrorCode>;

    /// Sets or clears the halt (STALL) condition of an endpoint.
    fn endpoint_set_halt(&self, endpoint: EndpointAddress, halt: bool) -> Result<(), ErrorCode>;

    /// Discards data buffered in the endpoint's FIFO.
    fn endpoint_fifo_flush(&self, endpoint: EndpointAddress);

    /// Current (micro)frame number.
    fn frame_number(&self) -> u16;

    /// Signals remote wakeup to a suspended host.
    fn wakeup(&self) -> Result<(), ErrorCode>;

    /// Connects (`true`) or disconnects the data-line pull-up.
    fn pullup(&self, on: bool);

    /// Reports VBUS presence from an external transceiver.
    fn vbus_session(&self, active: bool);

    fn speed(&self) -> DeviceSpeed;

    fn device_state(&self) -> DeviceState;
}

/// USB device controller client interface.
pub trait DeviceClient<'a> {
    /// A control request the controller does not handle itself. Returning
    /// an error stalls endpoint 0. Requests with a data stage are answered by
    /// submitting a request on endpoint 0.
    fn setup(&self, setup: &SetupData) -> Result<(), ErrorCode>;

    /// A request was retired. `actual` bytes of `buffer` were transferred.
    fn transfer_complete(
        &self,
        endpoint: EndpointAddress,
        id: RequestId,
        buffer: &'a mut [u8],
        actual: usize,
        result: Result<(), TransferError>,
    );

    /// The host reset or the controller shut down; all requests have been
    /// retired.
    fn disconnect(&self);

    fn suspend(&self);

    fn resume(&self);
}
