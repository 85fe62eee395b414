// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Control endpoint state.
//!
//! ```text
//!                 SETUP
//!   WaitForSetup -------> DataXmit / DataRecv --data done--> WaitForOutStatus
//!        ^     \                                                  |
//!        |      `-- no data stage ----------------------------->  |
//!        `------------------------- status done -----------------'
//! ```
//!
//! Any state may move to `Stalled`; the next SETUP packet leaves it.
//!
//! The requests answered without the client are decoded here by
//! [`local_request`]; the controller in `udc.rs` carries them out.

use core::cell::Cell;

use kernel::debug_verbose;
use kernel::hil::usb::{
    EndpointAddress, FeatureSelector, Recipient, RequestType, SetupData, StandardRequest,
    TransferDirection,
};
use kernel::utilities::cells::OptionalCell;

use crate::config::CONFIG;

/// Max packet size of endpoint 0.
pub const EP0_MAX_PACKET: u16 = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ep0State {
    WaitForSetup,
    /// Data stage towards the host.
    DataXmit,
    /// Data stage from the host.
    DataRecv,
    /// Status stage queued; this name covers both status directions.
    WaitForOutStatus,
    Stalled,
}

/// State of the control transfer in progress.
pub struct ControlContext {
    state: Cell<Ep0State>,
    /// Direction requests queued on endpoint 0 go.
    is_in: Cell<bool>,
    setup: Cell<[u8; 8]>,
    /// Address from SET_ADDRESS, applied once its status stage completes.
    pending_address: OptionalCell<u8>,
    remote_wakeup: Cell<bool>,
}

impl ControlContext {
    pub const fn new() -> ControlContext {
        ControlContext {
            state: Cell::new(Ep0State::WaitForSetup),
            is_in: Cell::new(false),
            setup: Cell::new([0; 8]),
            pending_address: OptionalCell::empty(),
            remote_wakeup: Cell::new(false),
        }
    }

    pub fn state(&self) -> Ep0State {
        self.state.get()
    }

    pub fn set_state(&self, state: Ep0State) {
        if CONFIG.trace_setup && self.state.get() != state {
            debug_verbose!("chipidea: ep0 {:?} -> {:?}", self.state.get(), state);
        }
        self.state.set(state);
    }

    pub fn is_in(&self) -> bool {
        self.is_in.get()
    }

    pub fn direction(&self) -> TransferDirection {
        if self.is_in.get() {
            TransferDirection::DeviceToHost
        } else {
            TransferDirection::HostToDevice
        }
    }

    pub fn set_direction(&self, is_in: bool) {
        self.is_in.set(is_in);
    }

    /// Raw bytes of the last SETUP packet.
    pub fn setup(&self) -> [u8; 8] {
        self.setup.get()
    }

    pub fn store_setup(&self, packet: [u8; 8]) {
        self.setup.set(packet);
    }

    pub fn set_pending_address(&self, address: u8) {
        self.pending_address.set(address);
    }

    pub fn take_pending_address(&self) -> Option<u8> {
        self.pending_address.take()
    }

    pub fn remote_wakeup(&self) -> bool {
        self.remote_wakeup.get()
    }

    pub fn set_remote_wakeup(&self, enabled: bool) {
        self.remote_wakeup.set(enabled);
    }

    /// Back to the state after a bus reset.
    pub fn reset(&self) {
        self.state.set(Ep0State::WaitForSetup);
        self.is_in.set(false);
        self.pending_address.clear();
        self.remote_wakeup.set(false);
    }
}

/// Standard requests the controller answers itself.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LocalRequest {
    GetStatus {
        recipient: Recipient,
        index: u16,
    },
    SetAddress(u8),
    EndpointHalt {
        endpoint: EndpointAddress,
        halt: bool,
    },
    RemoteWakeup(bool),
    TestMode(u8),
}

/// Decides whether `setup` is handled locally. `endpoints` is the number of
/// endpoints the controller has; halts addressed beyond it go to the client.
pub fn local_request(setup: &SetupData, endpoints: usize) -> Option<LocalRequest> {
    let request_type = setup.request_type;
    if request_type.request_type() != RequestType::Standard {
        return None;
    }
    match setup.get_standard_request()? {
        StandardRequest::GetStatus { recipient_index } => {
            if request_type.transfer_direction() != TransferDirection::DeviceToHost {
                return None;
            }
            Some(LocalRequest::GetStatus {
                recipient: request_type.recipient(),
                index: recipient_index,
            })
        }
        StandardRequest::SetAddress { device_address } => {
            if request_type.raw() != 0x00 {
                return None;
            }
            Some(LocalRequest::SetAddress((device_address & 0x7f) as u8))
        }
        StandardRequest::SetFeature {
            feature: FeatureSelector::TestMode,
            test_mode,
            ..
        } if request_type.raw() == 0x00 => Some(LocalRequest::TestMode(test_mode)),
        StandardRequest::SetFeature { feature, .. } => feature_request(setup, feature, true, endpoints),
        StandardRequest::ClearFeature { feature, .. } => {
            feature_request(setup, feature, false, endpoints)
        }
        _ => None,
    }
}

fn feature_request(
    setup: &SetupData,
    feature: FeatureSelector,
    set: bool,
    endpoints: usize,
) -> Option<LocalRequest> {
    match (setup.request_type.recipient(), feature) {
        (Recipient::Endpoint, FeatureSelector::EndpointHalt) => {
            let endpoint = EndpointAddress::from_raw(setup.index as u8);
            if setup.length != 0 || endpoint.number() >= endpoints {
                return None;
            }
            Some(LocalRequest::EndpointHalt {
                endpoint,
                halt: set,
            })
        }
        (Recipient::Device, FeatureSelector::DeviceRemoteWakeup) => {
            Some(LocalRequest::RemoteWakeup(set))
        }
        _ => None,
    }
}

/// The test packet of USB 2.0 section 7.1.20, sent in `TEST_PACKET` mode.
pub const TEST_PACKET: [u8; 53] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
    0xaa, 0xee, 0xee, 0xee, 0xee, 0xee, 0xee, 0xee, 0xee, 0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0x7f, 0xbf, 0xdf, 0xef, 0xf7, 0xfb, 0xfd, 0xfc, 0x7e, 0xbf, 0xdf,
    0xef, 0xf7, 0xfb, 0xfd, 0x7e,
];

#[cfg(test)]
mod test {
    use super::*;

    fn setup(bytes: [u8; 8]) -> SetupData {
        SetupData::from_bytes(&bytes)
    }

    #[test]
    fn decodes_local_requests() {
        assert_eq!(
            local_request(&setup([0x80, 0, 0, 0, 0, 0, 2, 0]), 4),
            Some(LocalRequest::GetStatus {
                recipient: Recipient::Device,
                index: 0,
            })
        );
        assert_eq!(
            local_request(&setup([0x00, 5, 0x05, 0, 0, 0, 0, 0]), 4),
            Some(LocalRequest::SetAddress(5))
        );
        assert_eq!(
            local_request(&setup([0x02, 3, 0, 0, 0x81, 0, 0, 0]), 4),
            Some(LocalRequest::EndpointHalt {
                endpoint: EndpointAddress::from_raw(0x81),
                halt: true,
            })
        );
        assert_eq!(
            local_request(&setup([0x00, 1, 1, 0, 0, 0, 0, 0]), 4),
            Some(LocalRequest::RemoteWakeup(false))
        );
        assert_eq!(
            local_request(&setup([0x00, 3, 2, 0, 0, 4, 0, 0]), 4),
            Some(LocalRequest::TestMode(4))
        );
    }

    #[test]
    fn other_requests_go_to_the_client() {
        // GET_DESCRIPTOR
        assert_eq!(local_request(&setup([0x80, 6, 0, 1, 0, 0, 0x12, 0]), 4), None);
        // Class request reusing the GET_STATUS code.
        assert_eq!(local_request(&setup([0xa1, 0, 0, 0, 0, 0, 1, 0]), 4), None);
        // SET_ADDRESS with a non-standard request type.
        assert_eq!(local_request(&setup([0x01, 5, 3, 0, 0, 0, 0, 0]), 4), None);
        // Halt on an endpoint the controller does not have.
        assert_eq!(local_request(&setup([0x02, 3, 0, 0, 0x07, 0, 0, 0]), 4), None);
        // Interface feature.
        assert_eq!(local_request(&setup([0x01, 3, 0, 0, 0, 0, 0, 0]), 4), None);
    }

    #[test]
    fn reset_clears_transfer_state() {
        let ctx = ControlContext::new();
        ctx.set_state(Ep0State::Stalled);
        ctx.set_direction(true);
        ctx.set_pending_address(9);
        ctx.set_remote_wakeup(true);
        ctx.reset();
        assert_eq!(ctx.state(), Ep0State::WaitForSetup);
        assert!(!ctx.is_in());
        assert_eq!(ctx.take_pending_address(), None);
        assert!(!ctx.remote_wakeup());
    }
}
