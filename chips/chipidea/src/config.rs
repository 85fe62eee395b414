// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! Controller configuration.
//!
//! Tracing is selected at compile time through cargo features, mirroring the
//! kernel's `CONFIG`. Everything a board may want to choose per instance lives
//! in [`UdcConfig`], passed to [`crate::Udc::new`].

/// Compile-time switches.
pub(crate) struct Config {
    /// Log every request submission and retirement.
    pub(crate) trace_transfers: bool,

    /// Log every SETUP packet and ep0 state change.
    pub(crate) trace_setup: bool,
}

pub(crate) const CONFIG: Config = Config {
    trace_transfers: cfg!(feature = "trace_transfers"),
    trace_setup: cfg!(feature = "trace_setup"),
};

/// Transceiver interface wired to the controller, programmed into
/// `PORTSC1.PTS`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PhyInterface {
    Utmi,
    Ulpi,
    Serial,
}

/// How a bus reset interrupt is handled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetPolicy {
    /// Every reset interrupt is a USB bus reset: flush queues and return
    /// to the Default state.
    AlwaysBusReset,
    /// Check `PORTSC1.PR`. With port reset asserted behave as a bus reset,
    /// otherwise reinitialize the whole controller.
    InspectPortReset,
}

#[derive(Copy, Clone, Debug)]
pub struct UdcConfig {
    pub phy: PhyInterface,
    /// 16-bit UTMI data path.
    pub phy_wide: bool,
    pub reset_policy: ResetPolicy,
    /// Reported in the device GET_STATUS reply.
    pub self_powered: bool,
    /// Delay before acknowledging SET_ADDRESS. Some hosts need about 1ms.
    pub set_address_delay_us: u32,
    /// Largest payload carried by a single dTD.
    pub max_descriptor_payload: usize,
    pub reset_timeout_us: u32,
    pub run_timeout_us: u32,
    pub flush_timeout_us: u32,
    pub test_mode_ack_timeout_us: u32,
    pub prime_drain_timeout_us: u32,
}

impl UdcConfig {
    pub const DEFAULT: UdcConfig = UdcConfig {
        phy: PhyInterface::Utmi,
        phy_wide: false,
        reset_policy: ResetPolicy::AlwaysBusReset,
        self_powered: true,
        set_address_delay_us: 1000,
        max_descriptor_payload: crate::descriptors::DTD_MAX_PAYLOAD,
        reset_timeout_us: 1000,
        run_timeout_us: 1000,
        flush_timeout_us: 1000,
        test_mode_ack_timeout_us: 1_000_000,
        prime_drain_timeout_us: 1_000_000,
    };
}
