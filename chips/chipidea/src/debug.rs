// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2024.

//! State dumps for debugging a wedged controller.
//!
//! Boards can call [`Udc::dump`] from a panic handler or a debug console
//! command, in the same place they print the chip state.

use core::fmt::{self, Write};

use kernel::hil::usb::UsbDeviceController;
use kernel::utilities::registers::{LocalRegisterCopy, RegisterLongName};

use crate::chain::chain_indices;
use crate::registers::*;
use crate::udc::Udc;

/// Decodes the bits of `USBSTS` or `USBINTR`.
#[derive(Copy, Clone)]
pub struct UsbstsFlags(pub u32);

impl fmt::Debug for UsbstsFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status: LocalRegisterCopy<u32, Interrupt::Register> = LocalRegisterCopy::new(self.0);
        flags(
            f,
            &[
                (status.is_set(Interrupt::UI), "UI"),
                (status.is_set(Interrupt::UEI), "UEI"),
                (status.is_set(Interrupt::PCI), "PCI"),
                (status.is_set(Interrupt::FRI), "FRI"),
                (status.is_set(Interrupt::SEI), "SEI"),
                (status.is_set(Interrupt::URI), "URI"),
                (status.is_set(Interrupt::SRI), "SRI"),
                (status.is_set(Interrupt::SLI), "SLI"),
            ],
        )
    }
}

/// Decodes `PORTSC1`.
#[derive(Copy, Clone)]
pub struct PortscFlags(pub u32);

impl fmt::Debug for PortscFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let port: LocalRegisterCopy<u32, PortStatus::Register> = LocalRegisterCopy::new(self.0);
        flags(
            f,
            &[
                (port.is_set(PortStatus::CCS), "CCS"),
                (port.is_set(PortStatus::PE), "PE"),
                (port.is_set(PortStatus::FPR), "FPR"),
                (port.is_set(PortStatus::SUSP), "SUSP"),
                (port.is_set(PortStatus::PR), "PR"),
                (port.is_set(PortStatus::HSP), "HSP"),
            ],
        )?;
        match port.read_as_enum(PortStatus::PSPD) {
            Some(PortStatus::PSPD::Value::Full) => f.write_str(", full speed")?,
            Some(PortStatus::PSPD::Value::Low) => f.write_str(", low speed")?,
            Some(PortStatus::PSPD::Value::High) => f.write_str(", high speed")?,
            None => f.write_str(", speed ?")?,
        }
        match port.read(PortStatus::PTC) {
            0 => Ok(()),
            mode => write!(f, ", test mode {}", mode),
        }
    }
}

fn flags(f: &mut fmt::Formatter, bits: &[(bool, &str)]) -> fmt::Result {
    let mut first = true;
    for (_, name) in bits.iter().filter(|(set, _)| *set) {
        if !first {
            f.write_str(" | ")?;
        }
        f.write_str(name)?;
        first = false;
    }
    if first {
        f.write_str("-")?;
    }
    Ok(())
}

impl<'a, H: UdcHardware> Udc<'a, H> {
    /// Writes the driver state, the register file and every enabled endpoint
    /// with the requests queued on it.
    pub fn dump(&self, out: &mut dyn Write) -> fmt::Result {
        writeln!(
            out,
            "chipidea: {}, {:?}, {:?} speed, ep0 {:?} {:?}",
            if self.is_stopped() { "stopped" } else { "running" },
            self.usb_state(),
            self.speed(),
            self.ep0_state(),
            self.ep0_direction(),
        )?;

        let hw = self.hw();
        dump_register(out, hw, DCIVERSION)?;
        dump_register(out, hw, DCCPARAMS)?;
        dump_register(out, hw, USBCMD)?;
        let status = hw.get(USBSTS).get();
        writeln!(out, "  {:<16}{:#010x} {:?}", USBSTS.name(), status, UsbstsFlags(status))?;
        let enabled = hw.get(USBINTR).get();
        writeln!(out, "  {:<16}{:#010x} {:?}", USBINTR.name(), enabled, UsbstsFlags(enabled))?;
        dump_register(out, hw, FRINDEX)?;
        dump_register(out, hw, DEVICEADDR)?;
        dump_register(out, hw, ENDPOINTLISTADDR)?;
        let port = hw.get(PORTSC1).get();
        writeln!(out, "  {:<16}{:#010x} {:?}", PORTSC1.name(), port, PortscFlags(port))?;
        for reg in [
            OTGSC,
            ENDPTSETUPSTAT,
            ENDPTPRIME,
            ENDPTFLUSH,
            ENDPTSTATUS,
            ENDPTCOMPLETE,
        ] {
            dump_register(out, hw, reg)?;
        }
        dump_register(out, hw, USBMODE)?;

        let pool = self.pool();
        writeln!(
            out,
            "  dTDs free {}/{}, requests outstanding {}",
            pool.available(),
            pool.capacity(),
            self.requests().outstanding()
        )?;

        for number in 0..self.num_endpoints() {
            writeln!(
                out,
                "  ENDPTCTRL{:<7}{:#010x}",
                number,
                hw.get(endptctrl(number)).get()
            )?;
        }

        for queue in 0..2 * self.num_endpoints() {
            let ep = self.endpoint_at(queue);
            if !ep.enabled.get() && ep.is_empty() {
                continue;
            }
            let address = ep.address.get();
            let qh = self.queue_head(address.number(), address.is_in());
            writeln!(
                out,
                "  {:?} {:?} mps {}{}{} dQH current {:#010x} next {:#010x}",
                address,
                ep.transfer_type.get(),
                ep.max_packet.get(),
                if ep.stopped.get() { " stopped" } else { "" },
                if ep.flushing.get() { " flushing" } else { "" },
                qh.current(),
                qh.next_raw(),
            )?;
            let requests = self.requests();
            for slot in ep.iter(requests) {
                let request = requests.get(slot);
                write!(
                    out,
                    "    {:?} {:?} len {} actual {}",
                    request.id.get(),
                    request.direction(),
                    request.length.get(),
                    request.actual.get(),
                )?;
                if request.internal.get() {
                    out.write_str(" (ctrl)")?;
                }
                if let Some(chain) = request.chain.get() {
                    out.write_str(" dTDs")?;
                    for index in chain_indices(pool, &chain) {
                        let dtd = pool.get(index);
                        write!(
                            out,
                            " {:#010x}:{:#010x}",
                            pool.dma_address(index),
                            dtd.token()
                        )?;
                    }
                }
                out.write_str("\n")?;
            }
        }
        Ok(())
    }
}

fn dump_register<H: UdcHardware, R: RegisterLongName>(
    out: &mut dyn Write,
    hw: &H,
    reg: Register<R>,
) -> fmt::Result {
    writeln!(out, "  {:<16}{:#010x}", reg.name(), hw.get(reg).get())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::*;
    use kernel::hil::usb::{EndpointDescriptor, RequestFlags, TransferType};
    use std::format;
    use std::string::String;

    #[test]
    fn decodes_status_bits() {
        assert_eq!(format!("{:?}", UsbstsFlags(0x141)), "UI | URI | SLI");
        assert_eq!(format!("{:?}", UsbstsFlags(0)), "-");
        assert_eq!(
            format!("{:?}", PortscFlags((2 << 26) | (1 << 7) | 1)),
            "CCS | SUSP, high speed"
        );
        assert_eq!(
            format!("{:?}", PortscFlags(4 << 16)),
            "-, full speed, test mode 4"
        );
    }

    #[test]
    fn dump_lists_queued_requests() {
        let f = started();
        let address = ep(1, true);
        f.udc
            .endpoint_enable(&EndpointDescriptor {
                endpoint_address: address,
                transfer_type: TransferType::Bulk,
                max_packet_size: 512,
                interval: 0,
            })
            .unwrap();
        f.udc
            .request_submit(address, buffer(100), 100, RequestFlags::NONE)
            .unwrap();

        let mut out = String::new();
        f.udc.dump(&mut out).unwrap();
        assert!(out.starts_with(
            "chipidea: running, Default, High speed, ep0 WaitForSetup HostToDevice"
        ));
        assert!(out.contains("DCIVERSION"));
        assert!(out.contains("PORTSC1"));
        assert!(out.contains("high speed"));
        assert!(out.contains("ep1in Bulk mps 512 dQH current 0x00000000 next 0x20000000"));
        assert!(out.contains("DeviceToHost len 100 actual 0 dTDs 0x20000000:"));
        assert!(out.contains("dTDs free 31/32, requests outstanding 1"));
    }
}
