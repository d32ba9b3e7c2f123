//! Termios to device-control-block translation, and applying it atomically.

use super::native::{CommDevice, Dcb, DcbFlags, NativeParity, NativeStopBits, STANDARD_RATES};
use crate::error::{Result, TermiosError};
use crate::termios::{
    resolve, BaudSetting, CommTimeouts, ControlFlags, InputFlags, Termios, VEOF, VSTART, VSTOP,
};
use tracing::{debug, trace, warn};

/// Driver tuning that does not come from termios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DcbLimits {
    pub xon_lim: u16,
    pub xoff_lim: u16,
    /// Base clock for custom divisors when the device reports none.
    pub baud_base: u32,
}

/// The termios fields that feed the control block. Equal fingerprints
/// produce equal control blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    speed: u32,
    ispeed: u32,
    cflag: ControlFlags,
    iflag: InputFlags,
    xon: u8,
    xoff: u8,
    eof: u8,
}

impl Fingerprint {
    pub fn of(termios: &Termios) -> Self {
        Self {
            speed: termios.c_ospeed,
            ispeed: termios.c_ispeed,
            cflag: termios.c_cflag,
            iflag: termios.c_iflag,
            xon: termios.c_cc[VSTART],
            xoff: termios.c_cc[VSTOP],
            eof: termios.c_cc[VEOF],
        }
    }
}

/// What was last programmed into a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Applied {
    pub fingerprint: Option<Fingerprint>,
    pub dcb: Option<Dcb>,
    pub timeouts: Option<CommTimeouts>,
}

fn parity_of(cflag: ControlFlags) -> NativeParity {
    if !cflag.contains(ControlFlags::PARENB) {
        return NativeParity::None;
    }
    match (
        cflag.contains(ControlFlags::PARODD),
        cflag.contains(ControlFlags::CMSPAR),
    ) {
        (true, true) => NativeParity::Mark,
        (true, false) => NativeParity::Odd,
        (false, true) => NativeParity::Space,
        (false, false) => NativeParity::Even,
    }
}

/// Build the control block for `termios`.
///
/// Only the output speed is programmed; an input speed of 0 means "same as
/// output", any other differing input speed is rejected.
pub fn build_dcb(
    termios: &Termios,
    limits: &DcbLimits,
    base_clock: Option<u32>,
) -> Result<(Dcb, BaudSetting<u32>)> {
    let speed = termios.c_ospeed;
    if termios.c_ispeed != 0 && termios.c_ispeed != speed {
        return Err(TermiosError::invalid(format!(
            "split speeds ({} in, {} out) are not supported",
            termios.c_ispeed, speed
        )));
    }
    let baud = resolve(
        speed,
        STANDARD_RATES,
        Some(base_clock.unwrap_or(limits.baud_base)),
    )?;

    let cflag = termios.c_cflag;
    let iflag = termios.c_iflag;

    let mut flags = DcbFlags::BINARY | DcbFlags::DTR_CONTROL_ENABLE;
    if cflag.contains(ControlFlags::PARENB) {
        flags |= DcbFlags::PARITY;
    }
    if iflag.contains(InputFlags::IXON) {
        flags |= DcbFlags::OUTX;
    }
    if iflag.contains(InputFlags::IXOFF) {
        flags |= DcbFlags::INX;
    }
    if iflag.contains(InputFlags::IXANY) {
        flags |= DcbFlags::TX_CONTINUE_ON_XOFF;
    }
    if cflag.contains(ControlFlags::CRTSCTS) {
        flags |= DcbFlags::OUTX_CTS_FLOW | DcbFlags::RTS_CONTROL_HANDSHAKE;
    } else {
        flags |= DcbFlags::RTS_CONTROL_ENABLE;
    }

    let dcb = Dcb {
        baud_rate: baud.actual_rate(),
        flags,
        xon_lim: limits.xon_lim,
        xoff_lim: limits.xoff_lim,
        byte_size: termios.char_size().bits(),
        parity: parity_of(cflag),
        stop_bits: if cflag.contains(ControlFlags::CSTOPB) {
            NativeStopBits::Two
        } else {
            NativeStopBits::One
        },
        xon_char: termios.c_cc[VSTART],
        xoff_char: termios.c_cc[VSTOP],
        error_char: 0,
        eof_char: termios.c_cc[VEOF],
        evt_char: b'\n',
    };
    Ok((dcb, baud))
}

/// Program `termios` into `device`, skipping steps whose inputs did not change.
///
/// Either everything succeeds and `applied` is updated, or the device is
/// left as it was and `applied` is untouched.
pub fn apply_termios<D: CommDevice + ?Sized>(
    device: &D,
    applied: &mut Applied,
    termios: &Termios,
    limits: &DcbLimits,
) -> Result<()> {
    let fingerprint = Fingerprint::of(termios);
    let mode = termios.read_mode();
    let timeouts = mode.comm_timeouts();

    let new_dcb = if applied.fingerprint == Some(fingerprint) {
        trace!("control block unchanged, skipping SetCommState");
        None
    } else {
        let (dcb, baud) = build_dcb(termios, limits, device.base_clock())?;
        if let BaudSetting::Custom(c) = baud {
            debug!(
                "Custom divisor {} for {} baud (actual {})",
                c.divisor, c.requested, c.actual
            );
        }
        Some(dcb)
    };

    if let Some(dcb) = &new_dcb {
        device.set_state(dcb).map_err(TermiosError::from_native)?;
    }

    if applied.timeouts != Some(timeouts) {
        if !mode.is_exact() {
            debug!(
                "{:?}: inter-byte timer approximated by native interval timeout",
                mode
            );
        }
        if let Err(e) = device.set_timeouts(&timeouts) {
            if new_dcb.is_some() {
                if let Some(previous) = &applied.dcb {
                    if let Err(restore) = device.set_state(previous) {
                        warn!("Restoring previous control block failed: {}", restore);
                    }
                }
            }
            return Err(TermiosError::from_native(e));
        }
    }

    if let Some(dcb) = new_dcb {
        applied.dcb = Some(dcb);
        applied.fingerprint = Some(fingerprint);
    }
    applied.timeouts = Some(timeouts);
    Ok(())
}
