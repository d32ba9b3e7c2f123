//! Host speed constants and non-standard rates.

use crate::termios::{resolve, BaudError, BaudSetting};
use libc::speed_t;

/// Every `B*` constant the host defines, keyed by rate.
pub(super) fn rate_table() -> Vec<(u32, speed_t)> {
    #[allow(unused_mut)]
    let mut table = vec![
        (0, libc::B0),
        (50, libc::B50),
        (75, libc::B75),
        (110, libc::B110),
        (134, libc::B134),
        (150, libc::B150),
        (200, libc::B200),
        (300, libc::B300),
        (600, libc::B600),
        (1200, libc::B1200),
        (1800, libc::B1800),
        (2400, libc::B2400),
        (4800, libc::B4800),
        (9600, libc::B9600),
        (19200, libc::B19200),
        (38400, libc::B38400),
        (57600, libc::B57600),
        (115200, libc::B115200),
        (230400, libc::B230400),
    ];
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    table.extend([
        (7200, libc::B7200),
        (14400, libc::B14400),
        (28800, libc::B28800),
        (76800, libc::B76800),
    ]);
    #[cfg(any(target_os = "linux", target_os = "android"))]
    table.extend([
        (460800, libc::B460800),
        (500000, libc::B500000),
        (576000, libc::B576000),
        (921600, libc::B921600),
        (1000000, libc::B1000000),
        (1152000, libc::B1152000),
        (1500000, libc::B1500000),
        (2000000, libc::B2000000),
        (2500000, libc::B2500000),
        (3000000, libc::B3000000),
        (3500000, libc::B3500000),
        (4000000, libc::B4000000),
    ]);
    table
}

/// Resolve `rate` against the host table; `base_clock` is consulted only
/// for rates the table lacks.
pub(super) fn resolve_rate(
    rate: u32,
    base_clock: impl FnOnce() -> Option<u32>,
) -> Result<BaudSetting<speed_t>, BaudError> {
    match resolve(rate, &rate_table(), None) {
        Err(BaudError::NoCustomDivisor(_)) => resolve(rate, &rate_table(), base_clock()),
        other => other,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(super) mod custom {
    //! `TIOCGSERIAL`/`TIOCSSERIAL` divisor programming. The line runs at
    //! `base / divisor` while its termios speed reads B38400.

    use crate::termios::CustomDivisor;
    use libc::{c_char, c_int, c_uint, c_ulong, c_ushort};
    use std::io;
    use std::os::unix::io::RawFd;

    const ASYNC_SPD_MASK: c_int = 0x1030;
    const ASYNC_SPD_CUST: c_int = 0x0030;

    /// `struct serial_struct` from `<linux/serial.h>`.
    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct SerialStruct {
        pub kind: c_int,
        pub line: c_int,
        pub port: c_uint,
        pub irq: c_int,
        pub flags: c_int,
        pub xmit_fifo_size: c_int,
        pub custom_divisor: c_int,
        pub baud_base: c_int,
        pub close_delay: c_ushort,
        pub io_type: c_char,
        pub reserved_char: [c_char; 1],
        pub hub6: c_int,
        pub closing_wait: c_ushort,
        pub closing_wait2: c_ushort,
        pub iomem_base: *mut u8,
        pub iomem_reg_shift: c_ushort,
        pub port_high: c_uint,
        pub iomap_base: c_ulong,
    }

    pub fn get(fd: RawFd) -> io::Result<SerialStruct> {
        let mut serial: SerialStruct = unsafe { std::mem::zeroed() };
        if unsafe { libc::ioctl(fd, libc::TIOCGSERIAL, &mut serial) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(serial)
    }

    pub fn set(fd: RawFd, serial: &SerialStruct) -> io::Result<()> {
        if unsafe { libc::ioctl(fd, libc::TIOCSSERIAL, serial) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// The UART clock, if the driver reports one.
    pub fn base_clock(fd: RawFd) -> Option<u32> {
        get(fd)
            .ok()
            .and_then(|s| u32::try_from(s.baud_base).ok())
            .filter(|&b| b > 0)
    }

    /// Switch the line to `divisor`, returning the previous state for rollback.
    pub fn program(fd: RawFd, divisor: &CustomDivisor) -> io::Result<SerialStruct> {
        let previous = get(fd)?;
        let mut serial = previous;
        serial.flags = (serial.flags & !ASYNC_SPD_MASK) | ASYNC_SPD_CUST;
        serial.custom_divisor = c_int::try_from(divisor.divisor)
            .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        set(fd, &serial)?;
        Ok(previous)
    }

    /// Drop a custom divisor left by an earlier configuration.
    pub fn clear(fd: RawFd) -> io::Result<()> {
        let mut serial = get(fd)?;
        if serial.flags & ASYNC_SPD_MASK == ASYNC_SPD_CUST {
            serial.flags &= !ASYNC_SPD_MASK;
            serial.custom_divisor = 0;
            set(fd, &serial)?;
        }
        Ok(())
    }
}
