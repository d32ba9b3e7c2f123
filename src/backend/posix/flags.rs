//! Translation between [`Termios`] and the host's `struct termios`.
//!
//! Flags are matched by name, so the crate's bit layout never has to agree
//! with the host's. Host bits the crate does not model are preserved.

use crate::termios::{
    CharSize, ControlFlags, InputFlags, LocalFlags, OutputFlags, Termios, VDISCARD, VEOF, VEOL,
    VEOL2, VERASE, VINTR, VKILL, VLNEXT, VMIN, VQUIT, VREPRINT, VSTART, VSTOP, VSUSP, VTIME,
    VWERASE,
};
use libc::tcflag_t;

fn input_table() -> Vec<(InputFlags, tcflag_t)> {
    vec![
        (InputFlags::IGNBRK, libc::IGNBRK),
        (InputFlags::BRKINT, libc::BRKINT),
        (InputFlags::IGNPAR, libc::IGNPAR),
        (InputFlags::PARMRK, libc::PARMRK),
        (InputFlags::INPCK, libc::INPCK),
        (InputFlags::ISTRIP, libc::ISTRIP),
        (InputFlags::INLCR, libc::INLCR),
        (InputFlags::IGNCR, libc::IGNCR),
        (InputFlags::ICRNL, libc::ICRNL),
        (InputFlags::IXON, libc::IXON),
        (InputFlags::IXANY, libc::IXANY),
        (InputFlags::IXOFF, libc::IXOFF),
        (InputFlags::IMAXBEL, libc::IMAXBEL),
    ]
}

fn output_table() -> Vec<(OutputFlags, tcflag_t)> {
    vec![
        (OutputFlags::OPOST, libc::OPOST),
        (OutputFlags::ONLCR, libc::ONLCR),
        (OutputFlags::OCRNL, libc::OCRNL),
        (OutputFlags::ONOCR, libc::ONOCR),
        (OutputFlags::ONLRET, libc::ONLRET),
    ]
}

fn control_table() -> Vec<(ControlFlags, tcflag_t)> {
    #[allow(unused_mut)]
    let mut table = vec![
        (ControlFlags::CSTOPB, libc::CSTOPB),
        (ControlFlags::CREAD, libc::CREAD),
        (ControlFlags::PARENB, libc::PARENB),
        (ControlFlags::PARODD, libc::PARODD),
        (ControlFlags::HUPCL, libc::HUPCL),
        (ControlFlags::CLOCAL, libc::CLOCAL),
    ];
    #[cfg(any(target_os = "linux", target_os = "android"))]
    table.push((ControlFlags::CMSPAR, libc::CMSPAR));
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd"
    ))]
    table.push((ControlFlags::CRTSCTS, libc::CRTSCTS));
    table
}

fn local_table() -> Vec<(LocalFlags, tcflag_t)> {
    vec![
        (LocalFlags::ISIG, libc::ISIG),
        (LocalFlags::ICANON, libc::ICANON),
        (LocalFlags::ECHO, libc::ECHO),
        (LocalFlags::ECHOE, libc::ECHOE),
        (LocalFlags::ECHOK, libc::ECHOK),
        (LocalFlags::ECHONL, libc::ECHONL),
        (LocalFlags::NOFLSH, libc::NOFLSH),
        (LocalFlags::TOSTOP, libc::TOSTOP),
        (LocalFlags::ECHOCTL, libc::ECHOCTL),
        (LocalFlags::ECHOPRT, libc::ECHOPRT),
        (LocalFlags::ECHOKE, libc::ECHOKE),
        (LocalFlags::IEXTEN, libc::IEXTEN),
    ]
}

/// Control-character slots as (crate index, host index).
fn cc_table() -> [(usize, usize); 16] {
    [
        (VEOF, libc::VEOF),
        (VEOL, libc::VEOL),
        (VEOL2, libc::VEOL2),
        (VERASE, libc::VERASE),
        (VWERASE, libc::VWERASE),
        (VKILL, libc::VKILL),
        (VREPRINT, libc::VREPRINT),
        (VINTR, libc::VINTR),
        (VQUIT, libc::VQUIT),
        (VSUSP, libc::VSUSP),
        (VSTART, libc::VSTART),
        (VSTOP, libc::VSTOP),
        (VLNEXT, libc::VLNEXT),
        (VDISCARD, libc::VDISCARD),
        (VMIN, libc::VMIN),
        (VTIME, libc::VTIME),
    ]
}

fn encode<F: bitflags::Flags + Copy>(flags: F, table: &[(F, tcflag_t)], host: tcflag_t) -> tcflag_t {
    let known = table.iter().fold(0, |acc, (_, bit)| acc | bit);
    table
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .fold(host & !known, |acc, (_, bit)| acc | bit)
}

fn decode<F: bitflags::Flags + Copy>(table: &[(F, tcflag_t)], host: tcflag_t) -> F {
    table
        .iter()
        .filter(|(_, bit)| host & bit == *bit)
        .fold(F::empty(), |acc, (flag, _)| acc.union(*flag))
}

fn host_size(size: CharSize) -> tcflag_t {
    match size {
        CharSize::Five => libc::CS5,
        CharSize::Six => libc::CS6,
        CharSize::Seven => libc::CS7,
        CharSize::Eight => libc::CS8,
    }
}

/// Write flags and control characters of `termios` into `host`. Speeds
/// are programmed separately.
pub(super) fn encode_termios(termios: &Termios, host: &mut libc::termios) {
    host.c_iflag = encode(termios.c_iflag, &input_table(), host.c_iflag);
    host.c_oflag = encode(termios.c_oflag, &output_table(), host.c_oflag);
    host.c_lflag = encode(termios.c_lflag, &local_table(), host.c_lflag);

    let cflag = encode(termios.c_cflag, &control_table(), host.c_cflag);
    host.c_cflag = (cflag & !libc::CSIZE) | host_size(termios.char_size());

    for (ours, theirs) in cc_table() {
        host.c_cc[theirs] = termios.c_cc[ours];
    }
}

/// Read flags and control characters from `host`. Speeds are left at 0.
pub(super) fn decode_termios(host: &libc::termios) -> Termios {
    let mut termios = Termios {
        c_iflag: decode(&input_table(), host.c_iflag),
        c_oflag: decode(&output_table(), host.c_oflag),
        c_cflag: decode(&control_table(), host.c_cflag),
        c_lflag: decode(&local_table(), host.c_lflag),
        ..Termios::default()
    };
    let size = match host.c_cflag & libc::CSIZE {
        s if s == libc::CS5 => CharSize::Five,
        s if s == libc::CS6 => CharSize::Six,
        s if s == libc::CS7 => CharSize::Seven,
        _ => CharSize::Eight,
    };
    termios.set_char_size(size);
    for (ours, theirs) in cc_table() {
        termios.c_cc[ours] = host.c_cc[theirs];
    }
    termios
}
