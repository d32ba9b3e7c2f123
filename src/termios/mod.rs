//! POSIX-shaped terminal configuration record.
//!
//! [`Termios`] mirrors `struct termios`: four flag words, a control-character
//! array and two speeds. Speeds are always plain baud values (`9600`, not
//! `B9600`); backends translate to and from their native constants.
//!
//! Flag bit values follow the Linux layout. They are only meaningful inside
//! this crate; the POSIX backend maps each flag to the host constant by name.

mod baud;
mod blocking;

pub use baud::{
    custom_divisor, lookup_rate, resolve, BaudError, BaudSetting, CustomDivisor,
    TOLERANCE_PERCENT,
};
pub use blocking::{CommTimeouts, ReadMode, ReadPlan, MAXDWORD};

use bitflags::bitflags;

/// Size of the control-character array.
pub const NCCS: usize = 20;

/// End-of-file character.
pub const VEOF: usize = 0;
/// End-of-line character.
pub const VEOL: usize = 1;
/// Secondary end-of-line character.
pub const VEOL2: usize = 2;
/// Erase character.
pub const VERASE: usize = 3;
/// Word-erase character.
pub const VWERASE: usize = 4;
/// Kill-line character.
pub const VKILL: usize = 5;
/// Reprint character.
pub const VREPRINT: usize = 6;
/// Interrupt character.
pub const VINTR: usize = 8;
/// Quit character.
pub const VQUIT: usize = 9;
/// Suspend character.
pub const VSUSP: usize = 10;
/// XON character.
pub const VSTART: usize = 12;
/// XOFF character.
pub const VSTOP: usize = 13;
/// Literal-next character.
pub const VLNEXT: usize = 14;
/// Discard character.
pub const VDISCARD: usize = 15;
/// Minimum byte count for non-canonical reads.
pub const VMIN: usize = 16;
/// Non-canonical read timer in deciseconds.
pub const VTIME: usize = 17;

bitflags! {
    /// Input mode flags (`c_iflag`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputFlags: u32 {
        /// Ignore BREAK condition.
        const IGNBRK = 0x0001;
        /// Signal interrupt on BREAK.
        const BRKINT = 0x0002;
        /// Ignore characters with parity errors.
        const IGNPAR = 0x0004;
        /// Mark parity errors in the input stream.
        const PARMRK = 0x0008;
        /// Enable input parity check.
        const INPCK = 0x0010;
        /// Strip the eighth bit.
        const ISTRIP = 0x0020;
        /// Map NL to CR on input.
        const INLCR = 0x0040;
        /// Ignore CR on input.
        const IGNCR = 0x0080;
        /// Map CR to NL on input.
        const ICRNL = 0x0100;
        /// Enable XON/XOFF flow control on output.
        const IXON = 0x0400;
        /// Any character restarts stopped output.
        const IXANY = 0x0800;
        /// Enable XON/XOFF flow control on input.
        const IXOFF = 0x1000;
        /// Ring the bell when the input queue is full.
        const IMAXBEL = 0x2000;
    }
}

bitflags! {
    /// Output mode flags (`c_oflag`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OutputFlags: u32 {
        /// Enable implementation-defined output processing.
        const OPOST = 0x0001;
        /// Map NL to CR-NL on output.
        const ONLCR = 0x0004;
        /// Map CR to NL on output.
        const OCRNL = 0x0008;
        /// Do not output CR at column 0.
        const ONOCR = 0x0010;
        /// NL performs the CR function.
        const ONLRET = 0x0020;
    }
}

bitflags! {
    /// Control mode flags (`c_cflag`).
    ///
    /// `CSIZE` is a two-bit field; use [`Termios::char_size`] and
    /// [`Termios::set_char_size`] rather than testing `CS6`/`CS7` directly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ControlFlags: u32 {
        /// Character size mask.
        const CSIZE = 0x0030;
        /// Six data bits.
        const CS6 = 0x0010;
        /// Seven data bits.
        const CS7 = 0x0020;
        /// Eight data bits.
        const CS8 = 0x0030;
        /// Two stop bits.
        const CSTOPB = 0x0040;
        /// Enable the receiver.
        const CREAD = 0x0080;
        /// Enable parity generation and checking.
        const PARENB = 0x0100;
        /// Odd parity (even when clear).
        const PARODD = 0x0200;
        /// Hang up on last close.
        const HUPCL = 0x0400;
        /// Ignore modem control lines.
        const CLOCAL = 0x0800;
        /// Mark or space (stick) parity.
        const CMSPAR = 0x4000_0000;
        /// RTS/CTS hardware flow control.
        const CRTSCTS = 0x8000_0000;
    }
}

bitflags! {
    /// Local mode flags (`c_lflag`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LocalFlags: u32 {
        /// Generate signals for INTR, QUIT and SUSP.
        const ISIG = 0x0001;
        /// Canonical (line-buffered) input.
        const ICANON = 0x0002;
        /// Echo input characters.
        const ECHO = 0x0008;
        /// ERASE erases the preceding character.
        const ECHOE = 0x0010;
        /// KILL erases the current line.
        const ECHOK = 0x0020;
        /// Echo NL even if ECHO is off.
        const ECHONL = 0x0040;
        /// Do not flush queues on signals.
        const NOFLSH = 0x0080;
        /// Stop background jobs that write to the terminal.
        const TOSTOP = 0x0100;
        /// Echo control characters as `^X`.
        const ECHOCTL = 0x0200;
        /// Print erased characters.
        const ECHOPRT = 0x0400;
        /// KILL erases each character on the line.
        const ECHOKE = 0x0800;
        /// Extended input processing.
        const IEXTEN = 0x8000;
    }
}

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharSize {
    /// Five data bits.
    Five,
    /// Six data bits.
    Six,
    /// Seven data bits.
    Seven,
    /// Eight data bits.
    Eight,
}

impl CharSize {
    /// Data bits as a number.
    pub fn bits(self) -> u8 {
        match self {
            Self::Five => 5,
            Self::Six => 6,
            Self::Seven => 7,
            Self::Eight => 8,
        }
    }

    fn from_cflag(cflag: ControlFlags) -> Self {
        match cflag & ControlFlags::CSIZE {
            f if f == ControlFlags::CS8 => Self::Eight,
            f if f == ControlFlags::CS7 => Self::Seven,
            f if f == ControlFlags::CS6 => Self::Six,
            _ => Self::Five,
        }
    }

    fn to_cflag(self) -> ControlFlags {
        match self {
            Self::Five => ControlFlags::empty(),
            Self::Six => ControlFlags::CS6,
            Self::Seven => ControlFlags::CS7,
            Self::Eight => ControlFlags::CS8,
        }
    }
}

/// Terminal configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Termios {
    /// Input modes.
    pub c_iflag: InputFlags,
    /// Output modes.
    pub c_oflag: OutputFlags,
    /// Control modes.
    pub c_cflag: ControlFlags,
    /// Local modes.
    pub c_lflag: LocalFlags,
    /// Control characters, indexed by `VEOF`, `VMIN`, ...
    pub c_cc: [u8; NCCS],
    /// Input speed in baud.
    pub c_ispeed: u32,
    /// Output speed in baud.
    pub c_ospeed: u32,
}

impl Termios {
    /// The configuration a freshly opened emulated port starts with:
    /// raw mode, receiver on, modem lines ignored, VMIN=0, VTIME=0.
    pub fn raw_at(baud: u32) -> Self {
        let mut t = Self::default();
        t.c_cflag = ControlFlags::CREAD | ControlFlags::CLOCAL;
        t.c_cc[VSTART] = 0x11;
        t.c_cc[VSTOP] = 0x13;
        t.c_cc[VEOF] = 0x04;
        t.make_raw();
        t.set_speed(baud);
        t
    }

    /// Switch to raw mode in place (`cfmakeraw`).
    ///
    /// Only clears bits and forces CS8, so applying it twice is the same as
    /// applying it once.
    pub fn make_raw(&mut self) {
        self.c_iflag.remove(
            InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::PARMRK
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::IGNCR
                | InputFlags::ICRNL
                | InputFlags::IXON,
        );
        self.c_oflag.remove(OutputFlags::OPOST);
        self.c_lflag.remove(
            LocalFlags::ECHO
                | LocalFlags::ECHONL
                | LocalFlags::ICANON
                | LocalFlags::ISIG
                | LocalFlags::IEXTEN,
        );
        self.c_cflag.remove(ControlFlags::CSIZE | ControlFlags::PARENB);
        self.c_cflag.insert(ControlFlags::CS8);
    }

    /// Input speed in baud.
    pub fn ispeed(&self) -> u32 {
        self.c_ispeed
    }

    /// Output speed in baud.
    pub fn ospeed(&self) -> u32 {
        self.c_ospeed
    }

    /// Set the input speed.
    pub fn set_ispeed(&mut self, baud: u32) {
        self.c_ispeed = baud;
    }

    /// Set the output speed.
    pub fn set_ospeed(&mut self, baud: u32) {
        self.c_ospeed = baud;
    }

    /// Set both speeds.
    pub fn set_speed(&mut self, baud: u32) {
        self.c_ispeed = baud;
        self.c_ospeed = baud;
    }

    /// Data bits selected by the `CSIZE` field.
    pub fn char_size(&self) -> CharSize {
        CharSize::from_cflag(self.c_cflag)
    }

    /// Replace the `CSIZE` field.
    pub fn set_char_size(&mut self, size: CharSize) {
        self.c_cflag.remove(ControlFlags::CSIZE);
        self.c_cflag.insert(size.to_cflag());
    }

    /// `c_cc[VMIN]`.
    pub fn vmin(&self) -> u8 {
        self.c_cc[VMIN]
    }

    /// `c_cc[VTIME]`, in deciseconds.
    pub fn vtime(&self) -> u8 {
        self.c_cc[VTIME]
    }

    /// Set VMIN and VTIME together.
    pub fn set_read_timing(&mut self, vmin: u8, vtime: u8) {
        self.c_cc[VMIN] = vmin;
        self.c_cc[VTIME] = vtime;
    }

    /// Blocking behavior implied by VMIN/VTIME.
    pub fn read_mode(&self) -> ReadMode {
        ReadMode::from_cc(self.vmin(), self.vtime())
    }
}

/// `cfmakeraw`.
pub fn cfmakeraw(termios: &mut Termios) {
    termios.make_raw();
}

/// `cfgetispeed`.
pub fn cfgetispeed(termios: &Termios) -> u32 {
    termios.ispeed()
}

/// `cfgetospeed`.
pub fn cfgetospeed(termios: &Termios) -> u32 {
    termios.ospeed()
}

/// `cfsetispeed`.
pub fn cfsetispeed(termios: &mut Termios, baud: u32) {
    termios.set_ispeed(baud);
}

/// `cfsetospeed`.
pub fn cfsetospeed(termios: &mut Termios, baud: u32) {
    termios.set_ospeed(baud);
}

/// `cfsetspeed`.
pub fn cfsetspeed(termios: &mut Termios, baud: u32) {
    termios.set_speed(baud);
}
