//! Win32 COMM driver.
//!
//! Devices are opened with `FILE_FLAG_OVERLAPPED`. Each asynchronous request
//! owns a boxed `OVERLAPPED`, its event and its buffer; a short-lived thread
//! waits in `GetOverlappedResult` and posts the completion, so the buffer
//! stays alive until the kernel is done with it.

use super::native::{
    aborted, ComStat, CommDevice, CommDriver, CommErrors, CompletionData, CompletionHandle, Dcb,
    EscapeFunction, EventMask, ModemStatus, PurgeFlags,
};
use crate::termios::CommTimeouts;
use std::ffi::OsStr;
use std::io;
use std::iter;
use std::mem;
use std::os::raw::c_char;
use std::os::windows::ffi::OsStrExt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use winapi::shared::minwindef::{BOOL, DWORD, FALSE, TRUE};
use winapi::shared::winerror::{ERROR_IO_PENDING, ERROR_NOT_FOUND, ERROR_OPERATION_ABORTED};
use winapi::um::commapi::{
    ClearCommBreak, ClearCommError, EscapeCommFunction, GetCommModemStatus, PurgeComm,
    SetCommBreak, SetCommMask, SetCommState, SetCommTimeouts, SetupComm, WaitCommEvent,
};
use winapi::um::fileapi::{CreateFileW, FlushFileBuffers, ReadFile, WriteFile, OPEN_EXISTING};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::ioapiset::{CancelIoEx, GetOverlappedResult};
use winapi::um::minwinbase::OVERLAPPED;
use winapi::um::synchapi::CreateEventW;
use winapi::um::winbase::{COMMTIMEOUTS, COMSTAT, DCB, FILE_FLAG_OVERLAPPED};
use winapi::um::winnt::{GENERIC_READ, GENERIC_WRITE, HANDLE};

fn check(ok: BOOL) -> io::Result<()> {
    if ok == FALSE {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Handle shared with completion threads. It is only closed once every
/// operation using it has completed.
#[derive(Debug, Clone, Copy)]
struct RawHandle(HANDLE);

unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

/// One queued request and everything the kernel may write to.
struct Request {
    overlapped: OVERLAPPED,
    buffer: Vec<u8>,
    mask: DWORD,
}

unsafe impl Send for Request {}

impl Request {
    fn new(buffer: Vec<u8>) -> io::Result<Box<Self>> {
        let event = unsafe { CreateEventW(ptr::null_mut(), TRUE, FALSE, ptr::null()) };
        if event.is_null() {
            return Err(io::Error::last_os_error());
        }
        let mut overlapped: OVERLAPPED = unsafe { mem::zeroed() };
        overlapped.hEvent = event;
        Ok(Box::new(Self {
            overlapped,
            buffer,
            mask: 0,
        }))
    }

    /// A request the kernel did not accept finishes right here.
    fn queued(ok: BOOL) -> io::Result<()> {
        if ok != FALSE {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(ERROR_IO_PENDING as i32) {
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Wait for the kernel on a dedicated thread, then report.
    fn finish(
        mut self: Box<Self>,
        handle: RawHandle,
        done: CompletionHandle,
        report: impl FnOnce(Box<Self>, usize) -> CompletionData + Send + 'static,
    ) -> io::Result<()> {
        thread::Builder::new()
            .name("comm-completion".into())
            .spawn(move || {
                let mut transferred: DWORD = 0;
                let ok = unsafe {
                    GetOverlappedResult(handle.0, &mut self.overlapped, &mut transferred, TRUE)
                };
                let result = match check(ok) {
                    Ok(()) => Ok(report(self, transferred as usize)),
                    Err(e) if e.raw_os_error() == Some(ERROR_OPERATION_ABORTED as i32) => {
                        Err(aborted())
                    }
                    Err(e) => Err(e),
                };
                done.complete(result);
            })?;
        Ok(())
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.overlapped.hEvent);
        }
    }
}

fn native_dcb(dcb: &Dcb) -> DCB {
    let mut native: DCB = unsafe { mem::zeroed() };
    native.DCBlength = mem::size_of::<DCB>() as DWORD;
    native.BaudRate = dcb.baud_rate;
    native.BitFields = dcb.flags.bits();
    native.XonLim = dcb.xon_lim;
    native.XoffLim = dcb.xoff_lim;
    native.ByteSize = dcb.byte_size;
    native.Parity = dcb.parity as u8;
    native.StopBits = dcb.stop_bits as u8;
    native.XonChar = dcb.xon_char as c_char;
    native.XoffChar = dcb.xoff_char as c_char;
    native.ErrorChar = dcb.error_char as c_char;
    native.EofChar = dcb.eof_char as c_char;
    native.EvtChar = dcb.evt_char as c_char;
    native
}

/// An open Win32 serial handle.
#[derive(Debug)]
pub struct Win32Comm {
    handle: RawHandle,
    closed: AtomicBool,
}

impl CommDevice for Win32Comm {
    fn setup_queues(&self, rx: u32, tx: u32) -> io::Result<()> {
        check(unsafe { SetupComm(self.handle.0, rx, tx) })
    }

    fn set_state(&self, dcb: &Dcb) -> io::Result<()> {
        let mut native = native_dcb(dcb);
        check(unsafe { SetCommState(self.handle.0, &mut native) })
    }

    fn set_timeouts(&self, timeouts: &CommTimeouts) -> io::Result<()> {
        let mut native = COMMTIMEOUTS {
            ReadIntervalTimeout: timeouts.read_interval,
            ReadTotalTimeoutMultiplier: timeouts.read_total_multiplier,
            ReadTotalTimeoutConstant: timeouts.read_total_constant,
            WriteTotalTimeoutMultiplier: timeouts.write_total_multiplier,
            WriteTotalTimeoutConstant: timeouts.write_total_constant,
        };
        check(unsafe { SetCommTimeouts(self.handle.0, &mut native) })
    }

    fn clear_error(&self) -> io::Result<ComStat> {
        let mut errors: DWORD = 0;
        let mut stat: COMSTAT = unsafe { mem::zeroed() };
        check(unsafe { ClearCommError(self.handle.0, &mut errors, &mut stat) })?;
        Ok(ComStat {
            errors: CommErrors::from_bits_truncate(errors),
            in_queue: stat.cbInQue,
            out_queue: stat.cbOutQue,
        })
    }

    fn read_async(&self, len: usize, done: CompletionHandle) -> io::Result<()> {
        let mut request = Request::new(vec![0u8; len])?;
        Request::queued(unsafe {
            ReadFile(
                self.handle.0,
                request.buffer.as_mut_ptr().cast(),
                len as DWORD,
                ptr::null_mut(),
                &mut request.overlapped,
            )
        })?;
        request.finish(self.handle, done, |mut request, n| {
            request.buffer.truncate(n);
            CompletionData::Read(mem::take(&mut request.buffer))
        })
    }

    fn write_async(&self, data: Vec<u8>, done: CompletionHandle) -> io::Result<()> {
        let len = data.len();
        let mut request = Request::new(data)?;
        Request::queued(unsafe {
            WriteFile(
                self.handle.0,
                request.buffer.as_ptr().cast(),
                len as DWORD,
                ptr::null_mut(),
                &mut request.overlapped,
            )
        })?;
        request.finish(self.handle, done, |_, n| CompletionData::Written(n))
    }

    fn set_event_mask(&self, mask: EventMask) -> io::Result<()> {
        check(unsafe { SetCommMask(self.handle.0, mask.bits()) })
    }

    fn wait_event_async(&self, done: CompletionHandle) -> io::Result<()> {
        let mut request = Request::new(Vec::new())?;
        Request::queued(unsafe {
            WaitCommEvent(self.handle.0, &mut request.mask, &mut request.overlapped)
        })?;
        request.finish(self.handle, done, |request, _| {
            CompletionData::Event(EventMask::from_bits_truncate(request.mask))
        })
    }

    fn cancel_io(&self) -> io::Result<()> {
        match check(unsafe { CancelIoEx(self.handle.0, ptr::null_mut()) }) {
            Err(e) if e.raw_os_error() == Some(ERROR_NOT_FOUND as i32) => Ok(()),
            other => other,
        }
    }

    fn purge(&self, flags: PurgeFlags) -> io::Result<()> {
        check(unsafe { PurgeComm(self.handle.0, flags.bits()) })
    }

    fn flush(&self) -> io::Result<()> {
        check(unsafe { FlushFileBuffers(self.handle.0) })
    }

    fn escape(&self, function: EscapeFunction) -> io::Result<()> {
        check(unsafe { EscapeCommFunction(self.handle.0, function as DWORD) })
    }

    fn modem_status(&self) -> io::Result<ModemStatus> {
        let mut status: DWORD = 0;
        check(unsafe { GetCommModemStatus(self.handle.0, &mut status) })?;
        Ok(ModemStatus::from_bits_truncate(status))
    }

    fn set_break(&self) -> io::Result<()> {
        check(unsafe { SetCommBreak(self.handle.0) })
    }

    fn clear_break(&self) -> io::Result<()> {
        check(unsafe { ClearCommBreak(self.handle.0) })
    }

    fn base_clock(&self) -> Option<u32> {
        None
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        check(unsafe { CloseHandle(self.handle.0) })
    }
}

impl Drop for Win32Comm {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::debug!("Closing COMM handle on drop failed: {}", e);
        }
    }
}

/// Opens `\\.\NAME` devices.
#[derive(Debug, Default)]
pub struct Win32Driver;

impl Win32Driver {
    pub fn new() -> Self {
        Self
    }
}

impl CommDriver for Win32Driver {
    type Device = Win32Comm;

    fn open(&self, name: &str) -> io::Result<Win32Comm> {
        let path: Vec<u16> = OsStr::new(&super::device_path(name))
            .encode_wide()
            .chain(iter::once(0))
            .collect();
        let handle = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                ptr::null_mut(),
                OPEN_EXISTING,
                FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        Ok(Win32Comm {
            handle: RawHandle(handle),
            closed: AtomicBool::new(false),
        })
    }
}
