//! Emulated backend driven through simulated COMM lines.
//!
//! These exercise the behavior programs rely on when they port a termios
//! serial loop to a handle-based host: the four VMIN/VTIME read classes,
//! baud handling, idempotent configuration, readiness and cancellation.

mod common;

use common::{assert_elapsed_between, timed, Harness};
use pretty_assertions::assert_eq;
use serial_termios::api::{self, PortApi};
use serial_termios::backend::emulated::{CommErrors, FailPoint};
use serial_termios::error::errno;
use serial_termios::{
    Backend, BaudError, FdSet, OpenFlags, PollEvents, PollFd, SetAttrWhen, TermiosError, TimeVal,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ============================================================================
// VMIN / VTIME
// ============================================================================

#[test]
fn test_poll_read_returns_immediately() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.set_timing(fd, 0, 0);

    let mut buf = [0u8; 16];
    let (n, elapsed) = timed(|| h.backend.read(fd, &mut buf).unwrap());
    assert_eq!(n, 0);
    assert!(elapsed < Duration::from_millis(100));

    h.line(1).inject(b"abc");
    assert_eq!(h.backend.read(fd, &mut buf).unwrap(), 3);
    assert_eq!(&buf[..3], b"abc");
}

#[test]
fn test_timed_read_without_data_times_out() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.set_timing(fd, 0, 10);

    let mut buf = [0u8; 16];
    let (n, elapsed) = timed(|| h.backend.read(fd, &mut buf).unwrap());
    assert_eq!(n, 0);
    assert_elapsed_between(elapsed, 950, 1250);
}

#[test]
fn test_timed_read_returns_first_arrival() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.set_timing(fd, 0, 20);

    let line = h.line(1).clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        line.inject(b"x");
    });

    let mut buf = [0u8; 16];
    let (n, elapsed) = timed(|| h.backend.read(fd, &mut buf).unwrap());
    feeder.join().unwrap();
    assert_eq!(n, 1);
    assert!(elapsed < Duration::from_millis(1500));
}

#[test]
fn test_threshold_read_collects_vmin_bytes() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.set_timing(fd, 4, 0);

    let line = h.line(1).clone();
    let feeder = thread::spawn(move || {
        for chunk in [&b"ab"[..], &b"cd"[..]] {
            thread::sleep(Duration::from_millis(40));
            line.inject(chunk);
        }
    });

    let mut buf = [0u8; 16];
    let n = h.backend.read(fd, &mut buf).unwrap();
    feeder.join().unwrap();
    assert_eq!(n, 4);
    assert_eq!(&buf[..4], b"abcd");
}

#[test]
fn test_inter_byte_read_stops_on_silence() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.set_timing(fd, 8, 2);

    let line = h.line(1).clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        line.inject(b"hi");
    });

    let mut buf = [0u8; 16];
    let (n, elapsed) = timed(|| h.backend.read(fd, &mut buf).unwrap());
    feeder.join().unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], b"hi");
    // First byte after ~50 ms, then a 200 ms gap.
    assert_elapsed_between(elapsed, 200, 1000);
}

#[test]
fn test_nonblocking_read_ignores_vtime() {
    let h = Harness::new(1);
    let fd = h
        .backend
        .open("COM1", OpenFlags::O_RDWR | OpenFlags::O_NONBLOCK)
        .unwrap();
    h.set_timing(fd, 0, 50);

    let mut buf = [0u8; 8];
    let (result, elapsed) = timed(|| h.backend.read(fd, &mut buf));
    assert!(matches!(result, Err(TermiosError::WouldBlock)));
    assert!(elapsed < Duration::from_millis(100));
}

// ============================================================================
// Baud rates and configuration
// ============================================================================

#[test]
fn test_standard_baud_round_trip() {
    let h = Harness::new(1);
    let fd = h.open(1);

    for rate in [1200, 19200, 115200] {
        let mut termios = h.backend.tcgetattr(fd).unwrap();
        serial_termios::cfsetspeed(&mut termios, rate);
        h.backend.tcsetattr(fd, SetAttrWhen::Now, &termios).unwrap();

        let back = h.backend.tcgetattr(fd).unwrap();
        assert_eq!(serial_termios::cfgetospeed(&back), rate);
        assert_eq!(h.line(1).dcb().unwrap().baud_rate, rate);
    }
}

#[test]
fn test_custom_baud_within_tolerance() {
    let h = Harness::with_base_clock(1_000_000, 1);
    let fd = h.open(1);

    let mut termios = h.backend.tcgetattr(fd).unwrap();
    termios.set_speed(31250);
    h.backend.tcsetattr(fd, SetAttrWhen::Now, &termios).unwrap();
    assert_eq!(h.line(1).dcb().unwrap().baud_rate, 31250);
    assert_eq!(h.backend.tcgetattr(fd).unwrap().ospeed(), 31250);
}

#[test]
fn test_custom_baud_out_of_window_changes_nothing() {
    let h = Harness::new(1);
    let fd = h.open(1);
    let before = h.line(1).stats();

    let mut termios = h.backend.tcgetattr(fd).unwrap();
    termios.set_speed(100_000);
    let err = h
        .backend
        .tcsetattr(fd, SetAttrWhen::Now, &termios)
        .unwrap_err();
    assert!(matches!(
        err,
        TermiosError::Baud(BaudError::OutOfTolerance { .. })
    ));

    assert_eq!(h.line(1).stats(), before);
    assert_eq!(h.line(1).dcb().unwrap().baud_rate, 9600);
    assert_eq!(h.backend.tcgetattr(fd).unwrap().ospeed(), 9600);
}

#[test]
fn test_identical_tcsetattr_skips_native_calls() {
    let h = Harness::new(1);
    let fd = h.open(1);

    let mut termios = h.backend.tcgetattr(fd).unwrap();
    termios.set_speed(57600);
    h.backend.tcsetattr(fd, SetAttrWhen::Now, &termios).unwrap();
    let after_first = h.line(1).stats();

    h.backend.tcsetattr(fd, SetAttrWhen::Now, &termios).unwrap();
    assert_eq!(h.line(1).stats(), after_first);
}

#[test]
fn test_timing_change_only_touches_timeouts() {
    let h = Harness::new(1);
    let fd = h.open(1);
    let before = h.line(1).stats();

    h.set_timing(fd, 0, 5);
    let after = h.line(1).stats();
    assert_eq!(after.set_state, before.set_state);
    assert_eq!(after.set_timeouts, before.set_timeouts + 1);
    assert_eq!(h.line(1).timeouts().read_total_constant, 500);
}

#[test]
fn test_failed_tcsetattr_keeps_previous_termios() {
    let h = Harness::new(1);
    let fd = h.open(1);
    let original = h.backend.tcgetattr(fd).unwrap();

    let mut termios = original;
    termios.set_speed(38400);
    termios.set_read_timing(1, 0);
    h.line(1).fail_next(FailPoint::SetTimeouts);
    assert!(h.backend.tcsetattr(fd, SetAttrWhen::Now, &termios).is_err());

    assert_eq!(h.backend.tcgetattr(fd).unwrap(), original);
    assert_eq!(h.line(1).dcb().unwrap().baud_rate, 9600);

    // The next attempt is not mistaken for a no-op.
    h.backend.tcsetattr(fd, SetAttrWhen::Now, &termios).unwrap();
    assert_eq!(h.line(1).dcb().unwrap().baud_rate, 38400);
}

#[test]
fn test_split_speed_rejected_after_cached_apply() {
    let h = Harness::new(1);
    let fd = h.open(1);
    let applied = h.backend.tcgetattr(fd).unwrap();
    h.backend.tcsetattr(fd, SetAttrWhen::Now, &applied).unwrap();

    let mut split = applied;
    serial_termios::cfsetispeed(&mut split, 1200);
    let err = h
        .backend
        .tcsetattr(fd, SetAttrWhen::Now, &split)
        .unwrap_err();
    assert_eq!(err.errno(), errno::EINVAL);

    let current = h.backend.tcgetattr(fd).unwrap();
    assert_eq!(current, applied);
    assert_eq!(current.ispeed(), 9600);
    assert_eq!(h.line(1).dcb().unwrap().baud_rate, 9600);
}

// ============================================================================
// Descriptors
// ============================================================================

#[test]
fn test_closed_descriptor_is_invalid_until_reused() {
    let h = Harness::new(2);
    let fd = h.open(1);
    h.backend.close(fd).unwrap();

    let mut buf = [0u8; 4];
    assert!(matches!(
        h.backend.read(fd, &mut buf),
        Err(TermiosError::InvalidDescriptor(_))
    ));
    assert!(matches!(
        h.backend.close(fd),
        Err(TermiosError::InvalidDescriptor(_))
    ));

    let reused = h.open(2);
    assert_eq!(reused, fd);
    h.line(2).inject(b"z");
    assert_eq!(h.backend.read(reused, &mut buf).unwrap(), 1);
}

#[test]
fn test_failed_open_leaves_no_trace() {
    let h = Harness::new(1);
    for point in [FailPoint::Open, FailPoint::SetupQueues, FailPoint::SetState] {
        h.line(1).fail_next(point);
        assert!(h.backend.open("COM1", OpenFlags::O_RDWR).is_err());
        assert!(h.backend.open_descriptors().is_empty());
    }
    assert_eq!(h.open(1), 0);
}

#[test]
fn test_registry_exhaustion() {
    let mut config = serial_termios::Config::default();
    config.registry.max_ports = 2;
    let h = Harness::with_driver(
        serial_termios::backend::emulated::SimulatedDriver::new(),
        3,
        &config,
    );
    h.open(1);
    h.open(2);
    assert!(matches!(
        h.backend.open("COM3", OpenFlags::O_RDWR),
        Err(TermiosError::Exhausted(2))
    ));
}

// ============================================================================
// Cancellation
// ============================================================================

#[test]
fn test_close_interrupts_blocking_read() {
    let h = Arc::new(Harness::new(1));
    let fd = h.open(1);
    h.set_timing(fd, 1, 0);

    let reader = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            timed(|| h.backend.read(fd, &mut buf))
        })
    };
    thread::sleep(Duration::from_millis(150));

    let (closed, _) = timed(|| h.backend.close(fd));
    closed.unwrap();
    let (result, elapsed) = reader.join().unwrap();
    assert!(matches!(result, Err(TermiosError::Interrupted(_))));
    assert!(elapsed < Duration::from_millis(150 + 200));
    assert!(!h.line(1).is_open());
}

#[test]
fn test_close_during_select_yields_nothing_ready() {
    let h = Arc::new(Harness::new(1));
    let fd = h.open(1);

    let selector = {
        let h = Arc::clone(&h);
        thread::spawn(move || {
            let mut read = FdSet::new();
            read.set(fd);
            let n = h.backend.select(fd as usize + 1, Some(&mut read), None, None, None);
            (n, read)
        })
    };
    thread::sleep(Duration::from_millis(100));
    h.backend.close(fd).unwrap();

    let (n, read) = selector.join().unwrap();
    assert_eq!(n.unwrap(), 0);
    assert!(read.is_empty());
}

// ============================================================================
// select / poll
// ============================================================================

#[test]
fn test_select_sees_data_queued_before_the_call() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.line(1).inject(b"early");

    let mut read = FdSet::new();
    read.set(fd);
    let timeout = TimeVal::new(5, 0);
    let (n, elapsed) = timed(|| {
        h.backend
            .select(fd as usize + 1, Some(&mut read), None, None, Some(&timeout))
            .unwrap()
    });
    assert_eq!(n, 1);
    assert!(read.is_set(fd));
    assert!(elapsed < Duration::from_millis(500));
    assert_eq!(timeout, TimeVal::new(5, 0));
}

#[test]
fn test_select_with_huge_timeout_returns_ready() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.line(1).inject(b"now");

    let mut read = FdSet::new();
    read.set(fd);
    let timeout = TimeVal::new(i64::MAX, 0);
    let n = h
        .backend
        .select(fd as usize + 1, Some(&mut read), None, None, Some(&timeout))
        .unwrap();
    assert_eq!(n, 1);
    assert!(read.is_set(fd));
}

#[test]
fn test_select_rejects_out_of_range_timeval() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.line(1).inject(b"q");

    let mut read = FdSet::new();
    read.set(fd);
    let err = h
        .backend
        .select(
            fd as usize + 1,
            Some(&mut read),
            None,
            None,
            Some(&TimeVal::new(0, 1_000_000)),
        )
        .unwrap_err();
    assert!(matches!(err, TermiosError::InvalidArgument(_)));
}

#[test]
fn test_select_wakes_on_arrival() {
    let h = Harness::new(1);
    let fd = h.open(1);

    let line = h.line(1).clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        line.inject(b"!");
    });

    let mut read = FdSet::new();
    read.set(fd);
    let n = h
        .backend
        .select(fd as usize + 1, Some(&mut read), None, None, Some(&TimeVal::new(3, 0)))
        .unwrap();
    feeder.join().unwrap();
    assert_eq!(n, 1);
    assert!(read.is_set(fd));
}

#[test]
fn test_select_times_out_with_empty_sets() {
    let h = Harness::new(1);
    let fd = h.open(1);

    let mut read = FdSet::new();
    read.set(fd);
    let timeout = TimeVal::new(0, 200_000);
    let (n, elapsed) = timed(|| {
        h.backend
            .select(fd as usize + 1, Some(&mut read), None, None, Some(&timeout))
            .unwrap()
    });
    assert_eq!(n, 0);
    assert!(read.is_empty());
    assert_elapsed_between(elapsed, 180, 1000);
    assert_eq!(timeout, TimeVal::new(0, 200_000));
}

#[test]
fn test_select_counts_every_ready_bit() {
    let h = Harness::new(2);
    let a = h.open(1);
    let b = h.open(2);
    h.line(2).inject(b"data");

    let mut read = FdSet::new();
    let mut write = FdSet::new();
    read.set(a);
    read.set(b);
    write.set(a);
    let n = h
        .backend
        .select(8, Some(&mut read), Some(&mut write), None, Some(&TimeVal::new(0, 0)))
        .unwrap();
    assert_eq!(n, 2);
    assert!(!read.is_set(a));
    assert!(read.is_set(b));
    assert!(write.is_set(a));
}

#[test]
fn test_select_reports_line_errors_as_exceptions() {
    let h = Harness::new(1);
    let fd = h.open(1);

    let line = h.line(1).clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(80));
        line.raise_errors(CommErrors::FRAME);
    });

    let mut except = FdSet::new();
    except.set(fd);
    let n = h
        .backend
        .select(fd as usize + 1, None, None, Some(&mut except), Some(&TimeVal::new(3, 0)))
        .unwrap();
    feeder.join().unwrap();
    assert_eq!(n, 1);
    assert!(except.is_set(fd));
}

#[test]
fn test_select_rejects_unknown_descriptor() {
    let h = Harness::new(1);
    let mut read = FdSet::new();
    read.set(5);
    assert!(matches!(
        h.backend
            .select(6, Some(&mut read), None, None, Some(&TimeVal::new(0, 0))),
        Err(TermiosError::InvalidDescriptor(5))
    ));
}

#[test]
fn test_concurrent_selects_on_different_ports() {
    let h = Arc::new(Harness::new(2));
    let fds = [h.open(1), h.open(2)];

    let waiters: Vec<_> = fds
        .iter()
        .map(|&fd| {
            let h = Arc::clone(&h);
            thread::spawn(move || {
                let mut read = FdSet::new();
                read.set(fd);
                h.backend
                    .select(fd as usize + 1, Some(&mut read), None, None, Some(&TimeVal::new(3, 0)))
                    .map(|n| (n, read.is_set(fd)))
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(100));
    h.line(2).inject(b"2");
    thread::sleep(Duration::from_millis(50));
    h.line(1).inject(b"1");

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap().unwrap(), (1, true));
    }
}

#[test]
fn test_poll_reports_input_and_invalid_entries() {
    let h = Harness::new(1);
    let fd = h.open(1);
    h.line(1).inject(b"p");

    let mut fds = [
        PollFd::new(fd, PollEvents::POLLIN | PollEvents::POLLOUT),
        PollFd::new(-1, PollEvents::POLLIN),
        PollFd::new(9, PollEvents::POLLIN),
    ];
    let n = h.backend.poll(&mut fds, 1000).unwrap();
    assert_eq!(n, 2);
    assert_eq!(fds[0].revents, PollEvents::POLLIN | PollEvents::POLLOUT);
    assert!(fds[1].revents.is_empty());
    assert_eq!(fds[2].revents, PollEvents::POLLNVAL);
}

#[test]
fn test_poll_waits_for_data() {
    let h = Harness::new(1);
    let fd = h.open(1);

    let line = h.line(1).clone();
    let feeder = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        line.inject(b"late");
    });

    let mut fds = [PollFd::new(fd, PollEvents::POLLIN)];
    let n = h.backend.poll(&mut fds, 3000).unwrap();
    feeder.join().unwrap();
    assert_eq!(n, 1);
    assert!(fds[0].revents.contains(PollEvents::POLLIN));
}

// ============================================================================
// C-convention facade
// ============================================================================

#[test]
fn test_port_api_round_trip() {
    let h = Harness::new(1);
    let line = h.line(1).clone();
    line.set_loopback(true);
    let ports = PortApi::with_backend(Box::new(h.backend));

    let fd = ports.open(r"\\.\COM1", OpenFlags::O_RDWR);
    assert!(fd >= 0);
    assert_eq!(ports.write(fd, b"ping"), 4);
    assert_eq!(line.take_written(), b"ping");

    let mut buf = [0u8; 8];
    assert_eq!(ports.read(fd, &mut buf), 4);
    assert_eq!(&buf[..4], b"ping");

    assert_eq!(ports.close(fd), 0);
    assert_eq!(ports.close(fd), -1);
    assert_eq!(api::errno(), errno::EBADF);
}

#[test]
fn test_port_api_reports_unreachable_baud() {
    let h = Harness::new(1);
    let ports = PortApi::with_backend(Box::new(h.backend));
    let fd = ports.open("COM1", OpenFlags::O_RDWR);

    let mut termios = serial_termios::Termios::default();
    assert_eq!(ports.tcgetattr(fd, &mut termios), 0);
    assert_eq!(api::cfsetospeed(&mut termios, 100_000), 0);
    assert_eq!(api::cfsetispeed(&mut termios, 100_000), 0);
    assert_eq!(ports.tcsetattr(fd, SetAttrWhen::Now, &termios), -1);
    assert_eq!(api::errno(), errno::EINVAL);
    assert!(api::perror_message("tcsetattr").starts_with("tcsetattr: Baud rate error"));
}
