// tests/loopback.rs
//
// End-to-end exercises over a pseudo-terminal pair: the port under test is
// the pty slave opened through the public API, and the test drives the
// other end through the master descriptor.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::pty::openpty;

use portlink::{
    Access, Baud, CancelToken, ControlConfig, DataConfig, Error, Parity, SerialPort,
};

/// Open a pty pair, wrap the slave in a SerialPort, and put it in raw
/// non-canonical mode so bytes move byte-for-byte.
fn open_loopback() -> (SerialPort, OwnedFd) {
    let pty = openpty(None, None).expect("openpty");
    let path = nix::unistd::ttyname(&pty.slave).expect("ttyname");
    let port = SerialPort::open(&path, Access::ReadWrite, false).expect("open slave");
    port.apply_control_config(&ControlConfig::default())
        .expect("raw mode");
    (port, pty.master)
}

/// Read from the master side until `expected` bytes arrived or a deadline
/// passes.
fn drain_master(master: &OwnedFd, expected: usize) -> Vec<u8> {
    let mut collected = Vec::with_capacity(expected);
    let mut buf = [0u8; 4096];
    let deadline = Instant::now() + Duration::from_secs(5);
    while collected.len() < expected && Instant::now() < deadline {
        match nix::unistd::read(master.as_raw_fd(), &mut buf) {
            Ok(0) => break,
            Ok(n) => collected.extend_from_slice(&buf[..n]),
            Err(nix::errno::Errno::EINTR) => continue,
            Err(nix::errno::Errno::EAGAIN) => {
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("master read failed: {}", e),
        }
    }
    collected
}

/// Deterministic payload that makes reorderings visible.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

#[test]
fn test_hello_roundtrip_with_unsignalled_token() {
    let (port, master) = open_loopback();
    port.apply_data_config(&DataConfig {
        baud: Baud::Standard(9600),
        data_bits: 8,
        stop_bits: 1,
        parity: Parity::None,
    })
    .expect("9600 8N1");

    nix::unistd::write(&master, b"HELLO").expect("write master");

    let token = CancelToken::new().expect("token");
    let mut buf = [0u8; 64];
    let n = port.read_into(&mut buf, Some(&token)).expect("read");
    assert_eq!(n, 5, "expected exactly the five bytes written");
    assert_eq!(&buf[..n], b"HELLO");
}

#[test]
fn test_loopback_byte_identity_up_to_2048() {
    let (port, master) = open_loopback();
    for len in [1usize, 7, 64, 511, 1024, 2048] {
        let data = pattern(len);
        port.write(&data, None).expect("write");
        let received = drain_master(&master, len);
        assert_eq!(received, data, "length {} must round-trip unchanged", len);
    }
}

#[test]
fn test_zero_length_write_is_rejected() {
    let (port, _master) = open_loopback();
    assert!(matches!(port.write(&[], None), Err(Error::EmptyWrite)));
}

#[test]
fn test_paced_write_delivers_in_order() {
    let (port, master) = open_loopback();
    let data = b"paced";
    port.write(data, Some(Duration::from_millis(2)))
        .expect("paced write");
    let received = drain_master(&master, data.len());
    assert_eq!(received, data);
}

#[test]
fn test_snapshot_read_empty_when_no_data() {
    let (port, _master) = open_loopback();
    let data = port.read(128).expect("snapshot read");
    assert!(data.is_empty(), "no queued data must read as empty, not error");
}

#[test]
fn test_cancelled_read_is_distinct_and_port_stays_usable() {
    let (port, master) = open_loopback();

    let token = CancelToken::new().expect("token");
    token.cancel().expect("signal before wait");

    match port.read_blocking(16, &token) {
        Err(Error::Cancelled) => {}
        Err(other) => panic!("expected Cancelled, got {}", other),
        Ok(_) => panic!("expected Cancelled, got data"),
    }

    // The port survives the cancellation and the token can arm again.
    nix::unistd::write(&master, b"X").expect("write master");
    let data = port.read_blocking(16, &token).expect("read after cancel");
    assert_eq!(data, b"X");
}

#[test]
fn test_cancel_unblocks_a_waiting_reader() {
    let (port, _master) = open_loopback();
    let token = Arc::new(CancelToken::new().expect("token"));

    let canceller = token.clone();
    let signal = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(100));
        canceller.cancel().expect("cancel");
    });

    let started = Instant::now();
    match port.read_blocking(16, &token) {
        Err(Error::Cancelled) => {}
        other => panic!("expected Cancelled, got {:?}", other.map(|_| ())),
    }
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "cancel must unblock promptly"
    );
    signal.join().expect("join canceller");
}

#[test]
fn test_write_direct_is_identical_across_the_threshold() {
    // Lengths straddling the vectored-I/O switchover must all arrive
    // byte-identical; the strategy boundary is invisible on the wire.
    for len in [3071usize, 3072, 3073, 9000] {
        let (port, master) = open_loopback();
        let data = pattern(len);

        let reader = std::thread::spawn(move || drain_master(&master, len));
        let written = port.write_direct(&data).expect("write_direct");
        assert_eq!(written, len);
        let received = reader.join().expect("join reader");
        assert_eq!(received, data, "length {} corrupted in transit", len);
    }
}

#[test]
fn test_read_direct_is_identical_across_the_threshold() {
    for len in [3000usize, 3072, 6000] {
        let (port, master) = open_loopback();
        let data = pattern(len);

        let to_send = data.clone();
        let writer = std::thread::spawn(move || {
            let mut off = 0;
            while off < to_send.len() {
                off += nix::unistd::write(&master, &to_send[off..]).expect("write master");
            }
            master
        });

        let mut collected = vec![0u8; len];
        let mut got = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while got < len && Instant::now() < deadline {
            let n = port.read_direct(&mut collected[got..]).expect("read_direct");
            if n == 0 {
                std::thread::sleep(Duration::from_millis(2));
            }
            got += n;
        }
        let _master = writer.join().expect("join writer");

        assert_eq!(got, len);
        assert_eq!(collected, data, "length {} corrupted in transit", len);
    }
}

#[test]
fn test_oversized_direct_transfer_is_rejected_before_any_io() {
    let (port, master) = open_loopback();
    // 500 segments of 3072 bytes is the cap; one byte more must fail.
    let oversized = vec![0u8; 500 * 3072 + 1];
    assert!(matches!(
        port.write_direct(&oversized),
        Err(Error::InvalidLength)
    ));
    let mut sink = vec![0u8; 500 * 3072 + 1];
    assert!(matches!(
        port.read_direct(&mut sink),
        Err(Error::InvalidLength)
    ));
    // Nothing was written as a side effect.
    nix::unistd::write(&master, b"probe").expect("write master");
    let data = port.read(16).expect("read probe");
    assert_eq!(data, b"probe");
}

#[test]
fn test_close_after_traffic() {
    let (port, master) = open_loopback();
    port.write(b"bye", None).expect("write");
    let received = drain_master(&master, 3);
    assert_eq!(received, b"bye");
    port.close().expect("close");
}
