// src/config.rs
//
// Terminal configuration translator.
// Maps logical port parameters (baud, framing, flow control) to and from
// the OS termios bit layout. Every apply is read-modify-write against the
// current attributes; this module never writes a blindly constructed
// termios over a port.

use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Error, Result};
use crate::port::SerialPort;

// ============================================================================
// Types
// ============================================================================

/// Line speed. Standard rates are translated to termios constants; rates the
/// platform has no constant for are rejected rather than clamped. Custom
/// rates go through the platform's alternate-rate path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Baud {
    Standard(u32),
    Custom(u32),
}

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

/// Flow control discipline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    #[default]
    None,
    Hardware,
    Software,
}

/// Data format configuration: how bytes look on the wire electrically.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataConfig {
    pub baud: Baud,
    /// 5 to 8
    pub data_bits: u8,
    /// 1 or 2
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for DataConfig {
    fn default() -> Self {
        // Same defaults a freshly opened port is documented to carry: 9600 8N1.
        DataConfig {
            baud: Baud::Standard(9600),
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Transfer control configuration: flow control and error-reporting policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlConfig {
    pub flow_control: FlowControl,
    /// XON byte used when software flow control is enabled
    pub xon: u8,
    /// XOFF byte used when software flow control is enabled
    pub xoff: u8,
    /// Mark bytes carrying parity/framing errors with a \xFF\x00 prefix
    /// instead of silently dropping them. Requires parity to be enabled.
    pub mark_parity_errors: bool,
    /// Ring the input-overflow bell (IMAXBEL) when the input queue overruns.
    pub signal_input_overflow: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            flow_control: FlowControl::None,
            xon: 0x11,
            xoff: 0x13,
            mark_parity_errors: false,
            signal_input_overflow: false,
        }
    }
}

/// Raw termios attribute words, returned uninterpreted. Callers that need
/// bit-level control get the numbers as the OS holds them; this crate
/// deliberately does not decode them.
#[derive(Clone, Debug, Serialize)]
pub struct RawTermios {
    pub input_flags: u64,
    pub output_flags: u64,
    pub control_flags: u64,
    pub local_flags: u64,
    pub line_discipline: u8,
    pub control_chars: Vec<u8>,
    pub input_speed: u64,
    pub output_speed: u64,
}

// ============================================================================
// Baud translation
// ============================================================================

/// Translate a standard numeric rate to its termios constant.
/// Returns None for rates this platform has no constant for; those are an
/// explicit configuration error, never a silent clamp to the nearest rate.
pub(crate) fn baud_constant(rate: u32) -> Option<BaudRate> {
    match rate {
        0 => Some(BaudRate::B0),
        50 => Some(BaudRate::B50),
        75 => Some(BaudRate::B75),
        110 => Some(BaudRate::B110),
        134 => Some(BaudRate::B134),
        150 => Some(BaudRate::B150),
        200 => Some(BaudRate::B200),
        300 => Some(BaudRate::B300),
        600 => Some(BaudRate::B600),
        1200 => Some(BaudRate::B1200),
        1800 => Some(BaudRate::B1800),
        2400 => Some(BaudRate::B2400),
        4800 => Some(BaudRate::B4800),
        9600 => Some(BaudRate::B9600),
        19200 => Some(BaudRate::B19200),
        38400 => Some(BaudRate::B38400),
        57600 => Some(BaudRate::B57600),
        115200 => Some(BaudRate::B115200),
        230400 => Some(BaudRate::B230400),
        #[cfg(target_os = "linux")]
        460800 => Some(BaudRate::B460800),
        #[cfg(target_os = "linux")]
        500000 => Some(BaudRate::B500000),
        #[cfg(target_os = "linux")]
        576000 => Some(BaudRate::B576000),
        #[cfg(target_os = "linux")]
        921600 => Some(BaudRate::B921600),
        #[cfg(target_os = "linux")]
        1000000 => Some(BaudRate::B1000000),
        #[cfg(target_os = "linux")]
        1152000 => Some(BaudRate::B1152000),
        #[cfg(target_os = "linux")]
        1500000 => Some(BaudRate::B1500000),
        #[cfg(target_os = "linux")]
        2000000 => Some(BaudRate::B2000000),
        #[cfg(target_os = "linux")]
        2500000 => Some(BaudRate::B2500000),
        #[cfg(target_os = "linux")]
        3000000 => Some(BaudRate::B3000000),
        #[cfg(target_os = "linux")]
        3500000 => Some(BaudRate::B3500000),
        #[cfg(target_os = "linux")]
        4000000 => Some(BaudRate::B4000000),
        _ => None,
    }
}

// ============================================================================
// Apply / query
// ============================================================================

impl SerialPort {
    /// Apply the data-format half of the port configuration: baud rate,
    /// data bits, stop bits and parity.
    pub fn apply_data_config(&self, cfg: &DataConfig) -> Result<()> {
        if !(5..=8).contains(&cfg.data_bits) {
            return Err(Error::Config(ConfigError::InvalidParameter(
                "data bits must be 5 to 8",
            )));
        }
        if !(1..=2).contains(&cfg.stop_bits) {
            return Err(Error::Config(ConfigError::InvalidParameter(
                "stop bits must be 1 or 2",
            )));
        }

        let mut tio = termios::tcgetattr(self.fd()).map_err(Error::Io)?;

        let custom_rate = match cfg.baud {
            Baud::Standard(rate) => {
                let constant = baud_constant(rate)
                    .ok_or(Error::Config(ConfigError::UnsupportedBaud(rate)))?;
                termios::cfsetspeed(&mut tio, constant).map_err(Error::Io)?;
                None
            }
            Baud::Custom(rate) => Some(rate),
        };

        // Character size
        tio.control_flags.remove(ControlFlags::CSIZE);
        tio.control_flags.insert(match cfg.data_bits {
            5 => ControlFlags::CS5,
            6 => ControlFlags::CS6,
            7 => ControlFlags::CS7,
            _ => ControlFlags::CS8,
        });

        // One stop bit with CSTOPB clear, two with it set
        if cfg.stop_bits == 1 {
            tio.control_flags.remove(ControlFlags::CSTOPB);
        } else {
            tio.control_flags.insert(ControlFlags::CSTOPB);
        }

        // Clear existing parity bits, then set the requested mode. INPCK
        // enables input parity checking whenever parity is on.
        tio.control_flags
            .remove(ControlFlags::PARENB | ControlFlags::PARODD);
        #[cfg(target_os = "linux")]
        tio.control_flags
            .remove(ControlFlags::from_bits_retain(libc::CMSPAR));
        match cfg.parity {
            Parity::None => {}
            Parity::Odd => {
                tio.control_flags
                    .insert(ControlFlags::PARENB | ControlFlags::PARODD);
                tio.input_flags.insert(InputFlags::INPCK);
            }
            Parity::Even => {
                tio.control_flags.insert(ControlFlags::PARENB);
                tio.input_flags.insert(InputFlags::INPCK);
            }
            Parity::Mark => {
                self.mark_space_flags(&mut tio, true)?;
                tio.input_flags.insert(InputFlags::INPCK);
            }
            Parity::Space => {
                self.mark_space_flags(&mut tio, false)?;
                tio.input_flags.insert(InputFlags::INPCK);
            }
        }

        termios::tcsetattr(self.fd(), SetArg::TCSANOW, &tio).map_err(Error::Io)?;

        // The alternate-rate path rewrites the speed fields behind the back
        // of the portable termios interface, so it runs after the portable
        // attributes are in place.
        if let Some(rate) = custom_rate {
            self.set_custom_baud(rate)?;
        }

        Ok(())
    }

    /// Stick (mark/space) parity needs CMSPAR; platforms without it reject
    /// the request instead of approximating it.
    #[cfg(target_os = "linux")]
    fn mark_space_flags(&self, tio: &mut Termios, mark: bool) -> Result<()> {
        let cmspar = ControlFlags::from_bits_retain(libc::CMSPAR);
        tio.control_flags.insert(ControlFlags::PARENB | cmspar);
        if mark {
            tio.control_flags.insert(ControlFlags::PARODD);
        } else {
            tio.control_flags.remove(ControlFlags::PARODD);
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn mark_space_flags(&self, _tio: &mut Termios, _mark: bool) -> Result<()> {
        Err(Error::Config(ConfigError::MarkSpaceParity))
    }

    /// Apply the transfer-control half of the configuration: raw-mode line
    /// discipline, flow control, and parity/overflow reporting policy.
    ///
    /// Also fixes the port in non-canonical raw mode with `VMIN=0 VTIME=1`
    /// (a read waits at most 100 ms when no data is queued) and flushes
    /// both queues afterwards so stale bytes never leak into the new
    /// configuration.
    pub fn apply_control_config(&self, cfg: &ControlConfig) -> Result<()> {
        let mut tio = termios::tcgetattr(self.fd()).map_err(Error::Io)?;

        // Raw output, no line editing, no signals, no echo.
        tio.output_flags = OutputFlags::empty();
        tio.local_flags = LocalFlags::empty();
        #[cfg(target_os = "linux")]
        {
            tio.line_discipline = 0;
        }

        // CREAD enables receive; CLOCAL detaches the process from modem
        // status so a dropped carrier cannot deliver SIGHUP to the caller.
        tio.control_flags
            .insert(ControlFlags::CREAD | ControlFlags::CLOCAL | ControlFlags::HUPCL);

        tio.input_flags.remove(
            InputFlags::IGNBRK
                | InputFlags::IGNCR
                | InputFlags::INLCR
                | InputFlags::ICRNL
                | InputFlags::IXANY
                | InputFlags::IXON
                | InputFlags::IXOFF
                | InputFlags::INPCK
                | InputFlags::ISTRIP
                | InputFlags::BRKINT,
        );
        // nix's InputFlags has no IUCLC constant (legacy non-POSIX flag), so
        // build it from the libc bit to clear it.
        #[cfg(target_os = "linux")]
        tio.input_flags
            .remove(InputFlags::from_bits_retain(libc::IUCLC));

        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 1;

        match cfg.flow_control {
            FlowControl::None => {
                tio.input_flags
                    .remove(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
                tio.control_flags.remove(ControlFlags::CRTSCTS);
            }
            FlowControl::Hardware => {
                tio.input_flags.remove(InputFlags::IXON | InputFlags::IXOFF);
                tio.control_flags.insert(ControlFlags::CRTSCTS);
            }
            FlowControl::Software => {
                tio.control_flags.remove(ControlFlags::CRTSCTS);
                tio.input_flags.insert(InputFlags::IXON | InputFlags::IXOFF);
                tio.control_chars[SpecialCharacterIndices::VSTART as usize] = cfg.xon;
                tio.control_chars[SpecialCharacterIndices::VSTOP as usize] = cfg.xoff;
            }
        }

        if cfg.mark_parity_errors {
            // Marking only means something when the UART checks parity.
            if !tio.control_flags.contains(ControlFlags::PARENB) {
                return Err(Error::Config(ConfigError::ParityNotEnabled));
            }
            tio.input_flags.remove(InputFlags::IGNPAR);
            tio.input_flags.insert(InputFlags::PARMRK);
        } else {
            tio.input_flags.insert(InputFlags::IGNPAR);
            tio.input_flags.remove(InputFlags::PARMRK);
        }

        if cfg.signal_input_overflow {
            tio.input_flags.insert(InputFlags::IMAXBEL);
        } else {
            tio.input_flags.remove(InputFlags::IMAXBEL);
        }

        termios::tcsetattr(self.fd(), SetArg::TCSANOW, &tio).map_err(Error::Io)?;

        // Discard whatever arrived under the previous settings.
        let _ = termios::tcflush(self.fd(), FlushArg::TCIOFLUSH);

        Ok(())
    }

    /// Return the current attribute words uninterpreted. A deliberate
    /// numeric passthrough: callers that need bit-level control can do
    /// their own arithmetic on exactly what the OS holds.
    pub fn query_config(&self) -> Result<RawTermios> {
        let tio = termios::tcgetattr(self.fd()).map_err(Error::Io)?;
        let raw: libc::termios = tio.into();
        Ok(RawTermios {
            input_flags: raw.c_iflag as u64,
            output_flags: raw.c_oflag as u64,
            control_flags: raw.c_cflag as u64,
            local_flags: raw.c_lflag as u64,
            #[cfg(target_os = "linux")]
            line_discipline: raw.c_line,
            #[cfg(not(target_os = "linux"))]
            line_discipline: 0,
            control_chars: raw.c_cc.to_vec(),
            input_speed: raw.c_ispeed as u64,
            output_speed: raw.c_ospeed as u64,
        })
    }

    /// Precise control over blocking-read behaviour: VMIN is the byte count
    /// a read waits for, VTIME the inter-byte timer in deciseconds.
    pub fn fine_tune_read(&self, vmin: u8, vtime: u8) -> Result<()> {
        let mut tio = termios::tcgetattr(self.fd()).map_err(Error::Io)?;
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = vmin;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = vtime;
        termios::tcsetattr(self.fd(), SetArg::TCSANOW, &tio).map_err(Error::Io)
    }

    /// Program a rate outside the standard constants.
    /// Linux: termios2 with BOTHER. macOS: IOSSIOSPEED.
    #[cfg(target_os = "linux")]
    fn set_custom_baud(&self, rate: u32) -> Result<()> {
        use std::os::fd::AsRawFd;

        nix::ioctl_read!(tcgets2, b'T', 0x2A, libc::termios2);
        nix::ioctl_write_ptr!(tcsets2, b'T', 0x2B, libc::termios2);

        let mut tio2: libc::termios2 = unsafe { std::mem::zeroed() };
        let read = unsafe { tcgets2(self.fd().as_raw_fd(), &mut tio2) };
        read.map_err(Error::Io)?;
        tio2.c_cflag &= !libc::CBAUD;
        tio2.c_cflag |= libc::BOTHER;
        tio2.c_ispeed = rate;
        tio2.c_ospeed = rate;
        let write = unsafe { tcsets2(self.fd().as_raw_fd(), &tio2) };
        write.map_err(Error::Io)?;
        Ok(())
    }

    #[cfg(target_os = "macos")]
    fn set_custom_baud(&self, rate: u32) -> Result<()> {
        use std::os::fd::AsRawFd;

        // IOSSIOSPEED = _IOW('T', 2, speed_t); not exposed by libc.
        nix::ioctl_write_ptr_bad!(iossiospeed, 0x8008_5402u64, libc::speed_t);

        let speed = rate as libc::speed_t;
        let res = unsafe { iossiospeed(self.fd().as_raw_fd(), &speed) };
        res.map_err(Error::Io)?;
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    fn set_custom_baud(&self, _rate: u32) -> Result<()> {
        Err(Error::NotSupported)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::tests::open_pty_port;

    #[test]
    fn test_baud_constant_standard_rates() {
        assert!(matches!(baud_constant(9600), Some(BaudRate::B9600)));
        assert!(matches!(baud_constant(115200), Some(BaudRate::B115200)));
        assert!(matches!(baud_constant(50), Some(BaudRate::B50)));
        assert!(matches!(baud_constant(230400), Some(BaudRate::B230400)));
    }

    #[test]
    fn test_baud_constant_unmapped_rates_are_none() {
        // Rates some UARTs support but termios has no constant for; these
        // must surface as unsupported, not get clamped to a neighbour.
        for rate in [14400, 28800, 56000, 128000, 153600, 256000, 12345] {
            assert!(baud_constant(rate).is_none(), "rate {} should be unmapped", rate);
        }
    }

    #[test]
    fn test_unsupported_standard_baud_is_an_error() {
        let (port, _master) = open_pty_port();
        let cfg = DataConfig {
            baud: Baud::Standard(14400),
            ..DataConfig::default()
        };
        match port.apply_data_config(&cfg) {
            Err(Error::Config(ConfigError::UnsupportedBaud(14400))) => {}
            other => panic!("expected UnsupportedBaud, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_framing_parameters() {
        let (port, _master) = open_pty_port();
        let bad_bits = DataConfig {
            data_bits: 9,
            ..DataConfig::default()
        };
        assert!(matches!(
            port.apply_data_config(&bad_bits),
            Err(Error::Config(ConfigError::InvalidParameter(_)))
        ));
        let bad_stop = DataConfig {
            stop_bits: 3,
            ..DataConfig::default()
        };
        assert!(matches!(
            port.apply_data_config(&bad_stop),
            Err(Error::Config(ConfigError::InvalidParameter(_)))
        ));
    }

    #[test]
    fn test_parity_marking_requires_parity() {
        let (port, _master) = open_pty_port();
        port.apply_data_config(&DataConfig::default()).expect("8N1");
        let cfg = ControlConfig {
            mark_parity_errors: true,
            ..ControlConfig::default()
        };
        assert!(matches!(
            port.apply_control_config(&cfg),
            Err(Error::Config(ConfigError::ParityNotEnabled))
        ));
    }

    #[test]
    fn test_parity_marking_with_parity_enabled() {
        let (port, _master) = open_pty_port();
        port.apply_data_config(&DataConfig {
            parity: Parity::Even,
            ..DataConfig::default()
        })
        .expect("8E1");
        let cfg = ControlConfig {
            mark_parity_errors: true,
            ..ControlConfig::default()
        };
        port.apply_control_config(&cfg).expect("control config");
        let raw = port.query_config().expect("query");
        assert_ne!(raw.input_flags & libc::PARMRK as u64, 0);
        assert_eq!(raw.input_flags & libc::IGNPAR as u64, 0);
    }

    #[test]
    fn test_apply_and_query_9600_8n1() {
        let (port, _master) = open_pty_port();
        port.apply_data_config(&DataConfig::default()).expect("8N1");
        port.apply_control_config(&ControlConfig::default())
            .expect("control");

        let raw = port.query_config().expect("query");
        assert_eq!(
            raw.control_flags & libc::CSIZE as u64,
            libc::CS8 as u64,
            "expected CS8"
        );
        assert_eq!(raw.control_flags & libc::PARENB as u64, 0);
        assert_eq!(raw.control_flags & libc::CSTOPB as u64, 0);
        assert_eq!(raw.input_flags & libc::IXON as u64, 0);
        assert_eq!(raw.output_flags, 0, "raw output expected");
        assert_eq!(raw.local_flags, 0, "non-canonical mode expected");
    }

    #[test]
    fn test_fine_tune_read_sets_vmin_vtime() {
        let (port, _master) = open_pty_port();
        port.fine_tune_read(4, 7).expect("fine tune");
        let raw = port.query_config().expect("query");
        assert_eq!(raw.control_chars[libc::VMIN], 4);
        assert_eq!(raw.control_chars[libc::VTIME], 7);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_custom_baud_goes_through_alternate_rate_path() {
        let (port, _master) = open_pty_port();
        let cfg = DataConfig {
            baud: Baud::Custom(250_000),
            ..DataConfig::default()
        };
        port.apply_data_config(&cfg).expect("custom baud");
    }

    #[test]
    fn test_config_serializes_for_profiles() {
        let cfg = DataConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        assert!(json.contains("9600"));
        let back: DataConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, cfg);
    }
}
