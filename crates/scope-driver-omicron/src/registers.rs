//! Omicron status, failure and mode registers.
//!
//! Each register is a 16-bit word sent as hexadecimal. The `bitflags`
//! declarations below are the bit tables; conversion to and from the wire
//! goes through [`scope_core::bitfield`] only.

use bitflags::bitflags;
use scope_core::bitfield;
use scope_core::error::DeviceResult;
use std::fmt;

bitflags! {
    /// Actual status (`GAS`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Status: u16 {
        /// A pending or preceding error prevents normal operation
        const ERROR = 1 << 0;
        /// Emission on; working hours are counting
        const ON = 1 << 1;
        const PREHEATING = 1 << 2;
        const ATTENTION_REQUIRED = 1 << 4;
        /// Laser-enable input pin
        const ENABLED_PIN = 1 << 6;
        const KEY_SWITCH = 1 << 7;
        /// CDRH operation: key must be toggled before emission
        const TOGGLE_KEY = 1 << 8;
        const SYSTEM_POWER = 1 << 9;
        const EXTERNAL_SENSOR_CONNECTED = 1 << 13;
    }
}

bitflags! {
    /// Latched failures (`GLF`). Sticky until a reset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LatchedFailure: u16 {
        /// Safety lockout; mirrored in status bit 0
        const ERROR_STATE = 1 << 0;
        const CDRH = 1 << 4;
        const INTERNAL_COMMUNICATION_ERROR = 1 << 5;
        const K1_RELAY_ERROR = 1 << 6;
        const HIGH_POWER = 1 << 7;
        const UNDER_OVER_VOLTAGE = 1 << 8;
        const EXTERNAL_INTERLOCK = 1 << 9;
        const DIODE_CURRENT = 1 << 10;
        const AMBIENT_TEMP = 1 << 11;
        const DIODE_TEMP = 1 << 12;
        const TEST_ERROR = 1 << 13;
        const INTERNAL_ERROR = 1 << 14;
        const DIODE_POWER = 1 << 15;
    }
}

bitflags! {
    /// Operating mode (`GOM` / `SOM`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OperationMode: u16 {
        const INTERNAL_CLOCK_GENERATOR = 1 << 2;
        const BIAS_LEVEL_RELEASE = 1 << 3;
        const OPERATING_LEVEL_RELEASE = 1 << 4;
        const DIGITAL_INPUT_RELEASE = 1 << 5;
        const ANALOG_INPUT_RELEASE = 1 << 7;
        /// Automatic power control; cleared means constant current
        const APC_MODE = 1 << 8;
        const DIGITAL_INPUT_IMPEDANCE = 1 << 11;
        const ANALOG_INPUT_IMPEDANCE = 1 << 12;
        /// Device pushes `$` status frames
        const USB_ADHOC_MODE = 1 << 13;
        const AUTO_STARTUP = 1 << 14;
        const AUTO_POWERUP = 1 << 15;
    }
}

macro_rules! hex_register {
    ($($ty:ty),*) => {$(
        impl $ty {
            /// Decode from the device's hexadecimal form.
            pub fn from_hex(text: &str) -> DeviceResult<Self> {
                bitfield::decode_hex(text)
            }

            /// Encode to the device's hexadecimal form.
            pub fn to_hex(&self) -> String {
                bitfield::encode_hex(self)
            }

            /// Names of the set fields.
            pub fn active(&self) -> Vec<&'static str> {
                bitfield::active_fields(self)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{} [{}]", self.to_hex(), self.active().join(", "))
            }
        }
    )*};
}

hex_register!(Status, LatchedFailure, OperationMode);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_mode_identity_for_every_word() {
        for raw in 0..=u16::MAX {
            let mode = OperationMode::from_hex(&format!("{:x}", raw)).unwrap();
            assert_eq!(mode.bits(), raw);
            let again = OperationMode::from_hex(&mode.to_hex()).unwrap();
            assert_eq!(again, mode);
        }
    }

    #[test]
    fn test_digital_input_impedance_same_bit_both_ways() {
        let mode = OperationMode::from_hex("800").unwrap();
        assert!(mode.contains(OperationMode::DIGITAL_INPUT_IMPEDANCE));
        assert_eq!(OperationMode::DIGITAL_INPUT_IMPEDANCE.to_hex(), "800");
    }

    #[test]
    fn test_status_decode() {
        let status = Status::from_hex("0282").unwrap();
        assert!(status.contains(Status::ON));
        assert!(status.contains(Status::KEY_SWITCH));
        assert!(status.contains(Status::SYSTEM_POWER));
        assert!(!status.contains(Status::ERROR));
        assert_eq!(status.active(), vec!["ON", "KEY_SWITCH", "SYSTEM_POWER"]);
    }

    #[test]
    fn test_latched_failure_display() {
        let failure = LatchedFailure::from_hex("201").unwrap();
        assert_eq!(failure.to_string(), "0x201 [ERROR_STATE, EXTERNAL_INTERLOCK]");
    }

    #[test]
    fn test_initial_mode_encoding() {
        let mode = OperationMode::AUTO_POWERUP | OperationMode::USB_ADHOC_MODE | OperationMode::APC_MODE;
        assert_eq!(mode.to_hex(), "a100");
    }
}
