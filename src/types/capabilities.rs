use crate::Error;

/// Device I/O capabilities
// ([Vol 3] Part H, Section 2.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCapabilities {
    /// Display only
    DisplayOnly,
    /// Yes/no display
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input and no output
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapabilities {
    /// Row/column of this capability in the legacy pairing method table
    // ([Vol 3] Part H, Section 2.3.5.1, Table 2.8).
    pub(crate) const fn table_index(self) -> usize {
        match self {
            IoCapabilities::DisplayOnly => 0,
            IoCapabilities::DisplayYesNo => 1,
            IoCapabilities::KeyboardOnly => 2,
            IoCapabilities::NoInputNoOutput => 3,
            IoCapabilities::KeyboardDisplay => 4,
        }
    }

    /// Can the user type a passkey on this device?
    pub fn has_keyboard(self) -> bool {
        matches!(self, IoCapabilities::KeyboardOnly | IoCapabilities::KeyboardDisplay)
    }

    /// Can this device show a passkey?
    pub fn has_display(self) -> bool {
        matches!(
            self,
            IoCapabilities::DisplayOnly | IoCapabilities::DisplayYesNo | IoCapabilities::KeyboardDisplay
        )
    }
}

impl TryFrom<u8> for IoCapabilities {
    type Error = Error;
    fn try_from(val: u8) -> Result<Self, Error> {
        Ok(match val {
            0x00 => Self::DisplayOnly,
            0x01 => Self::DisplayYesNo,
            0x02 => Self::KeyboardOnly,
            0x03 => Self::NoInputNoOutput,
            0x04 => Self::KeyboardDisplay,
            _ => return Err(Error::InvalidValue),
        })
    }
}

impl From<IoCapabilities> for u8 {
    fn from(val: IoCapabilities) -> u8 {
        val.table_index() as u8
    }
}

impl AsRef<str> for IoCapabilities {
    fn as_ref(&self) -> &str {
        match self {
            IoCapabilities::DisplayOnly => "Display Only",
            IoCapabilities::DisplayYesNo => "Display Yes/No",
            IoCapabilities::KeyboardOnly => "Keyboard Only",
            IoCapabilities::NoInputNoOutput => "No Input / No Output",
            IoCapabilities::KeyboardDisplay => "Keyboard and Display",
        }
    }
}

impl core::fmt::Display for IoCapabilities {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for IoCapabilities {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "{}", self.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_capabilities_variants() {
        assert!(u8::from(IoCapabilities::DisplayOnly) == 0);
        assert!(u8::from(IoCapabilities::DisplayYesNo) == 1);
        assert!(u8::from(IoCapabilities::KeyboardOnly) == 2);
        assert!(u8::from(IoCapabilities::NoInputNoOutput) == 3);
        assert!(u8::from(IoCapabilities::KeyboardDisplay) == 4);

        for n in 0..=4u8 {
            assert!(u8::from(IoCapabilities::try_from(n).unwrap()) == n);
        }
        for n in 5..u8::MAX {
            assert!(IoCapabilities::try_from(n) == Err(Error::InvalidValue));
        }
    }

    #[test]
    fn keyboard_and_display() {
        assert!(IoCapabilities::KeyboardDisplay.has_keyboard());
        assert!(IoCapabilities::KeyboardDisplay.has_display());
        assert!(!IoCapabilities::NoInputNoOutput.has_keyboard());
        assert!(!IoCapabilities::NoInputNoOutput.has_display());
        assert!(!IoCapabilities::DisplayYesNo.has_keyboard());
    }
}
