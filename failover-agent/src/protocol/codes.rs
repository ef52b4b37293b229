//! Byte-level vocabularies of the protocol.
//!
//! Each enum below owns its single encode/decode table; nothing else in the
//! crate spells out the numeric values.

use crate::utils::errors::AgentError;

macro_rules! wire_codes {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($what:literal) {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl $name {
            pub const fn to_byte(self) -> u8 {
                match self {
                    $(Self::$variant => $value,)+
                }
            }

            pub fn from_byte(byte: u8) -> crate::Result<Self> {
                match byte {
                    $($value => Ok(Self::$variant),)+
                    other => Err(AgentError::Protocol(format!(
                        concat!("unknown ", $what, " 0x{:02x}"),
                        other
                    ))),
                }
            }
        }
    };
}

wire_codes! {
    /// Per-entry outcome returned by the receiver.
    pub enum Decision ("decision") {
        NoChange = 0,
        /// Destination changed, no content needed.
        Modified = 1,
        /// Existing regular file differs; resend the whole file.
        ModifiedRequestData = 2,
        /// New regular file; send its content.
        NewRequestData = 3,
    }
}

impl Decision {
    /// Whether the sender must follow up with a content sub-stream.
    pub fn requests_data(self) -> bool {
        matches!(self, Decision::ModifiedRequestData | Decision::NewRequestData)
    }

    pub fn is_change(self) -> bool {
        self != Decision::NoChange
    }
}

wire_codes! {
    /// Control and status codes framing the session.
    pub enum ControlCode ("control code") {
        /// Another content chunk follows.
        Next = 1,
        Done = 2,
        /// Followed by a UTF-8 message.
        IoError = 3,
        /// Followed by a UTF-8 message.
        ValidationError = 4,
        Proceed = 5,
    }
}

wire_codes! {
    /// First byte a client sends on a fresh session.
    pub enum RequestType ("request type") {
        FailoverReplication = 1,
    }
}
