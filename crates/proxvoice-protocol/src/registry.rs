/// Declares a packet enum whose variants wrap same-named [`crate::io::Wire`]
/// structs, together with the opcode table used to encode and decode it.
///
/// The generated `decode_body` rejects unknown opcodes and bodies that leave
/// bytes unread.
macro_rules! packet_registry {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($variant:ident = $opcode:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        pub enum $name {
            $($variant($variant),)*
        }

        impl $name {
            pub const OPCODES: &'static [u8] = &[$($opcode),*];

            pub fn opcode(&self) -> u8 {
                match self {
                    $(Self::$variant(_) => $opcode,)*
                }
            }

            /// Opcode byte followed by the body.
            pub fn encode(&self) -> Vec<u8> {
                let mut w = $crate::io::Writer::with_capacity(64);
                w.write_u8(self.opcode());
                match self {
                    $(Self::$variant(packet) => $crate::io::Wire::write(packet, &mut w),)*
                }
                w.into_vec()
            }

            /// Decode a message produced by [`Self::encode`].
            pub fn decode(bytes: &[u8]) -> Result<Self, $crate::error::ProtocolError> {
                let (&opcode, body) = bytes.split_first().ok_or(
                    $crate::error::ProtocolError::PacketTooShort { expected: 1, got: 0 },
                )?;
                Self::decode_body(opcode, body)
            }

            pub fn decode_body(opcode: u8, body: &[u8]) -> Result<Self, $crate::error::ProtocolError> {
                let mut r = $crate::io::Reader::new(body);
                let packet = match opcode {
                    $($opcode => Self::$variant(<$variant as $crate::io::Wire>::read(&mut r)?),)*
                    other => return Err($crate::error::ProtocolError::UnknownOpcode(other)),
                };
                r.finish()?;
                Ok(packet)
            }
        }

        $(
            impl From<$variant> for $name {
                fn from(packet: $variant) -> Self {
                    Self::$variant(packet)
                }
            }
        )*
    };
}
