//! Symbol references captured from host code, and the identities used to target methods.

use std::fmt::Display;

/// An opaque reference to something in the host program. Symbols are compared by their
/// signature string, because that is the only stable identity the host exposes to us.
///
/// A symbol is resolved exactly once, while matching against a method body. Spliced code
/// reuses the captured value verbatim; we never go back to a textual name at splice time,
/// as the signature behind a name can drift between host versions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Symbol {
    /// A field of some host type.
    Field { signature: String },

    /// A method. The argument count and return flag are part of the signature in the
    /// host's metadata, so they are trusted for stack accounting.
    Method {
        signature: String,
        args: u8,
        returns: bool,
    },

    /// A local-variable slot in the method being patched.
    Local { slot: u16 },
}

impl Symbol {
    pub fn field(signature: impl Into<String>) -> Symbol {
        Symbol::Field {
            signature: signature.into(),
        }
    }

    pub fn method(signature: impl Into<String>, args: u8, returns: bool) -> Symbol {
        Symbol::Method {
            signature: signature.into(),
            args,
            returns,
        }
    }

    pub fn local(slot: u16) -> Symbol {
        Symbol::Local { slot }
    }

    /// Returns the signature string this symbol is compared by.
    pub fn signature(&self) -> std::borrow::Cow<'_, str> {
        match self {
            Symbol::Field { signature } | Symbol::Method { signature, .. } => {
                std::borrow::Cow::Borrowed(signature)
            }
            Symbol::Local { slot } => std::borrow::Cow::Owned(format!("local_{slot}")),
        }
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.signature())
    }
}

/// Identifies a method in the host program: declaring type plus member signature.
///
/// Identities are supplied by whichever subsystem wants a patch applied; the engine does
/// not discover targets on its own.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodIdentity {
    pub declaring_type: String,
    pub signature: String,
}

impl MethodIdentity {
    pub fn new(declaring_type: impl Into<String>, signature: impl Into<String>) -> MethodIdentity {
        MethodIdentity {
            declaring_type: declaring_type.into(),
            signature: signature.into(),
        }
    }
}

impl Display for MethodIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.declaring_type, self.signature)
    }
}
