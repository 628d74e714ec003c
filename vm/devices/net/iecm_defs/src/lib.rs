// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions shared by the iecm driver and device models: the control
//! queue descriptor, the Tx/Rx descriptor formats, the virtchnl2 message set
//! and the register layout of BAR 0.

#![forbid(unsafe_code)]

/// Defines a transparent integer newtype with named constants, for protocol
/// fields that may carry values this crate does not know about.
macro_rules! wire_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[derive(
            ::zerocopy::IntoBytes,
            ::zerocopy::Immutable,
            ::zerocopy::KnownLayout,
            ::zerocopy::FromBytes
        )]
        #[repr(transparent)]
        $(#[$a])*
        $v struct $name(pub $storage);

        #[allow(missing_docs)]
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                #![allow(unreachable_patterns)]
                let s = match *self {
                    $( Self::$variant => stringify!($variant), )*
                    _ => {
                        return ::core::fmt::Debug::fmt(&self.0, fmt);
                    }
                };
                fmt.pad(s)
            }
        }
    }
}

pub mod ctlq;
pub mod regs;
pub mod txrx;
pub mod virtchnl2;
