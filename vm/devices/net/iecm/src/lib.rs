// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A user-mode driver for iecm (Infrastructure Data-path Function) network
//! devices: the virtchnl2 mailbox, the handshake with the control plane, and
//! split and single queue transmit and receive paths.

#![forbid(unsafe_code)]

pub mod adapter;
pub mod bufpool;
pub mod config;
pub mod ctlq;
pub mod error;
pub mod itr;
pub mod negotiate;
pub mod ptype;
pub mod resources;
pub mod ring;
pub mod rx;
pub mod tx;
pub mod virtchnl;
pub mod vport;
#[cfg(test)]
mod tests;
