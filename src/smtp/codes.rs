//-
// Copyright (c) 2026, Jason Lingle
//
// This file is part of Petramap.
//
// Petramap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Petramap is distributed in the hope that  it will be useful, but WITHOUT
// ANY  WARRANTY; without  even the  implied warranty  of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Petramap. If not, see <http://www.gnu.org/licenses/>.

//! The SMTP reply codes we send, from RFC 5321 (and RFC 4954 for AUTH).
//!
//! The module is designed to be wildcard-imported via the `rc` alias for
//! consistent short spellings at use sites.
#![allow(dead_code)]

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ReplyCode {
    HelpMessage = 214,
    ServiceReady = 220,
    ServiceClosing = 221,
    AuthenticationSucceeded = 235,
    Ok = 250,
    ServerChallenge = 334,
    StartMailInput = 354,
    ServiceNotAvailableClosing = 421,
    ActionAborted = 451,
    CommandSyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequenceOfCommands = 503,
    CommandParameterNotImplemented = 504,
    AuthenticationCredentialsInvalid = 535,
    ActionNotTakenPermanent = 550,
}

impl ReplyCode {
    /// 4xx and 5xx are errors.
    pub fn is_error(self) -> bool {
        self as u16 >= 400
    }
}

pub mod rc {
    pub use super::ReplyCode::*;
}
