// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Every core entry point ultimately returns an [`abi::Status`] to its
//! caller (spec.md §6/§7), but internally we work with [`CoreError`] so that
//! error paths can carry a little more context (e.g. which side of a
//! cross-domain interaction is at fault) without inventing new status codes
//! on the wire.

use abi::Status;

/// Internal error type for core operations. Cheap to construct, carries no
/// allocation; narrows to a wire [`Status`] at the API boundary.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CoreError {
    InvalidParam,
    NoMemory,
    Permission,
    NotFound,
    Timeout,
    Busy,
    NotSupported,
    CapInvalid,
    CapRevoked,
    InvalidDomain,
    QuotaExceeded,
    InvalidState,
    NoResource,
    AlreadyExists,
}

impl CoreError {
    /// Whether this error class is audited as `CAP_VERIFY` (spec.md §7:
    /// "Authority errors ... Audited as CAP_VERIFY with success=false").
    pub fn is_authority_error(self) -> bool {
        matches!(
            self,
            CoreError::Permission
                | CoreError::CapInvalid
                | CoreError::CapRevoked
                | CoreError::InvalidDomain
        )
    }

    /// Whether this error class represents ambient resource exhaustion the
    /// caller may retry (spec.md §7: "Resource errors").
    pub fn is_resource_error(self) -> bool {
        matches!(
            self,
            CoreError::NoMemory
                | CoreError::QuotaExceeded
                | CoreError::Busy
                | CoreError::NoResource
        )
    }
}

impl From<CoreError> for Status {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidParam => Status::InvalidParam,
            CoreError::NoMemory => Status::NoMemory,
            CoreError::Permission => Status::Permission,
            CoreError::NotFound => Status::NotFound,
            CoreError::Timeout => Status::Timeout,
            CoreError::Busy => Status::Busy,
            CoreError::NotSupported => Status::NotSupported,
            CoreError::CapInvalid => Status::CapInvalid,
            CoreError::CapRevoked => Status::CapRevoked,
            CoreError::InvalidDomain => Status::InvalidDomain,
            CoreError::QuotaExceeded => Status::QuotaExceeded,
            CoreError::InvalidState => Status::InvalidState,
            CoreError::NoResource => Status::NoResource,
            CoreError::AlreadyExists => Status::AlreadyExists,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// A fault that arose from the interaction between two domains during a
/// cross-domain call (spec.md §4.9, §4.6). Mirrors the teacher's
/// `InteractFault`, generalized from task-pairs to domain-pairs: by
/// convention this won't have both fields `None`, though nothing enforces
/// that.
#[derive(Copy, Clone, Debug, Default)]
pub struct InteractFault {
    pub src: Option<crate::fault::Fault>,
    pub dst: Option<crate::fault::Fault>,
}

impl InteractFault {
    pub fn in_src(f: crate::fault::Fault) -> Self {
        Self {
            src: Some(f),
            dst: None,
        }
    }

    pub fn in_dst(f: crate::fault::Fault) -> Self {
        Self {
            src: None,
            dst: Some(f),
        }
    }
}
