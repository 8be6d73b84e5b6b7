//! Capability probing for exportable handle types.
//!
//! The native side knows which handle types exist on the platform and how to
//! ask the driver about them; the search itself is shared. Candidates are
//! tried in priority order and the first one the driver reports as both
//! exportable and compatible wins. An empty or fully unsupported list yields
//! `None`, never an out-of-range index.

use std::fmt;

use tracing::debug;

use crate::error::InteropError;

/// What an exportable handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Semaphore,
    Memory,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Semaphore => f.write_str("semaphore"),
            HandleKind::Memory => f.write_str("memory"),
        }
    }
}

/// OS handle conventions for exported GPU objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExternalHandleType {
    /// POSIX file descriptor, ownership moves on import.
    OpaqueFd,
    /// NT handle, must be closed by the exporter after import.
    OpaqueWin32,
    /// Global share handle, not reference counted.
    OpaqueWin32Kmt,
    /// Semaphores only.
    D3d12Fence,
    /// Semaphores only, Linux sync_file.
    SyncFd,
}

impl ExternalHandleType {
    /// Handle is a file descriptor rather than a Win32 `HANDLE`.
    pub fn is_fd(self) -> bool {
        matches!(self, ExternalHandleType::OpaqueFd | ExternalHandleType::SyncFd)
    }

    /// Exporter keeps ownership of the handle after a successful import and
    /// must close it.
    pub fn exporter_closes(self) -> bool {
        matches!(
            self,
            ExternalHandleType::OpaqueWin32 | ExternalHandleType::D3d12Fence
        )
    }
}

/// Driver answer for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleSupport {
    pub exportable: bool,
    /// Can be imported back by another API instance.
    pub compatible: bool,
}

impl HandleSupport {
    pub fn usable(self) -> bool {
        self.exportable && self.compatible
    }
}

/// Platform-specific knowledge of which handle types to try.
pub trait ExternalHandleProvider {
    /// Semaphore handle types in priority order.
    fn semaphore_candidates(&self) -> &[ExternalHandleType];

    /// Memory handle types in priority order.
    fn memory_candidates(&self) -> &[ExternalHandleType];
}

/// First candidate for which `query` reports a usable handle.
pub fn find_compatible<T, F>(candidates: &[T], mut query: F) -> Option<T>
where
    T: Copy + fmt::Debug,
    F: FnMut(T) -> HandleSupport,
{
    candidates.iter().copied().find(|&candidate| {
        let support = query(candidate);
        debug!("handle candidate {candidate:?}: {support:?}");
        support.usable()
    })
}

/// Like [`find_compatible`], but an exhausted list is an error.
pub fn require_compatible<F>(
    kind: HandleKind,
    candidates: &[ExternalHandleType],
    query: F,
) -> Result<ExternalHandleType, InteropError>
where
    F: FnMut(ExternalHandleType) -> HandleSupport,
{
    find_compatible(candidates, query).ok_or(InteropError::NoCompatibleHandleType {
        kind,
        candidates: candidates.len(),
    })
}

/// An exported OS handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHandle {
    Fd(i32),
    Win32(isize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supported(exportable: bool, compatible: bool) -> HandleSupport {
        HandleSupport {
            exportable,
            compatible,
        }
    }

    #[test]
    fn first_usable_candidate_wins() {
        let candidates = [
            ExternalHandleType::OpaqueWin32,
            ExternalHandleType::OpaqueWin32Kmt,
            ExternalHandleType::D3d12Fence,
        ];
        let found = find_compatible(&candidates, |ty| match ty {
            ExternalHandleType::OpaqueWin32 => supported(true, false),
            _ => supported(true, true),
        });
        assert_eq!(found, Some(ExternalHandleType::OpaqueWin32Kmt));
    }

    #[test]
    fn empty_list_is_unsupported() {
        let mut queried = 0;
        let found = find_compatible::<ExternalHandleType, _>(&[], |_| {
            queried += 1;
            supported(true, true)
        });
        assert_eq!(found, None);
        assert_eq!(queried, 0);
    }

    #[test]
    fn no_match_is_an_error() {
        let err = require_compatible(
            HandleKind::Semaphore,
            &[ExternalHandleType::OpaqueFd],
            |_| supported(false, true),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            InteropError::NoCompatibleHandleType {
                kind: HandleKind::Semaphore,
                candidates: 1
            }
        ));
    }

    #[test]
    fn ownership_rules() {
        assert!(ExternalHandleType::OpaqueFd.is_fd());
        assert!(ExternalHandleType::OpaqueWin32.exporter_closes());
        assert!(!ExternalHandleType::OpaqueWin32Kmt.exporter_closes());
    }
}
