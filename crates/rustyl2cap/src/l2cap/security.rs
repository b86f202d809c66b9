//! Security access check seam
//!
//! Before a channel is connected the security manager decides whether the
//! PSM may be used over the link. The check is usually asynchronous; the
//! answer comes back through
//! [`L2capManager::security_complete`](super::L2capManager::security_complete).

use super::types::{BdAddr, ChannelId};

/// Outcome of a security access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityStatus {
    /// The check is running; completion is reported later
    Started,
    /// Access granted
    Success,
    /// Access denied with an HCI/BTM status code
    Failed(u8),
    /// Encryption has not been reported yet; check again after a delay
    DelayCheck,
}

/// Security access check consumed by the channel state machine
pub trait SecurityManager {
    /// Ask whether `psm` may be used on the link to `bd_addr`.
    ///
    /// An immediate answer is returned directly; `Started` means the manager
    /// will call back with the same `cid`.
    fn access_request(
        &mut self,
        bd_addr: BdAddr,
        psm: u16,
        handle: Option<u16>,
        is_originator: bool,
        cid: ChannelId,
    ) -> SecurityStatus;

    /// Cancel any pending check for the link
    fn abort_access_request(&mut self, bd_addr: BdAddr);
}

/// Security manager that grants every request immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecurity;

impl SecurityManager for NoSecurity {
    fn access_request(
        &mut self,
        _bd_addr: BdAddr,
        _psm: u16,
        _handle: Option<u16>,
        _is_originator: bool,
        _cid: ChannelId,
    ) -> SecurityStatus {
        SecurityStatus::Success
    }

    fn abort_access_request(&mut self, _bd_addr: BdAddr) {}
}
