use std::time::Duration;

use crate::Core::error::{EngineError, EngineResult};

/// Native sync-fence descriptor. Negative values mean "no fence / already signalled".
pub type RawFence = i32;

/// Fence value that is always considered satisfied.
pub const INVALID_FENCE: RawFence = -1;

/// Waits until `fence` signals or `timeout` expires.
///
/// A fence is a pollable descriptor that becomes readable once the producer is done with the
/// buffer. An invalid fence returns immediately.
#[cfg(unix)]
pub fn fence_wait(fence: RawFence, timeout: Duration) -> EngineResult<()> {
    if fence < 0 {
        return Ok(());
    }

    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    let mut pfd = libc::pollfd {
        fd: fence,
        events: libc::POLLIN,
        revents: 0,
    };

    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc > 0 {
            if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(EngineError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("fence {} reported revents {:#x}", fence, pfd.revents),
                )));
            }
            return Ok(());
        }
        if rc == 0 {
            return Err(EngineError::FenceTimeout {
                fd: fence,
                timeout_ms: timeout_ms as u64,
            });
        }

        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(EngineError::Io(err));
        }
        // EINTR: retry with the same budget
    }
}

/// Closes a fence descriptor. Invalid fences are ignored.
#[cfg(unix)]
pub fn fence_close(fence: RawFence) {
    if fence >= 0 {
        unsafe {
            libc::close(fence);
        }
    }
}

#[cfg(not(unix))]
pub fn fence_wait(_fence: RawFence, _timeout: Duration) -> EngineResult<()> {
    // No native fences off unix
    Ok(())
}

#[cfg(not(unix))]
pub fn fence_close(_fence: RawFence) {}
