//! The Windows message-copy adapter for the `AgentSsh` class (spec.md
//! §4.3). The host agent's SSH endpoint is a window, not a socket; this
//! module models it as a single-owner actor that client workers submit
//! requests to, so the window handle and its retry policy are only ever
//! touched from one place.
//!
//! The retry policy itself is platform-independent and exercised by
//! tests against a fake [`PageantTransport`]; only [`Win32Transport`]
//! needs the real `windows` crate calls and only builds on Windows.

use std::time::Duration;

use log::{error, trace, warn};
use tokio::sync::Semaphore;

use crate::error::{BridgeError, Result};

/// Platform maximum message length for the Pageant-style IPC mapping.
/// PuTTY currently uses 8k; 16k leaves headroom.
pub const MAX_MESSAGE_LEN: usize = 16384;

/// Up to 4 in-flight exchanges may share the window: each owns an
/// independent named mapping slot, but every exchange still runs its
/// `SendMessageTimeout` to completion before the next is serviced on
/// that slot.
const CONCURRENT_SLOTS: usize = 4;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RETRIES: u32 = 3;

const ERROR_TIMEOUT: u32 = 1460;
const ERROR_INVALID_WINDOW_HANDLE: u32 = 1400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRpcFailure {
    Timeout,
    InvalidWindowHandle,
    Other(u32),
}

impl AgentRpcFailure {
    pub fn classify(win32_error: u32) -> AgentRpcFailure {
        match win32_error {
            ERROR_TIMEOUT => AgentRpcFailure::Timeout,
            ERROR_INVALID_WINDOW_HANDLE => AgentRpcFailure::InvalidWindowHandle,
            other => AgentRpcFailure::Other(other),
        }
    }
}

/// One exchange with the native agent: send `request`, get back the
/// decoded reply payload (length prefix already stripped).
pub trait PageantTransport: Send {
    /// Sends one framed request and returns the reply payload, or the
    /// classified failure.
    fn send(
        &mut self,
        request: &[u8],
    ) -> std::result::Result<Vec<u8>, AgentRpcFailure>;

    /// Re-resolves the window handle after an `InvalidWindowHandle`
    /// failure.
    fn reopen(&mut self) -> std::result::Result<(), AgentRpcFailure>;
}

/// Runs the retry policy in spec.md §4.3 / §8 around one transport:
/// timeout retried up to 3 times; stale handle reopened and retried up
/// to 3 times; anything else is immediately fatal for this message.
pub fn send_with_retry(
    transport: &mut dyn PageantTransport,
    request: &[u8],
) -> Result<Vec<u8>> {
    let mut attempts = 0;
    loop {
        match transport.send(request) {
            Ok(reply) => return Ok(reply),
            Err(AgentRpcFailure::Timeout) if attempts < MAX_RETRIES => {
                attempts += 1;
                warn!("agent message timed out, retry {attempts}/{MAX_RETRIES}");
            }
            Err(AgentRpcFailure::InvalidWindowHandle) if attempts < MAX_RETRIES => {
                attempts += 1;
                warn!("stale window handle, reopening, retry {attempts}/{MAX_RETRIES}");
                if let Err(e) = transport.reopen() {
                    error!("failed to reopen agent window: {e:?}");
                    return Err(BridgeError::AgentRpc(format!(
                        "failed to reopen agent window: {e:?}"
                    )));
                }
            }
            Err(e) => {
                error!("agent RPC exhausted retries: {e:?}");
                return Err(BridgeError::AgentRpc(format!("{e:?}")));
            }
        }
    }
}

/// Bounds concurrent exchanges against the native window to
/// [`CONCURRENT_SLOTS`], mirroring the teacher's 4-permit semaphore plus
/// its `find_available_token`/`release_token` bitmap (`src/ssh.rs`). The
/// semaphore alone only bounds *how many* exchanges run at once; it says
/// nothing about *which* of the 4 named mapping slots each one uses, so a
/// slot must be handed out from a tracked free set, not derived from
/// anything per-connection (like an accept-order round robin), or two
/// connections can be handed the same slot and share one named mapping.
pub struct SshAdapter {
    concurrency: Semaphore,
    free_slots: parking_lot::Mutex<u8>,
}

impl Default for SshAdapter {
    fn default() -> Self {
        SshAdapter {
            concurrency: Semaphore::new(CONCURRENT_SLOTS),
            free_slots: parking_lot::Mutex::new(0),
        }
    }
}

impl SshAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the lowest-numbered slot not already in use. The semaphore
    /// permit acquired by the caller guarantees one is free.
    fn acquire_slot(&self) -> usize {
        let mut bitmap = self.free_slots.lock();
        for slot in 0..CONCURRENT_SLOTS {
            if *bitmap & (1 << slot) == 0 {
                *bitmap |= 1 << slot;
                return slot;
            }
        }
        unreachable!("semaphore bounds concurrency to CONCURRENT_SLOTS")
    }

    fn release_slot(&self, slot: usize) {
        *self.free_slots.lock() &= !(1 << slot);
    }

    /// Acquires a slot and drives one client message to completion
    /// through `make_transport`, applying the retry policy. The
    /// transport is constructed fresh per message (it owns the memory
    /// mapping for that exchange) but `reopen` on a transport re-finds
    /// the shared window handle, not the mapping. The slot is released
    /// only after the transport (and the mapping it owns) is dropped.
    pub async fn exchange(
        &self,
        request: &[u8],
        make_transport: impl FnOnce(usize) -> Result<Box<dyn PageantTransport>>,
    ) -> Result<Vec<u8>> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .expect("semaphore never closed");
        let slot = self.acquire_slot();
        let _release = SlotRelease {
            adapter: self,
            slot,
        };
        trace!("sending {} byte request to agent window on slot {slot}", request.len());
        let mut transport = make_transport(slot)?;
        send_with_retry(transport.as_mut(), request)
    }
}

/// Releases `slot` back to the free set on drop. Declared before
/// `transport` at each `exchange` call site so it drops after the
/// transport does, mirroring the teacher's `Handler::drop` releasing its
/// token only once the mapping is unmapped and closed.
struct SlotRelease<'a> {
    adapter: &'a SshAdapter,
    slot: usize,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        self.adapter.release_slot(self.slot);
    }
}

#[cfg(windows)]
pub use win32::Win32Transport;

#[cfg(windows)]
mod win32 {
    //! The real Pageant-style IPC: a named file mapping, a `WM_COPYDATA`
    //! message to the agent's window, and `SendMessageTimeoutA` so PIN
    //! entry at the smartcard dialog (tens of seconds) does not trip the
    //! library default (~5s) timeout.

    use super::*;
    use std::ffi::c_void;
    use std::ptr;

    use windows::core::PCSTR;
    use windows::Win32::Foundation::{CloseHandle, HANDLE, HWND, LPARAM, LRESULT, WPARAM};
    use windows::Win32::System::DataExchange::COPYDATASTRUCT;
    use windows::Win32::System::Memory::{
        CreateFileMappingA, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS, PAGE_READWRITE,
    };
    use windows::Win32::UI::WindowsAndMessaging::{
        FindWindowA, SendMessageTimeoutA, SMTO_ABORTIFHUNG, WM_COPYDATA,
    };

    /// A magic value distinguishing this bridge's copy-data payloads, in
    /// the style of PuTTY's Pageant client magic.
    const IPC_MAGIC: usize = 0x804e_50ba;
    const MAPPING_NAME_PREFIX: &str = "wsl_gpg_bridge";
    const AGENT_WINDOW_NAME: &str = "Pageant\0";

    fn last_error_code() -> u32 {
        unsafe { windows::Win32::Foundation::GetLastError().0 }
    }

    struct Mapping {
        handle: HANDLE,
        view: *mut u8,
        name: String,
    }

    impl Mapping {
        fn create(slot: usize) -> std::result::Result<Mapping, AgentRpcFailure> {
            let name = format!("{MAPPING_NAME_PREFIX}-{slot}\0");
            let handle = unsafe {
                CreateFileMappingA(
                    HANDLE(-1),
                    None,
                    PAGE_READWRITE,
                    0,
                    MAX_MESSAGE_LEN as u32,
                    PCSTR(name.as_ptr()),
                )
            }
            .map_err(|_| AgentRpcFailure::classify(last_error_code()))?;
            let view = unsafe { MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, MAX_MESSAGE_LEN) };
            if view.Value.is_null() {
                unsafe {
                    let _ = CloseHandle(handle);
                }
                return Err(AgentRpcFailure::classify(last_error_code()));
            }
            Ok(Mapping {
                handle,
                view: view.Value as *mut u8,
                name,
            })
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            unsafe {
                ptr::write_bytes(self.view, 0, MAX_MESSAGE_LEN);
                let _ = UnmapViewOfFile(windows::Win32::System::Memory::MEMORY_MAPPED_VIEW_ADDRESS {
                    Value: self.view as *mut c_void,
                });
                let _ = CloseHandle(self.handle);
            }
        }
    }

    /// One exchange's worth of shared-memory IPC against the agent's
    /// `Pageant` window. Constructed fresh per message; `reopen`
    /// re-resolves the window handle without reallocating the mapping.
    pub struct Win32Transport {
        mapping: Mapping,
        window: HWND,
    }

    impl Win32Transport {
        pub fn new(slot: usize) -> Result<Win32Transport> {
            let mapping = Mapping::create(slot)
                .map_err(|e| crate::error::BridgeError::AgentRpc(format!("{e:?}")))?;
            let window = find_window()
                .map_err(|e| crate::error::BridgeError::AgentRpc(format!("{e:?}")))?;
            Ok(Win32Transport { mapping, window })
        }
    }

    fn find_window() -> std::result::Result<HWND, AgentRpcFailure> {
        let name = PCSTR(AGENT_WINDOW_NAME.as_ptr());
        let hwnd = unsafe { FindWindowA(name, name) };
        if hwnd.0.is_null() {
            Err(AgentRpcFailure::classify(last_error_code()))
        } else {
            Ok(hwnd)
        }
    }

    impl PageantTransport for Win32Transport {
        fn send(&mut self, request: &[u8]) -> std::result::Result<Vec<u8>, AgentRpcFailure> {
            if request.len() + 4 > MAX_MESSAGE_LEN {
                return Err(AgentRpcFailure::Other(0));
            }
            unsafe {
                ptr::write_bytes(self.mapping.view, 0, MAX_MESSAGE_LEN);
                ptr::copy_nonoverlapping(
                    request.as_ptr(),
                    self.mapping.view,
                    request.len(),
                );
            }
            let mut name_bytes = self.mapping.name.clone().into_bytes();
            let copy_data = COPYDATASTRUCT {
                dwData: IPC_MAGIC,
                cbData: name_bytes.len() as u32,
                lpData: name_bytes.as_mut_ptr() as *mut c_void,
            };
            let mut result = LRESULT(0);
            let ok = unsafe {
                SendMessageTimeoutA(
                    self.window,
                    WM_COPYDATA,
                    WPARAM(0),
                    LPARAM(&copy_data as *const _ as isize),
                    SMTO_ABORTIFHUNG,
                    SEND_TIMEOUT.as_millis() as u32,
                    Some(&mut result as *mut LRESULT as *mut usize),
                )
            };
            if ok.0 == 0 {
                return Err(AgentRpcFailure::classify(last_error_code()));
            }
            let len = u32::from_be_bytes(unsafe {
                [
                    *self.mapping.view,
                    *self.mapping.view.add(1),
                    *self.mapping.view.add(2),
                    *self.mapping.view.add(3),
                ]
            }) as usize;
            if len + 4 > MAX_MESSAGE_LEN {
                return Err(AgentRpcFailure::Other(0));
            }
            let reply = unsafe {
                std::slice::from_raw_parts(self.mapping.view, len + 4).to_vec()
            };
            Ok(reply)
        }

        fn reopen(&mut self) -> std::result::Result<(), AgentRpcFailure> {
            self.window = find_window()?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FlakyTransport {
        failures_left: Cell<u32>,
        kind: AgentRpcFailure,
        reopened: Cell<bool>,
    }

    impl PageantTransport for FlakyTransport {
        fn send(&mut self, _request: &[u8]) -> std::result::Result<Vec<u8>, AgentRpcFailure> {
            let left = self.failures_left.get();
            if left > 0 {
                self.failures_left.set(left - 1);
                return Err(self.kind);
            }
            Ok(b"reply".to_vec())
        }

        fn reopen(&mut self) -> std::result::Result<(), AgentRpcFailure> {
            self.reopened.set(true);
            Ok(())
        }
    }

    struct AlwaysFails;
    impl PageantTransport for AlwaysFails {
        fn send(&mut self, _request: &[u8]) -> std::result::Result<Vec<u8>, AgentRpcFailure> {
            Err(AgentRpcFailure::Timeout)
        }
        fn reopen(&mut self) -> std::result::Result<(), AgentRpcFailure> {
            Ok(())
        }
    }

    #[test]
    fn timeout_retried_up_to_three_times_then_succeeds() {
        let mut t = FlakyTransport {
            failures_left: Cell::new(2),
            kind: AgentRpcFailure::Timeout,
            reopened: Cell::new(false),
        };
        let reply = send_with_retry(&mut t, b"hi").unwrap();
        assert_eq!(reply, b"reply");
    }

    #[test]
    fn timeout_exhausts_after_three_retries() {
        let mut t = AlwaysFails;
        let err = send_with_retry(&mut t, b"hi").unwrap_err();
        assert!(matches!(err, BridgeError::AgentRpc(_)));
    }

    #[test]
    fn invalid_window_handle_reopens_before_retry() {
        let mut t = FlakyTransport {
            failures_left: Cell::new(1),
            kind: AgentRpcFailure::InvalidWindowHandle,
            reopened: Cell::new(false),
        };
        let reply = send_with_retry(&mut t, b"hi").unwrap();
        assert_eq!(reply, b"reply");
        assert!(t.reopened.get());
    }

    #[test]
    fn classify_maps_known_win32_codes() {
        assert_eq!(AgentRpcFailure::classify(1460), AgentRpcFailure::Timeout);
        assert_eq!(
            AgentRpcFailure::classify(1400),
            AgentRpcFailure::InvalidWindowHandle
        );
        assert_eq!(AgentRpcFailure::classify(5), AgentRpcFailure::Other(5));
    }
}
