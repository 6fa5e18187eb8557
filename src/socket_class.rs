//! The four logical agent endpoints bridged between the subsystem and the
//! host, and how each maps onto a port offset and a forwarding mode.

use std::fmt;

/// Byte-stream splicing to a loopback Assuan-style endpoint, or the
/// Windows message-copy IPC used for SSH key operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardMode {
    Assuan,
    WindowsMessageCopy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketClass {
    AgentMain,
    AgentExtra,
    AgentBrowser,
    AgentSsh,
}

impl SocketClass {
    /// All classes in port-offset order. Callers filter out `AgentSsh`
    /// themselves when `enable_ssh` is false.
    pub const ALL: [SocketClass; 4] = [
        SocketClass::AgentMain,
        SocketClass::AgentExtra,
        SocketClass::AgentBrowser,
        SocketClass::AgentSsh,
    ];

    /// Canonical name used to query gpgconf for the subsystem-side socket
    /// path and to name the class in logs.
    pub fn gpgconf_name(&self) -> &'static str {
        match self {
            SocketClass::AgentMain => "agent-socket",
            SocketClass::AgentExtra => "agent-extra-socket",
            SocketClass::AgentBrowser => "agent-browser-socket",
            SocketClass::AgentSsh => "agent-ssh-socket",
        }
    }

    /// Index 0..3; the TCP port between inner and outer is `base_port + index`.
    pub fn index(&self) -> u16 {
        match self {
            SocketClass::AgentMain => 0,
            SocketClass::AgentExtra => 1,
            SocketClass::AgentBrowser => 2,
            SocketClass::AgentSsh => 3,
        }
    }

    pub fn port(&self, base_port: u16) -> u16 {
        base_port + self.index()
    }

    pub fn forward_mode(&self) -> ForwardMode {
        match self {
            SocketClass::AgentSsh => ForwardMode::WindowsMessageCopy,
            _ => ForwardMode::Assuan,
        }
    }

    /// Classes enabled for the given configuration: the first three
    /// always, `AgentSsh` only when `enable_ssh` is set.
    pub fn enabled(enable_ssh: bool) -> Vec<SocketClass> {
        SocketClass::ALL
            .into_iter()
            .filter(|c| enable_ssh || c.forward_mode() != ForwardMode::WindowsMessageCopy)
            .collect()
    }
}

impl fmt::Display for SocketClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.gpgconf_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_contiguous_from_base() {
        assert_eq!(SocketClass::AgentMain.port(6910), 6910);
        assert_eq!(SocketClass::AgentExtra.port(6910), 6911);
        assert_eq!(SocketClass::AgentBrowser.port(6910), 6912);
        assert_eq!(SocketClass::AgentSsh.port(6910), 6913);
    }

    #[test]
    fn ssh_excluded_unless_enabled() {
        assert_eq!(SocketClass::enabled(false).len(), 3);
        assert_eq!(SocketClass::enabled(true).len(), 4);
        assert!(!SocketClass::enabled(false).contains(&SocketClass::AgentSsh));
    }

    #[test]
    fn forward_modes_match_spec() {
        assert_eq!(SocketClass::AgentMain.forward_mode(), ForwardMode::Assuan);
        assert_eq!(SocketClass::AgentExtra.forward_mode(), ForwardMode::Assuan);
        assert_eq!(
            SocketClass::AgentBrowser.forward_mode(),
            ForwardMode::Assuan
        );
        assert_eq!(
            SocketClass::AgentSsh.forward_mode(),
            ForwardMode::WindowsMessageCopy
        );
    }
}
